use anyhow::Result;
use axum::{Router, routing::get};
use ct_core::{ChainKey, FirewallStatus};
use ct_ipt::{ChainStatusCollector, RuleBackend};
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Prometheus metrics for the managed chains.
pub struct MetricsCollector {
    registry: Arc<Registry>,

    // Per-chain listing metrics
    chain_rules: IntGaugeVec,
    chain_opaque_rules: IntGaugeVec,
    chain_packets: IntGaugeVec,
    chain_bytes: IntGaugeVec,
    chain_policy_drop: IntGaugeVec,
    scrape_failures: IntCounterVec,

    // Mutation metrics
    mutations: IntCounterVec,
    mutation_failures: IntCounterVec,
}

fn chain_labels(key: &ChainKey) -> [&'static str; 2] {
    [key.table.as_str(), key.chain.as_str()]
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let labels = &["table", "chain"];

        let chain_rules = IntGaugeVec::new(
            Opts::new("cocotap_chain_rules", "Number of rules in a chain"),
            labels,
        )?;
        registry.register(Box::new(chain_rules.clone()))?;

        let chain_opaque_rules = IntGaugeVec::new(
            Opts::new(
                "cocotap_chain_opaque_rules",
                "Rules whose listing row could not be parsed",
            ),
            labels,
        )?;
        registry.register(Box::new(chain_opaque_rules.clone()))?;

        let chain_packets = IntGaugeVec::new(
            Opts::new("cocotap_chain_packets", "Packets matched by the chain's rules"),
            labels,
        )?;
        registry.register(Box::new(chain_packets.clone()))?;

        let chain_bytes = IntGaugeVec::new(
            Opts::new("cocotap_chain_bytes", "Bytes matched by the chain's rules"),
            labels,
        )?;
        registry.register(Box::new(chain_bytes.clone()))?;

        let chain_policy_drop = IntGaugeVec::new(
            Opts::new(
                "cocotap_chain_policy_drop",
                "Chain default policy (1=DROP, 0=other)",
            ),
            labels,
        )?;
        registry.register(Box::new(chain_policy_drop.clone()))?;

        let scrape_failures = IntCounterVec::new(
            Opts::new(
                "cocotap_scrape_failures_total",
                "Chain listings that failed during a scrape",
            ),
            labels,
        )?;
        registry.register(Box::new(scrape_failures.clone()))?;

        let mutations = IntCounterVec::new(
            Opts::new("cocotap_mutations_total", "Total applied rule mutations"),
            &["table", "chain", "operation"],
        )?;
        registry.register(Box::new(mutations.clone()))?;

        let mutation_failures = IntCounterVec::new(
            Opts::new(
                "cocotap_mutation_failures_total",
                "Total failed rule mutations",
            ),
            &["table", "chain", "reason"],
        )?;
        registry.register(Box::new(mutation_failures.clone()))?;

        Ok(Self {
            registry,
            chain_rules,
            chain_opaque_rules,
            chain_packets,
            chain_bytes,
            chain_policy_drop,
            scrape_failures,
            mutations,
            mutation_failures,
        })
    }

    /// Update chain gauges from a status collection
    pub fn update_status(&self, status: &FirewallStatus) {
        for chain in &status.chains {
            let labels = chain_labels(&chain.key);
            self.chain_rules
                .with_label_values(&labels)
                .set(chain.rules as i64);
            self.chain_opaque_rules
                .with_label_values(&labels)
                .set(chain.opaque as i64);
            // Counters above i64::MAX are clamped.
            self.chain_packets
                .with_label_values(&labels)
                .set(i64::try_from(chain.packets).unwrap_or(i64::MAX));
            self.chain_bytes
                .with_label_values(&labels)
                .set(i64::try_from(chain.bytes).unwrap_or(i64::MAX));
            if let Some(policy) = &chain.policy {
                let drop = if policy.eq_ignore_ascii_case("DROP") { 1 } else { 0 };
                self.chain_policy_drop.with_label_values(&labels).set(drop);
            }
        }

        for failure in &status.failures {
            self.scrape_failures
                .with_label_values(&chain_labels(&failure.key))
                .inc();
        }
    }

    /// Record an applied mutation
    pub fn record_mutation(&self, key: &ChainKey, operation: &str) {
        let [table, chain] = chain_labels(key);
        self.mutations
            .with_label_values(&[table, chain, operation])
            .inc();
    }

    /// Record a failed mutation
    pub fn record_mutation_failure(&self, key: &ChainKey, reason: &str) {
        let [table, chain] = chain_labels(key);
        self.mutation_failures
            .with_label_values(&[table, chain, reason])
            .inc();
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Render metrics in Prometheus text format
    pub fn render_metrics(&self) -> Result<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// HTTP server for Prometheus metrics endpoint
pub struct MetricsServer {
    collector: Arc<MetricsCollector>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(collector: MetricsCollector, addr: SocketAddr) -> Self {
        Self {
            collector: Arc::new(collector),
            addr,
        }
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    /// Lists every chain each `interval` and feeds the gauges.
    pub fn spawn_scraper<B>(
        &self,
        status: ChainStatusCollector<B>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()>
    where
        B: RuleBackend + 'static,
    {
        let collector = self.collector.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let snapshot = status.collect().await;
                tracing::debug!(
                    chains = snapshot.chains.len(),
                    failures = snapshot.failures.len(),
                    "scraped chains"
                );
                collector.update_status(&snapshot);
            }
        })
    }

    /// Start the metrics HTTP server
    pub async fn serve(self) -> Result<()> {
        let collector = self.collector.clone();

        let app = Router::new().route(
            "/metrics",
            get(move || {
                let collector = collector.clone();
                async move {
                    match collector.render_metrics() {
                        Ok(metrics) => metrics,
                        Err(e) => format!("# Error rendering metrics: {}", e),
                    }
                }
            }),
        );

        println!("📊 Metrics server listening on http://{}/metrics", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
