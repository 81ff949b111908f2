use crate::backend::RuleBackend;
use crate::executor::CommandExecutor;
use ct_core::{ChainFailure, ChainKey, ChainStatus, FirewallStatus};
use std::sync::Arc;

/// Lists every built-in chain and summarises it.
pub struct ChainStatusCollector<B> {
    executor: Arc<CommandExecutor<B>>,
}

impl<B: RuleBackend> ChainStatusCollector<B> {
    pub fn new(executor: Arc<CommandExecutor<B>>) -> Self {
        Self { executor }
    }

    /// Collects all chains. A chain that cannot be listed is reported as a
    /// failure instead of aborting the whole collection.
    pub async fn collect(&self) -> FirewallStatus {
        let mut status = FirewallStatus::new(self.executor.backend().program());

        for key in ChainKey::all() {
            match self.collect_chain(key).await {
                Ok(chain) => status.chains.push(chain),
                Err(e) => {
                    tracing::warn!(%key, error = %e, "failed to list chain");
                    status.failures.push(ChainFailure {
                        key,
                        error: e.to_string(),
                    });
                }
            }
        }

        status
    }

    pub async fn collect_chain(&self, key: ChainKey) -> Result<ChainStatus, ct_core::Error> {
        let listing = self.executor.list(key).await?;
        let totals = listing.totals();

        Ok(ChainStatus {
            key,
            rules: listing.rows.len(),
            opaque: listing.opaque_count(),
            policy: listing.policy,
            packets: totals.packets,
            bytes: totals.bytes,
        })
    }
}
