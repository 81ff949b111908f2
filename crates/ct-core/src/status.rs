use crate::model::ChainKey;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallStatus {
    /// Rule-table tool the status was collected with.
    pub binary: String,
    pub chains: Vec<ChainStatus>,
    pub failures: Vec<ChainFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStatus {
    pub key: ChainKey,
    pub policy: Option<String>,
    pub rules: usize,
    /// Rows that could not be parsed.
    pub opaque: usize,
    pub packets: u64,
    pub bytes: u64,
}

/// A chain whose listing could not be collected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainFailure {
    pub key: ChainKey,
    pub error: String,
}

impl FirewallStatus {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            chains: vec![],
            failures: vec![],
        }
    }

    pub fn total_rules(&self) -> usize {
        self.chains.iter().map(|c| c.rules).sum()
    }

    pub fn chain(&self, key: ChainKey) -> Option<&ChainStatus> {
        self.chains.iter().find(|c| c.key == key)
    }

    pub fn display(&self) {
        println!("📊 Firewall Status ({})\n", self.binary);

        let mut current_table = None;
        for chain in &self.chains {
            if current_table != Some(chain.key.table) {
                println!("🧱 Table {}:", chain.key.table);
                current_table = Some(chain.key.table);
            }
            let policy = chain.policy.as_deref().unwrap_or("-");
            print!(
                "  • {:<12} policy {:<7} {:>4} rules",
                chain.key.chain.as_str(),
                policy,
                chain.rules
            );
            if chain.opaque > 0 {
                print!(" ({} unparsed)", chain.opaque);
            }
            println!("  {} pkts / {} bytes", chain.packets, chain.bytes);
        }

        if !self.failures.is_empty() {
            println!("\n⚠️  Unavailable chains ({}):", self.failures.len());
            for failure in &self.failures {
                println!("  • {}: {}", failure.key, failure.error);
            }
        }

        println!("\nTotal rules: {}", self.total_rules());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Chain, Table};

    #[test]
    fn test_totals() {
        let mut status = FirewallStatus::new("iptables");
        for (chain, rules) in [(Chain::Input, 3), (Chain::Output, 2)] {
            status.chains.push(ChainStatus {
                key: ChainKey::new(Table::Filter, chain).unwrap(),
                policy: Some("ACCEPT".into()),
                rules,
                opaque: 0,
                packets: 0,
                bytes: 0,
            });
        }

        assert_eq!(status.total_rules(), 5);
        assert_eq!(
            status
                .chain(ChainKey::new(Table::Filter, Chain::Output).unwrap())
                .map(|c| c.rules),
            Some(2)
        );
        assert!(status
            .chain(ChainKey::new(Table::Nat, Chain::Output).unwrap())
            .is_none());
    }
}
