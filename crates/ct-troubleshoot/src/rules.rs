use crate::diagnostics::{DiagnosticLevel, DiagnosticResult};
use ct_core::{Chain, FirewallStatus, Table};
use ct_ipt::{ChainStatusCollector, RuleBackend};

/// Checks on the live rule tables themselves.
pub struct RuleDiagnostics<B> {
    status: ChainStatusCollector<B>,
}

impl<B: RuleBackend> RuleDiagnostics<B> {
    pub fn new(status: ChainStatusCollector<B>) -> Self {
        Self { status }
    }

    pub async fn diagnose(&self) -> anyhow::Result<Vec<DiagnosticResult>> {
        let status = self.status.collect().await;
        Ok(status_findings(&status))
    }
}

pub fn status_findings(status: &FirewallStatus) -> Vec<DiagnosticResult> {
    let mut results = Vec::new();

    for failure in &status.failures {
        results.push(
            DiagnosticResult::new(
                DiagnosticLevel::Error,
                format!("Cannot list {}", failure.key),
                failure.error.clone(),
            )
            .with_suggestion("Check privileges and that the table's kernel module is available")
            .with_command(format!(
                "sudo {} -t {} -L {} -n",
                status.binary, failure.key.table, failure.key.chain
            )),
        );
    }

    for chain in &status.chains {
        let drops = chain
            .policy
            .as_deref()
            .is_some_and(|p| p.eq_ignore_ascii_case("DROP"));

        if drops && chain.rules == 0 && chain.key.table == Table::Filter {
            let level = if chain.key.chain == Chain::Input {
                DiagnosticLevel::Critical
            } else {
                DiagnosticLevel::Warning
            };
            results.push(
                DiagnosticResult::new(
                    level,
                    format!("{} drops everything", chain.key),
                    "Default policy is DROP and the chain has no rules",
                )
                .with_suggestion("Add accept rules for the traffic you need, or reset the policy")
                .with_command(format!(
                    "sudo {} -P {} ACCEPT",
                    status.binary, chain.key.chain
                )),
            );
        }

        if chain.opaque > 0 {
            results.push(
                DiagnosticResult::new(
                    DiagnosticLevel::Info,
                    format!("{}: {} rule(s) not modelled", chain.key, chain.opaque),
                    "These rows use matches or targets cocotap does not understand; \
                     they are shown verbatim and their deletion cannot be undone",
                ),
            );
        }
    }

    if status.failures.is_empty() && status.total_rules() == 0 {
        results.push(DiagnosticResult::info(
            "No rules installed",
            format!("All {} chains are empty", status.chains.len()),
        ));
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use ct_core::{ChainFailure, ChainKey, ChainStatus};
    use ct_ipt::CommandExecutor;
    use ct_ipt::sim::{Fault, Op, SimulatedBackend};
    use std::sync::Arc;

    fn chain(table: Table, chain: Chain, policy: &str, rules: usize, opaque: usize) -> ChainStatus {
        ChainStatus {
            key: ChainKey::new(table, chain).unwrap(),
            policy: Some(policy.into()),
            rules,
            opaque,
            packets: 0,
            bytes: 0,
        }
    }

    #[test]
    fn test_drop_policy_on_empty_input_is_critical() {
        let mut status = FirewallStatus::new("iptables");
        status.chains.push(chain(Table::Filter, Chain::Input, "DROP", 0, 0));
        status.chains.push(chain(Table::Filter, Chain::Forward, "DROP", 0, 0));

        let results = status_findings(&status);
        assert_eq!(results[0].level, DiagnosticLevel::Critical);
        assert_eq!(results[1].level, DiagnosticLevel::Warning);
        assert_eq!(results[0].command.as_deref(), Some("sudo iptables -P INPUT ACCEPT"));
    }

    #[test]
    fn test_failures_and_opaque_rows() {
        let mut status = FirewallStatus::new("iptables");
        status.chains.push(chain(Table::Filter, Chain::Input, "ACCEPT", 4, 2));
        status.failures.push(ChainFailure {
            key: ChainKey::new(Table::Nat, Chain::Prerouting).unwrap(),
            error: "iptables: Permission denied (you must be root).".into(),
        });

        let results = status_findings(&status);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].level, DiagnosticLevel::Error);
        assert!(results[0].command.as_deref().unwrap().contains("-t nat -L PREROUTING"));
        assert!(results[1].title.contains("2 rule(s) not modelled"));
    }

    #[tokio::test]
    async fn test_diagnose_live_chains() {
        let sim = SimulatedBackend::new();
        sim.inject(Op::List, Fault::fail(4, "iptables: Permission denied (you must be root).\n"));
        let diag = RuleDiagnostics::new(ChainStatusCollector::new(Arc::new(CommandExecutor::new(sim))));

        let results = diag.diagnose().await.unwrap();
        assert_eq!(
            results.iter().filter(|r| r.level == DiagnosticLevel::Error).count(),
            1
        );
        assert!(!results.iter().any(|r| r.title == "No rules installed"));
    }
}
