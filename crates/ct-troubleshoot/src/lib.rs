pub mod diagnostics;
pub mod iptables;
pub mod kernel;
pub mod rules;

pub use diagnostics::{DiagnosticLevel, DiagnosticReport, DiagnosticResult, Tally};
pub use iptables::IptablesDiagnostics;
pub use kernel::KernelDiagnostics;
pub use rules::RuleDiagnostics;

use ct_core::BackendConfig;
use ct_ipt::{ChainStatusCollector, CommandExecutor, RuleBackend};
use std::sync::Arc;

/// Main troubleshooting interface
pub struct Troubleshooter<B> {
    iptables: IptablesDiagnostics,
    kernel: KernelDiagnostics,
    rules: RuleDiagnostics<B>,
}

impl<B: RuleBackend> Troubleshooter<B> {
    pub fn new(backend: BackendConfig, executor: Arc<CommandExecutor<B>>) -> Self {
        Self {
            iptables: IptablesDiagnostics::new(backend),
            kernel: KernelDiagnostics::new(),
            rules: RuleDiagnostics::new(ChainStatusCollector::new(executor)),
        }
    }

    /// Run all diagnostics and generate comprehensive report
    pub async fn run_all(&self) -> anyhow::Result<DiagnosticReport> {
        let mut report = DiagnosticReport::new();

        let tool = self.iptables.diagnose().await?;
        let blocked = tool.iter().any(|r| r.level == DiagnosticLevel::Critical);
        report.add_section("iptables", tool);

        report.add_section("Kernel", self.kernel.diagnose().await?);

        // Listing needs a working binary.
        if !blocked {
            report.add_section("Rules", self.rules.diagnose().await?);
        }

        Ok(report)
    }

    pub async fn check_iptables(&self) -> anyhow::Result<Vec<DiagnosticResult>> {
        self.iptables.diagnose().await
    }

    pub async fn check_kernel(&self) -> anyhow::Result<Vec<DiagnosticResult>> {
        self.kernel.diagnose().await
    }

    pub async fn check_rules(&self) -> anyhow::Result<Vec<DiagnosticResult>> {
        self.rules.diagnose().await
    }
}
