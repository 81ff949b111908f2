use crate::diagnostics::{DiagnosticLevel, DiagnosticResult};
use std::path::PathBuf;

const REQUIRED_MODULES: &[(&str, &str)] = &[
    ("ip_tables", "Core iptables support"),
    ("iptable_filter", "filter table"),
    ("iptable_nat", "nat table"),
    ("nf_nat", "NAT support"),
    ("xt_comment", "Rule comments"),
    ("xt_tcpudp", "Port matches"),
];

/// Kernel module and sysctl checks, read from procfs.
pub struct KernelDiagnostics {
    proc_root: PathBuf,
}

impl KernelDiagnostics {
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    pub fn with_proc_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
        }
    }

    pub async fn diagnose(&self) -> anyhow::Result<Vec<DiagnosticResult>> {
        let mut results = Vec::new();

        match tokio::fs::read_to_string(self.proc_root.join("modules")).await {
            Ok(modules) => results.extend(module_findings(&modules)),
            Err(e) => tracing::debug!(error = %e, "cannot read module list"),
        }

        let forwarding = self.proc_root.join("sys/net/ipv4/ip_forward");
        if let Ok(value) = tokio::fs::read_to_string(forwarding).await {
            results.push(forwarding_finding(&value));
        }

        Ok(results)
    }
}

impl Default for KernelDiagnostics {
    fn default() -> Self {
        Self::new()
    }
}

/// Findings for the contents of `/proc/modules`.
pub fn module_findings(modules: &str) -> Vec<DiagnosticResult> {
    let loaded: Vec<&str> = modules
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .collect();

    REQUIRED_MODULES
        .iter()
        .map(|(module, description)| {
            if loaded.contains(module) {
                DiagnosticResult::info(
                    format!("Kernel module: {}", module),
                    format!("{} is loaded", description),
                )
            } else {
                // Built-in modules never show up in /proc/modules.
                DiagnosticResult::new(
                    DiagnosticLevel::Warning,
                    format!("Kernel module not loaded: {}", module),
                    format!("{} is not loaded as a module (it may be built in)", description),
                )
                .with_command(format!("sudo modprobe {}", module))
            }
        })
        .collect()
}

/// Finding for the value of `net.ipv4.ip_forward`.
pub fn forwarding_finding(value: &str) -> DiagnosticResult {
    if value.trim() == "1" {
        DiagnosticResult::info("IP forwarding enabled", "net.ipv4.ip_forward = 1")
    } else {
        DiagnosticResult::new(
            DiagnosticLevel::Warning,
            "IP forwarding disabled",
            "net.ipv4.ip_forward = 0 - FORWARD and nat rules have no effect on routed traffic",
        )
        .with_suggestion("Enable forwarding if this host routes or NATs traffic")
        .with_command("sudo sysctl -w net.ipv4.ip_forward=1")
    }
}
