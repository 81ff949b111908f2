use crate::diagnostics::{DiagnosticLevel, DiagnosticResult};
use ct_core::BackendConfig;
use ct_ipt::elevation::{self, binary_exists};
use regex::Regex;
use std::sync::LazyLock;
use tokio::process::Command;

static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"v(\d+(?:\.\d+)+)(?:\s+\((legacy|nf_tables)\))?").unwrap()
});

/// Output of `iptables --version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolVersion {
    pub version: String,
    /// `legacy` or `nf_tables`, when the binary reports it.
    pub variant: Option<String>,
}

pub fn parse_version(text: &str) -> Option<ToolVersion> {
    let cap = VERSION_RE.captures(text)?;
    Some(ToolVersion {
        version: cap[1].to_string(),
        variant: cap.get(2).map(|m| m.as_str().to_string()),
    })
}

/// Firewall managers that rewrite the same tables behind our back.
const COMPETING_SERVICES: &[(&str, &str)] = &[
    ("ufw", "ufw reloads its own chains and may drop manual rules"),
    ("firewalld", "firewalld flushes rules it does not own on reload"),
    ("nftables", "the nftables service replaces the ruleset on restart"),
];

/// Binary, privilege and coexistence checks.
pub struct IptablesDiagnostics {
    backend: BackendConfig,
}

impl IptablesDiagnostics {
    pub fn new(backend: BackendConfig) -> Self {
        Self { backend }
    }

    pub async fn diagnose(&self) -> anyhow::Result<Vec<DiagnosticResult>> {
        let mut results = Vec::new();

        if !binary_exists(&self.backend.binary) {
            results.push(
                DiagnosticResult::new(
                    DiagnosticLevel::Critical,
                    format!("{} not found", self.backend.binary),
                    format!("The {} command is not in PATH", self.backend.binary),
                )
                .with_suggestion("Install the iptables package")
                .with_command("sudo pacman -S iptables-nft"),
            );
            return Ok(results);
        }

        results.push(self.check_version().await);
        results.push(self.check_privileges());
        results.extend(self.check_competing_managers().await);

        Ok(results)
    }

    async fn check_version(&self) -> DiagnosticResult {
        let output = Command::new(&self.backend.binary)
            .arg("--version")
            .output()
            .await;

        let text = match output {
            Ok(output) => String::from_utf8_lossy(&output.stdout).into_owned(),
            Err(e) => {
                return DiagnosticResult::new(
                    DiagnosticLevel::Error,
                    format!("Failed to run {}", self.backend.binary),
                    e.to_string(),
                );
            }
        };
        version_finding(&self.backend.binary, &text)
    }

    fn check_privileges(&self) -> DiagnosticResult {
        match elevation::resolve(&self.backend.binary, self.backend.elevation) {
            Ok(launcher) if launcher.prefix.is_empty() => DiagnosticResult::info(
                "Running with privileges",
                format!("Rules are changed by running {} directly", launcher.program),
            ),
            Ok(launcher) => DiagnosticResult::info(
                "Privilege elevation",
                format!("Rules are changed through '{}'", launcher.describe()),
            )
            .with_suggestion("Non-interactive use needs a passwordless rule for this command"),
            Err(e) => DiagnosticResult::new(
                DiagnosticLevel::Critical,
                "No way to gain root privileges",
                e.to_string(),
            )
            .with_suggestion("Run as root, or install sudo and set backend.elevation"),
        }
    }

    async fn check_competing_managers(&self) -> Vec<DiagnosticResult> {
        if !binary_exists("systemctl") {
            return Vec::new();
        }

        let mut results = Vec::new();
        for (service, impact) in COMPETING_SERVICES {
            let output = Command::new("systemctl")
                .args(["is-active", service])
                .output()
                .await;

            if let Ok(output) = output {
                if String::from_utf8_lossy(&output.stdout).trim() == "active" {
                    results.push(
                        DiagnosticResult::new(
                            DiagnosticLevel::Warning,
                            format!("{} is active", service),
                            impact.to_string(),
                        )
                        .with_suggestion("Manage rules through one tool only")
                        .with_command(format!("sudo systemctl disable --now {}", service)),
                    );
                }
            }
        }
        results
    }
}

/// Finding for the text printed by `BINARY --version`.
pub fn version_finding(binary: &str, text: &str) -> DiagnosticResult {
    match parse_version(text) {
        Some(ToolVersion {
            version,
            variant: Some(variant),
        }) if variant == "nf_tables" => DiagnosticResult::info(
            format!("{} {} (nf_tables)", binary, version),
            "Rules are stored in nftables and also appear in 'nft list ruleset'",
        ),
        Some(ToolVersion {
            version,
            variant: Some(variant),
        }) => DiagnosticResult::info(
            format!("{} {} ({})", binary, version, variant),
            "Using the legacy xtables backend",
        )
        .with_suggestion("Do not mix with iptables-nft; rules of the other backend stay invisible"),
        Some(ToolVersion { version, .. }) => DiagnosticResult::info(
            format!("{} {}", binary, version),
            "The backend variant is not reported by this version",
        ),
        None => DiagnosticResult::new(
            DiagnosticLevel::Warning,
            format!("Unrecognised {} version", binary),
            format!("'{}' does not look like an iptables version string", text.trim()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version("iptables v1.8.10 (nf_tables)\n"),
            Some(ToolVersion {
                version: "1.8.10".into(),
                variant: Some("nf_tables".into()),
            })
        );
        assert_eq!(
            parse_version("iptables v1.8.7 (legacy)").unwrap().variant.as_deref(),
            Some("legacy")
        );
        assert_eq!(parse_version("iptables v1.4.21").unwrap().variant, None);
        assert_eq!(parse_version("command not found"), None);
    }

    #[test]
    fn test_version_findings() {
        let nft = version_finding("iptables", "iptables v1.8.10 (nf_tables)");
        assert_eq!(nft.level, DiagnosticLevel::Info);
        assert!(nft.title.contains("nf_tables"));

        let legacy = version_finding("iptables", "iptables v1.8.7 (legacy)");
        assert!(legacy.suggestion.is_some());

        let odd = version_finding("iptables", "garbage");
        assert_eq!(odd.level, DiagnosticLevel::Warning);
    }

    #[tokio::test]
    async fn test_missing_binary_is_critical() {
        let diag = IptablesDiagnostics::new(BackendConfig {
            binary: "cocotap-no-such-iptables".into(),
            ..Default::default()
        });
        let results = diag.diagnose().await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].level, DiagnosticLevel::Critical);
    }
}
