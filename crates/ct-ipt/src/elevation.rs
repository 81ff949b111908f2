//! Privilege elevation for the rule-table tool.
//!
//! The tool is resolved once into a [`Launcher`]: the program to spawn and
//! the arguments that precede the rule-table arguments. Arguments are always
//! passed as discrete process arguments, never through a shell.
//!
//! Resolution order:
//!
//! 1. `COCOTAP_ELEVATION` environment override (`none`, `sudo`, `pkexec`, `run0`)
//! 2. the configured [`Elevation`] method
//! 3. no elevation when already running as root
//! 4. `auto`: the first of `run0`, `sudo`, `pkexec` found in `PATH`

use ct_core::Elevation;
use std::path::PathBuf;

pub const ELEVATION_ENV: &str = "COCOTAP_ELEVATION";

#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    #[error("elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(&'static str),

    #[error("invalid COCOTAP_ELEVATION '{0}'. Valid options: none, sudo, pkexec, run0")]
    InvalidMethod(String),

    #[error("not running as root and none of run0, sudo or pkexec is installed")]
    NoMethodAvailable,
}

/// Program plus leading arguments used to start the rule-table tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launcher {
    pub program: String,
    pub prefix: Vec<String>,
}

impl Launcher {
    pub fn direct(binary: &str) -> Self {
        Self {
            program: binary.to_string(),
            prefix: Vec::new(),
        }
    }

    fn via(method: &str, binary: &str) -> Self {
        Self {
            program: method.to_string(),
            prefix: vec![binary.to_string()],
        }
    }

    /// Human-readable command line for logs, e.g. `sudo iptables`.
    pub fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.prefix.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Resolves the launcher for `binary` in the current environment.
pub fn resolve(binary: &str, method: Elevation) -> Result<Launcher, ElevationError> {
    let method = match std::env::var(ELEVATION_ENV) {
        Ok(value) if !value.trim().is_empty() => parse_method(&value)?,
        _ => method,
    };
    let is_root = nix::unistd::geteuid().is_root();
    resolve_with(binary, method, is_root, binary_exists)
}

fn parse_method(value: &str) -> Result<Elevation, ElevationError> {
    match value.trim().to_lowercase().as_str() {
        "auto" => Ok(Elevation::Auto),
        "none" => Ok(Elevation::None),
        "sudo" => Ok(Elevation::Sudo),
        "pkexec" => Ok(Elevation::Pkexec),
        "run0" => Ok(Elevation::Run0),
        _ => Err(ElevationError::InvalidMethod(value.to_string())),
    }
}

pub(crate) fn resolve_with(
    binary: &str,
    method: Elevation,
    is_root: bool,
    exists: impl Fn(&str) -> bool,
) -> Result<Launcher, ElevationError> {
    let explicit = |name: &'static str| {
        if exists(name) {
            Ok(Launcher::via(name, binary))
        } else {
            Err(ElevationError::MethodNotAvailable(name))
        }
    };

    match method {
        Elevation::None => Ok(Launcher::direct(binary)),
        Elevation::Sudo => explicit("sudo"),
        Elevation::Pkexec => explicit("pkexec"),
        Elevation::Run0 => explicit("run0"),
        Elevation::Auto if is_root => Ok(Launcher::direct(binary)),
        Elevation::Auto => ["run0", "sudo", "pkexec"]
            .into_iter()
            .find(|name| exists(name))
            .map(|name| Launcher::via(name, binary))
            .ok_or(ElevationError::NoMethodAvailable),
    }
}

/// Finds a binary in `PATH`.
pub fn find_binary(name: &str) -> Option<PathBuf> {
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(name))
            .find(|path| path.is_file())
    })
}

pub fn binary_exists(name: &str) -> bool {
    find_binary(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_exists() {
        assert!(binary_exists("sh"));
        assert!(!binary_exists("cocotap_nonexistent_binary_xyz"));
    }

    #[test]
    fn test_root_runs_directly() {
        let launcher = resolve_with("iptables", Elevation::Auto, true, |_| true).unwrap();
        assert_eq!(launcher, Launcher::direct("iptables"));
        assert_eq!(launcher.describe(), "iptables");
    }

    #[test]
    fn test_auto_prefers_run0() {
        let launcher = resolve_with("iptables", Elevation::Auto, false, |_| true).unwrap();
        assert_eq!(launcher.describe(), "run0 iptables");

        let launcher =
            resolve_with("iptables", Elevation::Auto, false, |name| name == "pkexec").unwrap();
        assert_eq!(launcher.program, "pkexec");
        assert_eq!(launcher.prefix, vec!["iptables".to_string()]);
    }

    #[test]
    fn test_auto_without_any_method() {
        assert!(matches!(
            resolve_with("iptables", Elevation::Auto, false, |_| false),
            Err(ElevationError::NoMethodAvailable)
        ));
    }

    #[test]
    fn test_explicit_method_must_exist() {
        assert!(matches!(
            resolve_with("iptables", Elevation::Sudo, true, |_| false),
            Err(ElevationError::MethodNotAvailable("sudo"))
        ));
        let launcher = resolve_with("ip6tables", Elevation::Sudo, true, |_| true).unwrap();
        assert_eq!(launcher.describe(), "sudo ip6tables");
    }

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method("SUDO").unwrap(), Elevation::Sudo);
        assert_eq!(parse_method(" none ").unwrap(), Elevation::None);
        assert!(matches!(
            parse_method("doas"),
            Err(ElevationError::InvalidMethod(_))
        ));
    }
}
