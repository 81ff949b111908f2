use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity level for diagnostic findings
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    /// Informational - no action needed
    Info,
    /// Warning - potential issue
    Warning,
    /// Error - requires attention
    Error,
    /// Critical - rule changes will not work
    Critical,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (symbol, name) = match self {
            DiagnosticLevel::Info => ("ℹ️", "INFO"),
            DiagnosticLevel::Warning => ("⚠️", "WARN"),
            DiagnosticLevel::Error => ("❌", "ERROR"),
            DiagnosticLevel::Critical => ("🔥", "CRITICAL"),
        };
        write!(f, "{} {}", symbol, name)
    }
}

/// A single diagnostic result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticResult {
    pub level: DiagnosticLevel,
    pub title: String,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl DiagnosticResult {
    pub fn new(level: DiagnosticLevel, title: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            details: details.into(),
            suggestion: None,
            command: None,
        }
    }

    pub fn info(title: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(DiagnosticLevel::Info, title, details)
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }
}

impl fmt::Display for DiagnosticResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.level, self.title)?;
        writeln!(f, "    {}", self.details)?;
        if let Some(suggestion) = &self.suggestion {
            writeln!(f, "    💡 {}", suggestion)?;
        }
        if let Some(command) = &self.command {
            writeln!(f, "    $ {}", command)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticSection {
    pub name: String,
    pub results: Vec<DiagnosticResult>,
}

/// Complete diagnostic report
#[derive(Debug, Default, Serialize)]
pub struct DiagnosticReport {
    sections: Vec<DiagnosticSection>,
}

impl DiagnosticReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_section(&mut self, name: impl Into<String>, results: Vec<DiagnosticResult>) {
        self.sections.push(DiagnosticSection {
            name: name.into(),
            results,
        });
    }

    pub fn sections(&self) -> &[DiagnosticSection] {
        &self.sections
    }

    pub fn has_errors(&self) -> bool {
        self.results().any(|r| r.level >= DiagnosticLevel::Error)
    }

    pub fn has_warnings(&self) -> bool {
        self.results().any(|r| r.level == DiagnosticLevel::Warning)
    }

    fn results(&self) -> impl Iterator<Item = &DiagnosticResult> {
        self.sections.iter().flat_map(|s| s.results.iter())
    }

    /// Findings per level, ignoring info.
    pub fn tally(&self) -> Tally {
        self.results().fold(Tally::default(), |mut tally, r| {
            match r.level {
                DiagnosticLevel::Info => {}
                DiagnosticLevel::Warning => tally.warnings += 1,
                DiagnosticLevel::Error => tally.errors += 1,
                DiagnosticLevel::Critical => tally.critical += 1,
            }
            tally
        })
    }

    pub fn display(&self) {
        print!("{}", self);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub warnings: usize,
    pub errors: usize,
    pub critical: usize,
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cocotap doctor")?;
        for section in self.sections.iter().filter(|s| !s.results.is_empty()) {
            writeln!(f, "\n[{}]", section.name)?;
            for result in &section.results {
                write!(f, "{}", result)?;
            }
        }

        let tally = self.tally();
        writeln!(f)?;
        match tally {
            Tally {
                warnings: 0,
                errors: 0,
                critical: 0,
            } => writeln!(f, "✅ no problems found"),
            Tally {
                warnings,
                errors,
                critical,
            } => writeln!(
                f,
                "{} critical, {} error(s), {} warning(s)",
                critical, errors, warnings
            ),
        }
    }
}
