use crate::error::ValidationError;
use crate::model::{ChainKey, Rule, RuleForm};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PresetError {
    #[error("failed to read preset {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse preset {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("unknown preset '{0}'")]
    NotFound(String),

    #[error("preset '{name}' is invalid: {source}")]
    Invalid {
        name: String,
        #[source]
        source: ValidationError,
    },
}

/// A named rule template, typically one YAML file per preset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulePreset {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub table: String,
    pub chain: String,
    #[serde(default)]
    pub rule: RuleForm,
}

impl RulePreset {
    pub fn key(&self) -> Result<ChainKey, ValidationError> {
        ChainKey::parse(&self.table, &self.chain)
    }

    /// Builds the preset's rule with `overrides` layered on top.
    pub fn build(&self, overrides: &RuleForm) -> Result<Rule, PresetError> {
        let invalid = |source| PresetError::Invalid {
            name: self.name.clone(),
            source,
        };
        let key = self.key().map_err(invalid)?;
        let mut form = self.rule.clone();
        form.merge(overrides);
        form.into_rule(key).map_err(invalid)
    }
}

/// Loads rule presets from YAML files.
pub struct PresetLoader;

impl PresetLoader {
    pub fn new() -> Self {
        Self
    }

    pub fn load_preset(&self, path: &Path) -> Result<RulePreset, PresetError> {
        let content = std::fs::read_to_string(path).map_err(|source| PresetError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_yaml::from_str(&content).map_err(|source| PresetError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads every `.yaml`/`.yml` file in `dir`. Files that fail to load are
    /// skipped with a warning; a missing directory yields no presets.
    pub fn load_presets_from_dir(
        &self,
        dir: &Path,
    ) -> Result<BTreeMap<String, RulePreset>, PresetError> {
        let mut presets = BTreeMap::new();

        if !dir.exists() {
            return Ok(presets);
        }

        let read_err = |source| PresetError::Read {
            path: dir.to_path_buf(),
            source,
        };
        for entry in std::fs::read_dir(dir).map_err(read_err)? {
            let path = entry.map_err(read_err)?.path();

            if matches!(
                path.extension().and_then(|s| s.to_str()),
                Some("yaml") | Some("yml")
            ) {
                match self.load_preset(&path) {
                    Ok(preset) => {
                        presets.insert(preset.name.clone(), preset);
                    }
                    Err(e) => {
                        tracing::warn!(path = ?path, error = %e, "skipping preset");
                    }
                }
            }
        }

        Ok(presets)
    }

    pub fn find(&self, dir: &Path, name: &str) -> Result<RulePreset, PresetError> {
        self.load_presets_from_dir(dir)?
            .remove(name)
            .ok_or_else(|| PresetError::NotFound(name.to_string()))
    }
}

impl Default for PresetLoader {
    fn default() -> Self {
        Self::new()
    }
}
