//! Model alias registry.
//!
//! Built once at startup from `configs/model_info.yaml` and passed to whatever
//! needs to turn an alias into a checkpoint directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::load_yaml;
use crate::error::{parse_error, Result, RlhfError};

/// One registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelInfo {
    pub model_name_or_path: String,
    /// Default prompt template for datasets used with this model.
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    entries: BTreeMap<String, ModelInfo>,
}

impl ModelRegistry {
    pub fn new(entries: BTreeMap<String, ModelInfo>) -> Self {
        Self { entries }
    }

    /// Load from YAML. A missing file yields an empty registry; a malformed one
    /// is an error.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no model registry file, using empty registry");
            return Ok(Self::default());
        }
        let value = load_yaml(path)?;
        if value.is_null() {
            return Ok(Self::default());
        }
        let entries: BTreeMap<String, ModelInfo> =
            serde_yaml::from_value(value).map_err(|e| parse_error(e, path))?;
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn get(&self, alias: &str) -> Option<&ModelInfo> {
        self.entries.get(alias)
    }

    /// Resolve an alias to its path; anything that is not an alias is taken as
    /// a path verbatim.
    pub fn resolve(&self, name_or_path: &str) -> PathBuf {
        match self.entries.get(name_or_path) {
            Some(info) => PathBuf::from(&info.model_name_or_path),
            None => PathBuf::from(name_or_path),
        }
    }

    /// Like `resolve`, but the result must exist on disk.
    pub fn resolve_existing(&self, name_or_path: &str) -> Result<PathBuf> {
        let path = self.resolve(name_or_path);
        if path.is_dir() {
            Ok(path)
        } else {
            Err(RlhfError::Registry(format!(
                "'{}' is neither a registered alias nor an existing model directory (resolved to '{}')",
                name_or_path,
                path.display()
            )))
        }
    }

    /// Template registered for the model behind `name_or_path`, if any.
    pub fn template_for(&self, name_or_path: &str) -> Option<&str> {
        if let Some(info) = self.entries.get(name_or_path) {
            return info.template.as_deref();
        }
        self.entries
            .values()
            .find(|info| info.model_name_or_path == name_or_path)
            .and_then(|info| info.template.as_deref())
    }
}
