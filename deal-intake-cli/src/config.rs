//! CLI configuration from the environment.

use std::path::PathBuf;

pub const DEFAULT_CATALOG_DIR: &str = "config/catalog";
pub const DEFAULT_LOG_FILTER: &str = "info,deal_intake_core=debug";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakeConfig {
    pub catalog_dir: PathBuf,
    /// Used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            catalog_dir: PathBuf::from(DEFAULT_CATALOG_DIR),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl IntakeConfig {
    /// Read `DEAL_INTAKE_CATALOG_DIR` and `DEAL_INTAKE_LOG`, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            catalog_dir: lookup("DEAL_INTAKE_CATALOG_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.catalog_dir),
            log_filter: lookup("DEAL_INTAKE_LOG")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.log_filter),
        }
    }

    /// Command-line flags win over the environment.
    pub fn with_overrides(
        mut self,
        catalog_dir: Option<PathBuf>,
        log_filter: Option<String>,
    ) -> Self {
        if let Some(dir) = catalog_dir {
            self.catalog_dir = dir;
        }
        if let Some(filter) = log_filter {
            self.log_filter = filter;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_when_unset() {
        let config = IntakeConfig::from_lookup(|_| None);
        assert_eq!(config, IntakeConfig::default());
    }

    #[test]
    fn test_env_then_flags() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DEAL_INTAKE_CATALOG_DIR", "/srv/catalog"),
            ("DEAL_INTAKE_LOG", ""),
        ]);
        let config = IntakeConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.catalog_dir, PathBuf::from("/srv/catalog"));
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);

        let config = config.with_overrides(None, Some("warn".to_string()));
        assert_eq!(config.log_filter, "warn");
        assert_eq!(config.catalog_dir, PathBuf::from("/srv/catalog"));
    }
}
