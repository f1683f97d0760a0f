//! CLI configuration file.
//!
//! Resolved from `--config`, `$OPM_CONFIG`, then
//! `$XDG_CONFIG_HOME/opm/config.yaml` (falling back to
//! `~/.config/opm/config.yaml`). The file lists provider sources and an
//! optional registry override:
//!
//! ```yaml
//! providers:
//!   - name: kubernetes
//!     path: /etc/opm/providers/kubernetes.cue
//! registry: registry.opmodel.dev
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use render::ProviderSource;

use crate::{Error, Result};

/// CONFIG_ENV overrides the configuration file location.
pub const CONFIG_ENV: &str = "OPM_CONFIG";

/// The parsed CLI configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CliConfig {
    /// Configured provider sources.
    #[serde(default)]
    pub providers: Vec<ProviderSource>,
    /// Content-addressable registry for modules with external
    /// dependencies; exported as the registry environment during loads.
    #[serde(default)]
    pub registry: Option<String>,
}

impl CliConfig {
    /// Load reads the configuration from `path`, or from the default
    /// locations when `path` is `None`. A missing default file is an empty
    /// configuration, not an error.
    pub fn load(path: Option<&Path>) -> Result<CliConfig> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match std::env::var_os(CONFIG_ENV) {
                Some(p) => PathBuf::from(p),
                None => {
                    let Some(base) = config_home() else {
                        return Ok(CliConfig::default());
                    };
                    let p = base.join("opm/config.yaml");
                    if !p.is_file() {
                        return Ok(CliConfig::default());
                    }
                    p
                }
            },
        };
        debug!(path = %path.display(), "reading configuration");
        let buf = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let cfg: CliConfig = serde_yaml::from_str(&buf)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Ok(cfg)
    }
}

fn config_home() -> Option<PathBuf> {
    if let Some(p) = std::env::var_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(p));
    }
    std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_providers_and_registry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "providers:\n  - name: kubernetes\n    path: /p/kubernetes.cue\nregistry: registry.example.com\n",
        )
        .expect("write");
        let cfg = CliConfig::load(Some(&path)).expect("load");
        assert_eq!(cfg.providers.len(), 1);
        assert_eq!(cfg.providers[0].name.as_deref(), Some("kubernetes"));
        assert_eq!(cfg.registry.as_deref(), Some("registry.example.com"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "provider: nope\n").expect("write");
        assert!(CliConfig::load(Some(&path)).is_err());
    }
}
