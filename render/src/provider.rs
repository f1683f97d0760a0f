//! Provider loading and transformer indexing.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::{debug, instrument, trace};

use crate::{Error, Result};

/// A provider source from the CLI configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct ProviderSource {
    /// Optional name override; defaults to the file stem until the
    /// provider's own metadata is read.
    #[serde(default)]
    pub name: Option<String>,
    /// Path to the provider file or package directory.
    pub path: PathBuf,
}

impl ProviderSource {
    fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| self.path.display().to_string())
        })
    }
}

/// Provider metadata.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMetadata {
    /// Provider name.
    pub name: String,
    /// Provider version.
    #[serde(default)]
    pub version: String,
    /// Minimum required core version.
    #[serde(default)]
    pub min_version: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Provider labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// A named bundle of transformers for a target runtime.
#[derive(Debug)]
pub struct Provider {
    /// Provider name (metadata name, falling back to the source name).
    pub name: String,
    /// Declared api-version, if any.
    pub api_version: Option<String>,
    /// Declared kind, if any.
    pub kind: Option<String>,
    /// Parsed metadata.
    pub metadata: ProviderMetadata,
    /// Transformers keyed by short name.
    pub transformers: BTreeMap<String, Transformer>,
}

impl Provider {
    /// Requirements reports the ordered transformer FQNs, for diagnostics.
    pub fn requirements(&self) -> Vec<String> {
        self.transformers.values().map(|t| t.fqn.clone()).collect()
    }
}

/// A rule that maps matched components to concrete resources.
#[derive(Clone, Debug)]
pub struct Transformer {
    /// `<provider>#<short>`.
    pub fqn: String,
    /// Labels the component must carry, as unification constraints.
    pub required_labels: BTreeMap<String, engine::Value>,
    /// Resources the component must declare, keyed by FQN.
    pub required_resources: BTreeMap<String, engine::Value>,
    /// Traits the component must declare, keyed by FQN.
    pub required_traits: BTreeMap<String, engine::Value>,
    /// Labels the transformer understands but does not require.
    pub optional_labels: BTreeMap<String, engine::Value>,
    /// Resources the transformer understands but does not require.
    pub optional_resources: BTreeMap<String, engine::Value>,
    /// Traits the transformer understands but does not require.
    pub optional_traits: BTreeMap<String, engine::Value>,
    /// The `#transform` body.
    pub transform: engine::Value,
}

impl Transformer {
    /// Requirements_summary renders the requirement sets on one line, used
    /// in unmatched-component diagnostics.
    pub fn requirements_summary(&self) -> String {
        let keys = |m: &BTreeMap<String, engine::Value>| -> String {
            m.keys().cloned().collect::<Vec<_>>().join(", ")
        };
        let mut parts = Vec::new();
        if !self.required_labels.is_empty() {
            parts.push(format!("labels [{}]", keys(&self.required_labels)));
        }
        if !self.required_resources.is_empty() {
            parts.push(format!("resources [{}]", keys(&self.required_resources)));
        }
        if !self.required_traits.is_empty() {
            parts.push(format!("traits [{}]", keys(&self.required_traits)));
        }
        if parts.is_empty() {
            "no requirements".to_string()
        } else {
            format!("requires {}", parts.join(", "))
        }
    }
}

/// Load selects one provider from the configured sources and parses its
/// transformer registry.
///
/// Selection: an explicit `name` must match a configured source; with no
/// name, a single configured source is auto-selected and anything else is
/// an error listing the available names, sorted.
#[instrument(skip(ctx, sources))]
pub fn load(
    ctx: &engine::Context,
    name: Option<&str>,
    sources: &[ProviderSource],
) -> Result<Provider> {
    if sources.is_empty() {
        return Err(Error::Provider("no providers configured".into()));
    }
    let mut names: Vec<String> = sources.iter().map(ProviderSource::display_name).collect();
    names.sort();
    let source = match name {
        None if sources.len() == 1 => &sources[0],
        None => {
            return Err(Error::Provider(format!(
                "multiple providers configured, pass --provider; available: {}",
                names.join(", ")
            )));
        }
        Some(want) => sources
            .iter()
            .find(|s| s.display_name() == want)
            .ok_or_else(|| {
                Error::Provider(format!(
                    "unknown provider `{want}`; available: {}",
                    names.join(", ")
                ))
            })?,
    };
    debug!(provider = source.display_name(), path = %source.path.display(), "loading provider");

    let root = if source.path.is_dir() {
        ctx.load_dir(&source.path, &[])?
    } else {
        let src = std::fs::read_to_string(&source.path)?;
        ctx.compile(&src, &source.path.display().to_string())?
    };

    let metadata: ProviderMetadata = match root.lookup(&["metadata"])? {
        Some(v) => v
            .decode()
            .map_err(|e| Error::Provider(format!("bad provider metadata: {e}")))?,
        None => ProviderMetadata::default(),
    };
    let provider_name = if metadata.name.is_empty() {
        source.display_name()
    } else {
        metadata.name.clone()
    };

    let api_version = root
        .lookup(&["apiVersion"])?
        .and_then(|v| v.decode().ok());
    let kind = root.lookup(&["kind"])?.and_then(|v| v.decode().ok());

    let mut transformers = BTreeMap::new();
    let Some(registry) = root.lookup(&["transformers"])? else {
        return Err(Error::Provider(format!(
            "provider `{provider_name}` declares no transformers"
        )));
    };
    for short in registry.fields()? {
        if short.starts_with('#') {
            continue;
        }
        let tv = registry
            .lookup(&[short.as_str()])?
            .expect("listed field exists");
        let fqn = format!("{provider_name}#{short}");
        let transform = tv.lookup(&["#transform"])?.ok_or_else(|| {
            Error::Provider(format!("transformer `{fqn}` has no #transform"))
        })?;
        trace!(transformer = fqn, "indexed transformer");
        transformers.insert(
            short.clone(),
            Transformer {
                fqn,
                required_labels: constraint_map(&tv, "requiredLabels")?,
                required_resources: constraint_map(&tv, "requiredResources")?,
                required_traits: constraint_map(&tv, "requiredTraits")?,
                optional_labels: constraint_map(&tv, "optionalLabels")?,
                optional_resources: constraint_map(&tv, "optionalResources")?,
                optional_traits: constraint_map(&tv, "optionalTraits")?,
                transform,
            },
        );
    }
    if transformers.is_empty() {
        return Err(Error::Provider(format!(
            "provider `{provider_name}` declares no transformers"
        )));
    }

    Ok(Provider {
        name: provider_name,
        api_version,
        kind,
        metadata,
        transformers,
    })
}

fn constraint_map(
    tv: &engine::Value,
    field: &str,
) -> Result<BTreeMap<String, engine::Value>> {
    let mut out = BTreeMap::new();
    if let Some(v) = tv.lookup(&[field])? {
        for key in v.fields()? {
            let c = v.lookup(&[key.as_str()])?.expect("listed field exists");
            out.insert(key, c);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_provider;

    fn sources(dir: &std::path::Path) -> Vec<ProviderSource> {
        let path = dir.join("kubernetes.cue");
        write_provider(&path);
        vec![ProviderSource { name: None, path }]
    }

    #[test]
    fn auto_selects_a_single_provider() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = engine::Context::new();
        let p = load(&ctx, None, &sources(dir.path())).expect("load");
        assert_eq!(p.name, "kubernetes");
        assert_eq!(
            p.requirements(),
            vec![
                "kubernetes#deployment".to_string(),
                "kubernetes#service".to_string()
            ]
        );
        let svc = &p.transformers["service"];
        assert_eq!(svc.required_resources.len(), 1);
        assert_eq!(svc.required_traits.len(), 1);
    }

    #[test]
    fn unknown_name_lists_available_sorted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = engine::Context::new();
        let err = load(&ctx, Some("nomad"), &sources(dir.path())).expect_err("unknown");
        let msg = err.to_string();
        assert!(msg.contains("nomad"), "got: {msg}");
        assert!(msg.contains("kubernetes"), "got: {msg}");
    }

    #[test]
    fn ambiguous_selection_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = dir.path().join("kubernetes.cue");
        write_provider(&a);
        let srcs = vec![
            ProviderSource {
                name: None,
                path: a.clone(),
            },
            ProviderSource {
                name: Some("kind".into()),
                path: a,
            },
        ];
        let ctx = engine::Context::new();
        let err = load(&ctx, None, &srcs).expect_err("ambiguous");
        assert!(err.to_string().contains("--provider"), "got: {err}");
    }
}
