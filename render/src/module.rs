//! Module loading.
//!
//! A module is a directory of configuration files: metadata, a `#config`
//! schema, optional author default `values`, and `#components`. Overlay
//! files (`values*.cue`) are excluded from the package load so two sibling
//! overlays can never conflict at evaluation time; only `values.cue` is
//! admitted, compiled in isolation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, trace};

use model::ModuleMetadata;

use crate::{Error, Result};

/// MODULE_MARKER is the file that marks a directory as a module root.
const MODULE_MARKER: &str = "cue.mod/module.cue";

/// A loaded module. Immutable; the same module may seed many releases.
#[derive(Debug)]
pub struct Module {
    /// Absolute module directory.
    pub path: PathBuf,
    /// The evaluated base value. Never mutated; `fill` produces new values.
    pub raw: engine::Value,
    /// The `#config` schema, if declared.
    pub config: Option<engine::Value>,
    /// Author default values (`values.cue` or an inline `values` field).
    pub values: Option<engine::Value>,
    /// Schema-level components, keyed by name.
    pub components: BTreeMap<String, Component>,
    /// Extracted metadata.
    pub metadata: ModuleMetadata,
    /// Overlay files excluded from the package load, for diagnostics.
    pub skipped_overlays: Vec<String>,
    /// Whether a separate `values.cue` was present.
    pub has_values_file: bool,
}

/// A named unit inside a module: resources (capabilities) plus optional
/// traits (intent markers).
#[derive(Clone, Debug)]
pub struct Component {
    /// Component name; never empty.
    pub name: String,
    /// Effective labels: module metadata labels overlaid by the
    /// component's own.
    pub labels: BTreeMap<String, String>,
    /// Component annotations.
    pub annotations: BTreeMap<String, String>,
    /// Resource values keyed by FQN; never empty.
    pub resources: BTreeMap<String, engine::Value>,
    /// Trait values keyed by FQN; may be empty.
    pub traits: BTreeMap<String, engine::Value>,
    /// The full component value.
    pub value: engine::Value,
}

/// Load reads the module at `dir`.
///
/// When `registry` is set it is installed as the process-wide registry
/// override for the duration of the load and restored on all exit paths.
#[instrument(skip(ctx, registry), fields(dir = %dir.display()))]
pub fn load(ctx: &engine::Context, dir: &Path, registry: Option<&str>) -> Result<Module> {
    let dir = dir
        .canonicalize()
        .map_err(|_| Error::NotAModule(dir.display().to_string()))?;
    if !dir.join(MODULE_MARKER).is_file() {
        return Err(Error::NotAModule(dir.display().to_string()));
    }

    let mut module_files: Vec<PathBuf> = Vec::new();
    let mut values_file: Option<PathBuf> = None;
    let mut skipped: Vec<String> = Vec::new();
    let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)?
        .filter_map(|ent| ent.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "cue"))
        .collect();
    entries.sort();
    for path in entries {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if name == "values.cue" {
            values_file = Some(path);
        } else if name.starts_with("values") {
            trace!(file = name, "skipping overlay file");
            skipped.push(name);
        } else {
            module_files.push(path);
        }
    }
    if module_files.is_empty() {
        return Err(Error::NotAModule(format!(
            "{}: no module files",
            dir.display()
        )));
    }

    let _registry = registry.map(engine::RegistryGuard::set);
    let raw = ctx.load_files(&module_files)?;

    let metadata = extract_metadata(&raw)?;
    debug!(
        name = metadata.name,
        fqn = metadata.fqn,
        version = metadata.version,
        "loaded module"
    );

    let config = raw.lookup(&["#config"])?;

    let has_values_file = values_file.is_some();
    let values = match values_file {
        Some(path) => {
            let src = std::fs::read_to_string(&path)?;
            let name = path.to_string_lossy().to_string();
            ctx.compile(&src, &name)?.lookup(&["values"])?
        }
        None => raw.lookup(&["values"])?,
    };

    let components = components_from(&raw, &metadata.labels)?;

    Ok(Module {
        path: dir,
        raw,
        config,
        values,
        components,
        metadata,
        skipped_overlays: skipped,
        has_values_file,
    })
}

fn extract_metadata(raw: &engine::Value) -> Result<ModuleMetadata> {
    let get = |path: &[&str]| -> Result<Option<String>> {
        match raw.lookup(path)? {
            Some(v) => Ok(v.decode::<String>().ok()),
            None => Ok(None),
        }
    };
    let name = get(&["metadata", "name"])?.unwrap_or_default();
    let fqn = match get(&["metadata", "fqn"])? {
        Some(fqn) => fqn,
        None => get(&["apiVersion"])?.unwrap_or_default(),
    };
    let version = get(&["metadata", "version"])?.unwrap_or_default();
    let default_namespace = get(&["metadata", "defaultNamespace"])?.unwrap_or_default();
    let labels = match raw.lookup(&["metadata", "labels"])? {
        Some(v) => v.decode().unwrap_or_default(),
        None => BTreeMap::new(),
    };
    let uuid = match get(&["metadata", "uuid"])? {
        Some(s) => s
            .parse()
            .unwrap_or_else(|_| model::meta::module_id(&fqn, &version)),
        None => model::meta::module_id(&fqn, &version),
    };
    Ok(ModuleMetadata {
        name,
        fqn,
        version,
        default_namespace,
        labels,
        uuid,
    })
}

/// Components_from walks `#components` on a (possibly filled) module value
/// and builds the schema-level component records. Shared with the release
/// builder, which re-extracts after values are filled in.
pub(crate) fn components_from(
    value: &engine::Value,
    module_labels: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, Component>> {
    let mut out = BTreeMap::new();
    let Some(components) = value.lookup(&["#components"])? else {
        return Ok(out);
    };
    for name in components.fields()? {
        if name.starts_with('#') {
            continue;
        }
        let cv = components
            .lookup(&[name.as_str()])?
            .expect("listed field exists");
        let mut labels = module_labels.clone();
        if let Some(v) = cv.lookup(&["metadata", "labels"])? {
            let own: BTreeMap<String, String> = v.decode().unwrap_or_default();
            labels.extend(own);
        }
        let annotations = match cv.lookup(&["metadata", "annotations"])? {
            Some(v) => v.decode().unwrap_or_default(),
            None => BTreeMap::new(),
        };
        let mut resources = BTreeMap::new();
        if let Some(rv) = cv.lookup(&["#resources"])? {
            for fqn in rv.fields()? {
                let v = rv.lookup(&[fqn.as_str()])?.expect("listed field exists");
                resources.insert(fqn, v);
            }
        }
        if resources.is_empty() {
            return Err(Error::InvalidComponent {
                component: name,
                reason: "declares no resources".into(),
            });
        }
        let mut traits = BTreeMap::new();
        if let Some(tv) = cv.lookup(&["#traits"])? {
            for fqn in tv.fields()? {
                let v = tv.lookup(&[fqn.as_str()])?.expect("listed field exists");
                traits.insert(fqn, v);
            }
        }
        out.insert(
            name.clone(),
            Component {
                name,
                labels,
                annotations,
                resources,
                traits,
                value: cv,
            },
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_module;

    #[test]
    fn loads_metadata_config_and_components() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_module(dir.path());
        let ctx = engine::Context::new();
        let m = load(&ctx, dir.path(), None).expect("load");
        assert_eq!(m.metadata.name, "blog");
        assert_eq!(m.metadata.fqn, "example.com/blog@v0#Blog");
        assert_eq!(m.metadata.default_namespace, "blog");
        assert!(m.config.is_some());
        assert!(!m.has_values_file);
        assert_eq!(
            m.components.keys().cloned().collect::<Vec<_>>(),
            vec!["api".to_string(), "web".to_string()]
        );
        let web = &m.components["web"];
        assert_eq!(web.labels["workload-type"], "stateless");
        assert_eq!(web.resources.len(), 1);
        assert_eq!(web.traits.len(), 1);
    }

    #[test]
    fn sibling_overlays_are_skipped_with_a_diagnostic() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_module(dir.path());
        std::fs::write(dir.path().join("values.cue"), "values: { image: \"app:1\" }")
            .expect("write");
        std::fs::write(
            dir.path().join("values_prod.cue"),
            "values: { image: \"app:prod\" }",
        )
        .expect("write");
        let ctx = engine::Context::new();
        let m = load(&ctx, dir.path(), None).expect("load");
        assert!(m.has_values_file);
        assert_eq!(m.skipped_overlays, vec!["values_prod.cue".to_string()]);
        let values = m.values.expect("values present");
        let data = values.to_json(true).expect("finalize");
        assert_eq!(data["image"], serde_json::json!("app:1"));
    }

    #[test]
    fn missing_marker_is_not_a_module() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("blog.cue"), "a: 1").expect("write");
        let ctx = engine::Context::new();
        let err = load(&ctx, dir.path(), None).expect_err("not a module");
        assert!(matches!(err, Error::NotAModule(_)));
    }

    #[test]
    fn empty_values_file_means_no_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_module(dir.path());
        std::fs::write(dir.path().join("values.cue"), "package blog\n").expect("write");
        let ctx = engine::Context::new();
        let m = load(&ctx, dir.path(), None).expect("load");
        assert!(m.has_values_file);
        assert!(m.values.is_none());
    }
}
