//! Release building: values reconciliation and component extraction.
//!
//! The evaluator's unification is strictly an AND, so two overlay files
//! setting the same scalar can never be unified directly. Overlay layers
//! are therefore merged at the host level (RFC 7386 deep merge, last write
//! wins), validated against `#config` once, and filled into the base with a
//! single `fill`. Because the config path is written exactly once with an
//! already-concrete value, unification cannot conflict.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{debug, instrument, trace};

use model::ReleaseMetadata;

use crate::module::{Component, Module, components_from};
use crate::{Error, Result};

/// Options for building a release from a module.
#[derive(Debug, Default)]
pub struct BuildOptions {
    /// Release name; defaults to the module's metadata name.
    pub name: Option<String>,
    /// Target namespace; defaults to the module's default namespace.
    pub namespace: Option<String>,
    /// User overlay files, in CLI order. Last wins.
    pub values_files: Vec<PathBuf>,
}

/// A built release: metadata plus concrete components.
#[derive(Debug)]
pub struct Release {
    /// Release metadata, including the deterministic identity.
    pub metadata: ReleaseMetadata,
    /// Concrete components, keyed by name.
    pub components: BTreeMap<String, Component>,
}

/// Build reconciles values against the module's `#config`, fills them into
/// the base, and extracts concrete components.
#[instrument(skip(ctx, module, opts), fields(module = module.metadata.name))]
pub fn build(ctx: &engine::Context, module: &Module, opts: &BuildOptions) -> Result<Release> {
    let mut layers: Vec<(String, serde_json::Value)> = Vec::new();
    if let Some(defaults) = &module.values {
        let data = defaults
            .to_json(true)
            .map_err(|cause| Error::ValuesNotConcrete {
                file: "values.cue".into(),
                cause,
            })?;
        layers.push(("values.cue".into(), data));
    }
    for path in &opts.values_files {
        let src = std::fs::read_to_string(path)?;
        let name = path.display().to_string();
        let compiled = ctx.compile(&src, &name)?;
        // An overlay file is either a bare struct of config fields or a
        // file with a single `values` field wrapping them.
        let value = match compiled.lookup(&["values"])? {
            Some(v) => v,
            None => compiled,
        };
        let data = value
            .to_json(true)
            .map_err(|cause| Error::ValuesNotConcrete { file: name.clone(), cause })?;
        if !data.is_object() {
            return Err(Error::ValuesNotConcrete {
                file: name,
                cause: engine::EvalError::validation("overlay is not a mapping"),
            });
        }
        layers.push((name, data));
    }

    let merged = merge_layers(&layers);
    trace!(layers = layers.len(), "merged value layers");

    let filled = if let Some(merged) = &merged {
        let schema = module.config.as_ref().ok_or_else(|| {
            Error::ValuesValidation(engine::EvalError::validation(
                "module declares no #config schema",
            ))
        })?;
        ctx.from_json(merged)
            .validate_against(schema)
            .map_err(Error::ValuesValidation)?;
        module.raw.fill_json(&["#config"], merged)
    } else {
        // No layers at all: the schema defaults alone must make #config
        // concrete, or component validation below will surface it.
        module.raw.clone()
    };

    let components = components_from(&filled, &module.metadata.labels)?;
    for (name, component) in &components {
        // Resources and traits live under definition labels, which plain
        // validation skips; check each of them explicitly.
        let checks = std::iter::once(&component.value)
            .chain(component.resources.values())
            .chain(component.traits.values());
        for value in checks {
            value
                .validate(true)
                .map_err(|cause| Error::ReleaseValidation {
                    component: name.clone(),
                    cause,
                })?;
        }
    }

    let name = opts
        .name
        .clone()
        .unwrap_or_else(|| module.metadata.name.clone());
    let namespace = match &opts.namespace {
        Some(ns) => ns.clone(),
        None if !module.metadata.default_namespace.is_empty() => {
            module.metadata.default_namespace.clone()
        }
        None => return Err(Error::NamespaceRequired),
    };
    let metadata = ReleaseMetadata::new(&name, &namespace, &module.metadata);
    debug!(
        release = metadata.name,
        namespace = metadata.namespace,
        identity = %metadata.identity,
        components = components.len(),
        "built release"
    );

    Ok(Release {
        metadata,
        components,
    })
}

/// Merge_layers deep-merges overlay layers, last write wins. Mappings merge
/// recursively; scalars and lists are replaced; an explicit `null` removes
/// the key (RFC 7386).
fn merge_layers(layers: &[(String, serde_json::Value)]) -> Option<serde_json::Value> {
    let mut iter = layers.iter();
    let (_, first) = iter.next()?;
    let mut acc = first.clone();
    for (_, layer) in iter {
        json_patch::merge(&mut acc, layer);
    }
    Some(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::load;
    use crate::testutil::write_module;

    fn overlay(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, body).expect("write overlay");
        p
    }

    #[test]
    fn defaults_alone_build_a_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_module(dir.path());
        let ctx = engine::Context::new();
        let m = load(&ctx, dir.path(), None).expect("load");
        let rel = build(&ctx, &m, &BuildOptions::default()).expect("build");
        assert_eq!(rel.metadata.name, "blog");
        assert_eq!(rel.metadata.namespace, "blog");
        let web = &rel.components["web"];
        let data = web.resources["opmodel.dev/core@v0#Container"]
            .to_json(true)
            .expect("concrete");
        assert_eq!(data["image"], serde_json::json!("nginx:stable"));
        assert_eq!(data["replicas"], serde_json::json!(1));
    }

    #[test]
    fn overlays_merge_last_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_module(dir.path());
        let ctx = engine::Context::new();
        let m = load(&ctx, dir.path(), None).expect("load");
        let a = overlay(dir.path(), "a.cue", "image: \"app:1\"\nreplicas: 5");
        let b = overlay(dir.path(), "b.cue", "image: \"app:2\"");
        let rel = build(
            &ctx,
            &m,
            &BuildOptions {
                values_files: vec![a.clone(), b.clone()],
                ..Default::default()
            },
        )
        .expect("build");
        let data = rel.components["web"].resources["opmodel.dev/core@v0#Container"]
            .to_json(true)
            .expect("concrete");
        assert_eq!(data["image"], serde_json::json!("app:2"));
        assert_eq!(data["replicas"], serde_json::json!(5));

        // Reversed order swaps the image winner.
        let rel = build(
            &ctx,
            &m,
            &BuildOptions {
                values_files: vec![b, a],
                ..Default::default()
            },
        )
        .expect("build");
        let data = rel.components["web"].resources["opmodel.dev/core@v0#Container"]
            .to_json(true)
            .expect("concrete");
        assert_eq!(data["image"], serde_json::json!("app:1"));
    }

    #[test]
    fn unknown_field_is_rejected_with_its_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_module(dir.path());
        let ctx = engine::Context::new();
        let m = load(&ctx, dir.path(), None).expect("load");
        let bad = overlay(dir.path(), "bad.cue", "imgae: \"app:1\"");
        let err = build(
            &ctx,
            &m,
            &BuildOptions {
                values_files: vec![bad],
                ..Default::default()
            },
        )
        .expect_err("schema violation");
        assert!(err.to_string().contains("imgae"), "got: {err}");
    }

    #[test]
    fn release_identity_matches_the_pinned_vector() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_module(dir.path());
        let ctx = engine::Context::new();
        let m = load(&ctx, dir.path(), None).expect("load");
        let rel = build(
            &ctx,
            &m,
            &BuildOptions {
                name: Some("my-blog".into()),
                namespace: Some("production".into()),
                ..Default::default()
            },
        )
        .expect("build");
        assert_eq!(
            rel.metadata.identity.to_string(),
            "19a9c97c-2fc2-5798-a976-71a6b0cb1d9b"
        );
    }

    #[test]
    fn missing_namespace_without_default_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_module(dir.path());
        // Rewrite the module without a default namespace.
        let src = std::fs::read_to_string(dir.path().join("blog.cue")).expect("read");
        std::fs::write(
            dir.path().join("blog.cue"),
            src.replace("\tdefaultNamespace: \"blog\"\n", ""),
        )
        .expect("write");
        let ctx = engine::Context::new();
        let m = load(&ctx, dir.path(), None).expect("load");
        let err = build(&ctx, &m, &BuildOptions::default()).expect_err("no namespace");
        assert!(matches!(err, Error::NamespaceRequired));
    }
}
