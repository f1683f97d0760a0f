//! Build: the full render pipeline from module directory to resources,
//! shared by `mod build`, `mod apply`, and `mod diff`.

use std::path::{Path, PathBuf};

use model::tracking_labels;
use render::BuildOptions;

use crate::config::CliConfig;
use crate::prelude::*;

/// A render request, as assembled from CLI flags.
#[derive(Debug, Default)]
pub struct RenderRequest {
    /// Module directory.
    pub path: PathBuf,
    /// User overlay files, in CLI order.
    pub values: Vec<PathBuf>,
    /// Release name override.
    pub release_name: Option<String>,
    /// Namespace override.
    pub namespace: Option<String>,
    /// Provider selection.
    pub provider: Option<String>,
    /// Unhandled traits become errors.
    pub strict: bool,
}

/// A finished render.
#[derive(Debug)]
pub struct Rendered {
    /// Release metadata.
    pub release: ReleaseMetadata,
    /// Labeled resources in apply order.
    pub resources: Vec<Resource>,
    /// Skipped-overlay and unhandled-trait diagnostics.
    pub warnings: Vec<String>,
}

/// Render runs the full pipeline. Render errors are collected fail-on-end
/// and returned together.
#[instrument(skip(cfg), fields(module = %req.path.display()))]
pub fn render(cfg: &CliConfig, req: &RenderRequest) -> Result<Rendered> {
    let ctx = engine::Context::new();
    let module = render::module::load(&ctx, &req.path, cfg.registry.as_deref())?;

    let mut warnings: Vec<String> = module
        .skipped_overlays
        .iter()
        .map(|f| format!("overlay file `{f}` excluded from the package load; pass -f to use it"))
        .collect();

    let release = render::release::build(
        &ctx,
        &module,
        &BuildOptions {
            name: req.release_name.clone(),
            namespace: req.namespace.clone(),
            values_files: req.values.clone(),
        },
    )?;

    let provider = render::provider::load(&ctx, req.provider.as_deref(), &cfg.providers)?;
    let plan = render::matcher::match_components(&release.components, &provider);

    for (component, resources) in &plan.unhandled_resources {
        warnings.push(format!(
            "component `{component}` has resources no matched transformer consumes: {}",
            resources.join(", ")
        ));
    }

    let mut errors: Vec<render::Error> = Vec::new();
    for (component, traits) in &plan.unhandled_traits {
        if req.strict {
            errors.push(render::Error::UnhandledTrait {
                component: component.clone(),
                traits: traits.join(", "),
            });
        } else {
            warnings.push(format!(
                "component `{component}` has unhandled traits: {}",
                traits.join(", ")
            ));
        }
    }

    let outcome = render::executor::execute(&plan, &release);
    errors.extend(outcome.errors);
    if !errors.is_empty() {
        for e in &errors {
            error!(error = %e, "render error");
        }
        return Err(Error::RenderFailed(errors));
    }

    let mut resources = outcome.resources;
    for r in &mut resources {
        let component = r.component.clone();
        r.set_labels(&tracking_labels(&release.metadata, &component));
    }
    info!(
        release = release.metadata.name,
        resources = resources.len(),
        "render complete"
    );
    Ok(Rendered {
        release: release.metadata,
        resources,
        warnings,
    })
}

/// Write_dir writes one YAML file per resource into `out_dir`, numbered in
/// apply order for GitOps handoff.
pub fn write_dir(rendered: &Rendered, out_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(out_dir)?;
    for (i, r) in rendered.resources.iter().enumerate() {
        let file = out_dir.join(format!(
            "{i:03}-{}-{}.yaml",
            r.gvk.kind.to_ascii_lowercase(),
            r.name()
        ));
        std::fs::write(&file, serde_yaml::to_string(&r.object)?)?;
    }
    Ok(())
}

/// To_yaml renders the resources as a multi-document YAML stream.
pub fn to_yaml(rendered: &Rendered) -> Result<String> {
    let mut out = String::new();
    for r in &rendered.resources {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&r.object)?);
    }
    Ok(out)
}

/// To_json renders the resources as a JSON array.
pub fn to_json(rendered: &Rendered) -> Result<String> {
    let objects: Vec<&serde_json::Value> = rendered.resources.iter().map(|r| &r.object).collect();
    Ok(serde_json::to_string_pretty(&objects)?)
}
