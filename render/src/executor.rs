//! Transformer execution.
//!
//! The evaluator context is not thread-safe, so execution is split in two:
//! the main thread unifies each transformer with its component and context
//! (all cross-references must resolve here) and exports the result as a
//! final, concrete syntax tree; worker threads re-hydrate that tree in
//! their own fresh contexts and decode the `output` field. Values never
//! cross a context by reference.

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::{debug, instrument, trace};

use model::meta::{ContextComponent, ContextModule, TransformerContext};
use model::{LIST_OUTPUT_ANNOTATION, Resource};

use crate::matcher::MatchPlan;
use crate::module::Component;
use crate::release::Release;
use crate::{Error, Result};

/// The outcome of executing a match plan: rendered resources in apply
/// order, plus every error collected along the way (fail-on-end).
pub struct ExecuteOutcome {
    /// Rendered resources, weight-sorted.
    pub resources: Vec<Resource>,
    /// Collected errors; empty means a clean render.
    pub errors: Vec<Error>,
}

struct Job {
    idx: usize,
    transformer: String,
    component: String,
    ast: engine::Ast,
    list_output: bool,
}

/// Execute runs every matched (transformer, component) pair and aggregates
/// the results deterministically.
#[instrument(skip_all, fields(release = release.metadata.name))]
pub fn execute(plan: &MatchPlan, release: &Release) -> ExecuteOutcome {
    let mut errors: Vec<Error> = Vec::new();
    let mut jobs: Vec<Job> = Vec::new();

    // Main-thread preparation: unify and export. Plan order is already
    // (transformer FQN, component name), which fixes the render order.
    for m in plan.matches.iter().filter(|m| m.matched) {
        let Some(component) = release.components.get(&m.component.name) else {
            // Component present in the plan but not in the release; the
            // release builder rejects this earlier.
            continue;
        };
        let idx = jobs.len();
        match prepare(m.transformer.fqn.as_str(), &m.transformer.transform, component, release) {
            Ok((ast, list_output)) => jobs.push(Job {
                idx,
                transformer: m.transformer.fqn.clone(),
                component: component.name.clone(),
                ast,
                list_output,
            }),
            Err(e) => errors.push(e),
        }
    }
    debug!(jobs = jobs.len(), "prepared transform jobs");

    // Worker fan-out. Each worker owns a fresh context for its lifetime.
    let total = jobs.len();
    let mut slots: Vec<Option<Result<Vec<Resource>, Error>>> = Vec::new();
    slots.resize_with(total, || None);
    if total > 0 {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(total);
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (res_tx, res_rx) = mpsc::channel();
        let job_rx = Arc::new(Mutex::new(job_rx));
        for job in jobs {
            job_tx.send(job).expect("receiver alive");
        }
        drop(job_tx);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let res_tx = res_tx.clone();
                scope.spawn(move || {
                    let ctx = engine::Context::new();
                    loop {
                        let job = match job_rx.lock().expect("queue lock").recv() {
                            Ok(job) => job,
                            Err(_) => break,
                        };
                        let out = run_job(&ctx, &job);
                        if res_tx.send((job.idx, out)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(res_tx);
            for (idx, out) in res_rx {
                slots[idx] = Some(out);
            }
        });
    }

    let mut resources: Vec<Resource> = Vec::new();
    for slot in slots {
        match slot {
            Some(Ok(mut rs)) => resources.append(&mut rs),
            Some(Err(e)) => errors.push(e),
            None => {}
        }
    }

    for name in &plan.unmatched {
        errors.push(Error::UnmatchedComponent {
            component: name.clone(),
            available: plan
                .matches
                .iter()
                .map(|m| format!("{} ({})", m.transformer.fqn, m.transformer.requirements_summary()))
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .collect::<Vec<_>>()
                .join("; "),
        });
    }

    model::resource::sort_for_apply(&mut resources);
    ExecuteOutcome { resources, errors }
}

/// Prepare unifies one transformer with its inputs in the calling thread's
/// context and exports the final, concrete syntax tree.
fn prepare(
    fqn: &str,
    transform: &engine::Value,
    component: &Component,
    release: &Release,
) -> Result<(engine::Ast, bool)> {
    let context = TransformerContext {
        release_name: release.metadata.name.clone(),
        namespace: release.metadata.namespace.clone(),
        module: ContextModule {
            fqn: release.metadata.module_fqn.clone(),
            version: release.metadata.version.clone(),
            identity: release.metadata.identity,
            labels: release.metadata.labels.clone(),
        },
        component: ContextComponent {
            name: component.name.clone(),
            labels: component.labels.clone(),
            annotations: component.annotations.clone(),
        },
    };
    let context = serde_json::to_value(&context)?;
    let view = component_view(component).map_err(|cause| Error::Transform {
        transformer: fqn.to_string(),
        component: component.name.clone(),
        cause,
    })?;

    let unified = transform
        .fill_json(&["context"], &context)
        .fill_json(&["#component"], &view);
    let ast = unified.syntax(true).map_err(|cause| Error::Transform {
        transformer: fqn.to_string(),
        component: component.name.clone(),
        cause,
    })?;
    trace!(transformer = fqn, component = component.name, "exported transform");

    let list_output = component
        .annotations
        .get(LIST_OUTPUT_ANNOTATION)
        .is_some_and(|v| v == "true");
    Ok((ast, list_output))
}

/// Component_view projects a concrete component into the record filled in
/// at `#component`: resources and traits are keyed by their short names
/// (the text after `#` in the FQN) so transformer bodies can reference
/// them with plain selectors.
fn component_view(component: &Component) -> Result<serde_json::Value, engine::EvalError> {
    let mut resources = BTreeMap::new();
    for (fqn, v) in &component.resources {
        resources.insert(short_name(fqn).to_string(), v.to_json(true)?);
    }
    let mut traits = BTreeMap::new();
    for (fqn, v) in &component.traits {
        traits.insert(short_name(fqn).to_string(), v.to_json(true)?);
    }
    Ok(json!({
        "name": component.name,
        "labels": component.labels,
        "annotations": component.annotations,
        "resources": resources,
        "traits": traits,
    }))
}

fn short_name(fqn: &str) -> &str {
    fqn.rsplit_once('#').map_or(fqn, |(_, s)| s)
}

/// Run_job re-hydrates an exported transform in the worker's context and
/// decodes its output.
fn run_job(ctx: &engine::Context, job: &Job) -> Result<Vec<Resource>, Error> {
    let transform_err = |cause: engine::EvalError| Error::Transform {
        transformer: job.transformer.clone(),
        component: job.component.clone(),
        cause,
    };

    let value = ctx.build_expr(&job.ast);
    let output = value
        .lookup(&["output"])
        .map_err(transform_err)?
        .ok_or_else(|| transform_err(engine::EvalError::validation("no `output` field")))?;
    let data = output.to_json(true).map_err(transform_err)?;

    let objects: Vec<serde_json::Value> = if job.list_output {
        match data {
            serde_json::Value::Array(items) => items,
            other => {
                return Err(transform_err(engine::EvalError::validation(format!(
                    "list output expected, found {}",
                    type_of(&other)
                ))));
            }
        }
    } else {
        vec![data]
    };

    let mut out = Vec::with_capacity(objects.len());
    for object in objects {
        match Resource::from_object(object, &job.component, &job.transformer) {
            Some(r) => out.push(r),
            None => {
                return Err(transform_err(engine::EvalError::validation(
                    "output is missing apiVersion or kind",
                )));
            }
        }
    }
    Ok(out)
}

fn type_of(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
