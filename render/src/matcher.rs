//! Component/transformer matching.
//!
//! Required resources and traits encode *capability* ("does this component
//! have the data I need?"); required labels encode *intent* ("is this the
//! variant I should act on?"). Both must hold for a match.

use std::collections::BTreeMap;

use tracing::{debug, instrument, trace};

use crate::module::Component;
use crate::provider::{Provider, Transformer};

/// One match decision for a (transformer, component) pair.
pub struct Match {
    /// The transformer.
    pub transformer: Transformer,
    /// The component.
    pub component: Component,
    /// Whether the pair matched.
    pub matched: bool,
    /// Why, and what was missing.
    pub detail: MatchDetail,
}

/// Diagnostics for a match decision.
#[derive(Clone, Debug, Default)]
pub struct MatchDetail {
    /// One-line reason.
    pub reason: String,
    /// Required label keys absent or conflicting.
    pub missing_labels: Vec<String>,
    /// Required resource FQNs absent or conflicting.
    pub missing_resources: Vec<String>,
    /// Required trait FQNs absent or conflicting.
    pub missing_traits: Vec<String>,
}

/// The full match plan for a release against a provider.
pub struct MatchPlan {
    /// Every (transformer, component) decision, ordered by transformer FQN
    /// then component name.
    pub matches: Vec<Match>,
    /// Components that matched no transformer. Fatal at the end of the
    /// pipeline; surfaced all at once.
    pub unmatched: Vec<String>,
    /// Resources declared on a component but claimed by no matched
    /// transformer's required or optional resources, keyed by component.
    /// Always a warning: the component still renders, the data is just
    /// never consumed.
    pub unhandled_resources: BTreeMap<String, Vec<String>>,
    /// Traits declared on a component but handled by no matched
    /// transformer, keyed by component. A warning normally, an error in
    /// strict mode.
    pub unhandled_traits: BTreeMap<String, Vec<String>>,
}

/// Match_components computes the match plan.
#[instrument(skip_all, fields(provider = provider.name))]
pub fn match_components(
    components: &BTreeMap<String, Component>,
    provider: &Provider,
) -> MatchPlan {
    let mut matches = Vec::new();
    // BTreeMap iteration gives transformer-FQN and component-name order.
    for transformer in provider.transformers.values() {
        for component in components.values() {
            let detail = check(transformer, component);
            let matched = detail.missing_labels.is_empty()
                && detail.missing_resources.is_empty()
                && detail.missing_traits.is_empty();
            trace!(
                transformer = transformer.fqn,
                component = component.name,
                matched,
                reason = detail.reason,
                "match decision"
            );
            matches.push(Match {
                transformer: transformer.clone(),
                component: component.clone(),
                matched,
                detail,
            });
        }
    }

    let mut unmatched = Vec::new();
    let mut unhandled_resources = BTreeMap::new();
    let mut unhandled_traits = BTreeMap::new();
    for component in components.values() {
        let matched: Vec<&Match> = matches
            .iter()
            .filter(|m| m.matched && m.component.name == component.name)
            .collect();
        if matched.is_empty() {
            unmatched.push(component.name.clone());
            continue;
        }
        let unclaimed: Vec<String> = component
            .resources
            .keys()
            .filter(|fqn| {
                !matched.iter().any(|m| {
                    m.transformer.required_resources.contains_key(*fqn)
                        || m.transformer.optional_resources.contains_key(*fqn)
                })
            })
            .cloned()
            .collect();
        if !unclaimed.is_empty() {
            unhandled_resources.insert(component.name.clone(), unclaimed);
        }
        let unhandled: Vec<String> = component
            .traits
            .keys()
            .filter(|fqn| {
                !matched.iter().any(|m| {
                    m.transformer.required_traits.contains_key(*fqn)
                        || m.transformer.optional_traits.contains_key(*fqn)
                })
            })
            .cloned()
            .collect();
        if !unhandled.is_empty() {
            unhandled_traits.insert(component.name.clone(), unhandled);
        }
    }
    debug!(
        pairs = matches.len(),
        matched = matches.iter().filter(|m| m.matched).count(),
        unmatched = unmatched.len(),
        "computed match plan"
    );

    MatchPlan {
        matches,
        unmatched,
        unhandled_resources,
        unhandled_traits,
    }
}

fn check(transformer: &Transformer, component: &Component) -> MatchDetail {
    let mut detail = MatchDetail::default();

    for (key, constraint) in &transformer.required_labels {
        let present = component.labels.get(key).is_some_and(|v| {
            constraint
                .accepts(&serde_json::Value::String(v.clone()))
                .unwrap_or(false)
        });
        if !present {
            detail.missing_labels.push(key.clone());
        }
    }
    for (fqn, constraint) in &transformer.required_resources {
        let present = component
            .resources
            .get(fqn)
            .is_some_and(|v| constraint.accepts_value(v).unwrap_or(false));
        if !present {
            detail.missing_resources.push(fqn.clone());
        }
    }
    for (fqn, constraint) in &transformer.required_traits {
        let present = component
            .traits
            .get(fqn)
            .is_some_and(|v| constraint.accepts_value(v).unwrap_or(false));
        if !present {
            detail.missing_traits.push(fqn.clone());
        }
    }

    detail.reason = if detail.missing_labels.is_empty()
        && detail.missing_resources.is_empty()
        && detail.missing_traits.is_empty()
    {
        "matched".to_string()
    } else {
        let mut parts = Vec::new();
        if !detail.missing_labels.is_empty() {
            parts.push(format!("missing labels: {}", detail.missing_labels.join(", ")));
        }
        if !detail.missing_resources.is_empty() {
            parts.push(format!(
                "missing resources: {}",
                detail.missing_resources.join(", ")
            ));
        }
        if !detail.missing_traits.is_empty() {
            parts.push(format!("missing traits: {}", detail.missing_traits.join(", ")));
        }
        parts.join("; ")
    };
    detail
}
