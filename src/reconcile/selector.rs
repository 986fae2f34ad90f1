//! CronJob selector resolution.
//!
//! Matching is split into a pure predicate (unit-testable) and the listing
//! side that walks the namespace scope.

use crate::crd::{CronJobSelector, SelectorExpression, SelectorOperator};
use crate::error::Result;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;

/// Whether a CronJob with this name and label set matches the selector.
/// All present fields are conjunctive.
pub fn cronjob_matches(
    selector: &CronJobSelector,
    name: &str,
    labels: &BTreeMap<String, String>,
) -> bool {
    if !selector.match_names.is_empty() && !selector.match_names.iter().any(|n| n == name) {
        return false;
    }
    for (key, value) in &selector.match_labels {
        if labels.get(key) != Some(value) {
            return false;
        }
    }
    selector
        .match_expressions
        .iter()
        .all(|expression| expression_matches(expression, labels))
}

fn expression_matches(expression: &SelectorExpression, labels: &BTreeMap<String, String>) -> bool {
    match expression.operator {
        SelectorOperator::In => labels
            .get(&expression.key)
            .is_some_and(|value| expression.values.contains(value)),
        SelectorOperator::NotIn => labels
            .get(&expression.key)
            .is_none_or(|value| !expression.values.contains(value)),
        SelectorOperator::Exists => labels.contains_key(&expression.key),
        SelectorOperator::DoesNotExist => !labels.contains_key(&expression.key),
    }
}

/// Whether the selector's namespace scope covers `namespace`.
///
/// `namespace_labels` is consulted only for the label-selector variant;
/// pass the namespace's labels when known.
pub fn namespace_in_scope(
    selector: &CronJobSelector,
    monitor_namespace: &str,
    namespace: &str,
    namespace_labels: &BTreeMap<String, String>,
) -> bool {
    if selector.all_namespaces {
        return true;
    }
    if !selector.namespaces.is_empty() {
        return selector.namespaces.iter().any(|ns| ns == namespace);
    }
    if !selector.namespace_selector.is_empty() {
        return selector
            .namespace_selector
            .iter()
            .all(|(key, value)| namespace_labels.get(key) == Some(value));
    }
    namespace == monitor_namespace
}

/// List every CronJob the selector covers.
pub async fn resolve_cronjobs(
    client: &Client,
    monitor_namespace: &str,
    selector: &CronJobSelector,
) -> Result<Vec<CronJob>> {
    let mut matched = Vec::new();

    if selector.all_namespaces {
        let api: Api<CronJob> = Api::all(client.clone());
        for cronjob in api.list(&ListParams::default()).await?.items {
            if cronjob_matches(selector, &cronjob.name_any(), &labels_of(&cronjob)) {
                matched.push(cronjob);
            }
        }
        return Ok(matched);
    }

    let namespaces: Vec<String> = if !selector.namespaces.is_empty() {
        selector.namespaces.clone()
    } else if !selector.namespace_selector.is_empty() {
        let label_selector = selector
            .namespace_selector
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(",");
        let api: Api<Namespace> = Api::all(client.clone());
        api.list(&ListParams::default().labels(&label_selector))
            .await?
            .items
            .iter()
            .map(|namespace| namespace.name_any())
            .collect()
    } else {
        vec![monitor_namespace.to_string()]
    };

    for namespace in namespaces {
        let api: Api<CronJob> = Api::namespaced(client.clone(), &namespace);
        for cronjob in api.list(&ListParams::default()).await?.items {
            if cronjob_matches(selector, &cronjob.name_any(), &labels_of(&cronjob)) {
                matched.push(cronjob);
            }
        }
    }
    Ok(matched)
}

fn labels_of(cronjob: &CronJob) -> BTreeMap<String, String> {
    cronjob.metadata.labels.clone().unwrap_or_default()
}
