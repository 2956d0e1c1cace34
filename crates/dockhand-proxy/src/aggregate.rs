//! Merging of per-node answers to cluster-wide queries.
//!
//! Engine list endpoints answer either with a JSON array or, for volumes,
//! with an object holding `Volumes` and `Warnings` lists. Contributions
//! are merged in node-name order and every element is tagged with the
//! node it came from.

use serde_json::{Map, Value, json};

use dockhand_core::RESPONSE_METADATA_KEY;

use crate::error::AggregationError;

const VOLUMES_KEY: &str = "Volumes";
const WARNINGS_KEY: &str = "Warnings";

/// A member whose contribution was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberFailure {
    pub node_name: String,
    pub reason: String,
}

impl MemberFailure {
    pub fn new(node_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            reason: reason.into(),
        }
    }
}

/// The decoded body one member answered with.
#[derive(Debug, Clone)]
pub struct NodeContribution {
    pub node_name: String,
    pub body: Value,
}

/// Result of a cluster-wide query that at least one member answered.
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub body: Value,
    pub failures: Vec<MemberFailure>,
}

impl Aggregation {
    /// Names of the members that did not contribute.
    pub fn unreachable_nodes(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.node_name.as_str()).collect()
    }
}

enum Merged {
    List(Vec<Value>),
    Volumes {
        volumes: Vec<Value>,
        warnings: Vec<Value>,
    },
}

/// Merge the outcome of a fan-out.
///
/// Failed members are recorded and skipped. A body whose shape does not
/// match the others counts as a failure of that member. Only when no
/// member contributes is the whole query an error.
pub fn collect(
    results: Vec<Result<NodeContribution, MemberFailure>>,
) -> Result<Aggregation, AggregationError> {
    let attempted = results.len();
    let mut failures = Vec::new();
    let mut contributions = Vec::new();

    for result in results {
        match result {
            Ok(c) => contributions.push(c),
            Err(f) => failures.push(f),
        }
    }

    contributions.sort_by(|a, b| a.node_name.cmp(&b.node_name));

    let mut merged: Option<Merged> = None;
    for contribution in contributions {
        if let Err(reason) = merge(&mut merged, contribution.body, &contribution.node_name) {
            failures.push(MemberFailure::new(contribution.node_name, reason));
        }
    }

    failures.sort_by(|a, b| a.node_name.cmp(&b.node_name));

    if attempted > 0 && merged.is_none() {
        return Err(AggregationError {
            attempted,
            failures,
        });
    }

    let body = match merged {
        None => Value::Array(Vec::new()),
        Some(Merged::List(items)) => Value::Array(items),
        Some(Merged::Volumes { volumes, warnings }) => {
            let mut object = Map::new();
            object.insert(VOLUMES_KEY.to_string(), Value::Array(volumes));
            object.insert(WARNINGS_KEY.to_string(), Value::Array(warnings));
            Value::Object(object)
        }
    };

    Ok(Aggregation { body, failures })
}

fn merge(merged: &mut Option<Merged>, body: Value, node_name: &str) -> Result<(), String> {
    match (merged.as_mut(), body) {
        (None, Value::Array(items)) => {
            *merged = Some(Merged::List(annotate_all(items, node_name)));
        }
        (None, Value::Object(object)) => {
            let (volumes, warnings) = split_volumes(object)?;
            *merged = Some(Merged::Volumes {
                volumes: annotate_all(volumes, node_name),
                warnings,
            });
        }
        (Some(Merged::List(list)), Value::Array(items)) => {
            list.extend(annotate_all(items, node_name));
        }
        (Some(Merged::Volumes { volumes, warnings }), Value::Object(object)) => {
            let (more_volumes, more_warnings) = split_volumes(object)?;
            volumes.extend(annotate_all(more_volumes, node_name));
            warnings.extend(more_warnings);
        }
        (_, other) => return Err(format!("unexpected response shape: {}", kind(&other))),
    }
    Ok(())
}

fn split_volumes(mut object: Map<String, Value>) -> Result<(Vec<Value>, Vec<Value>), String> {
    let volumes = match object.remove(VOLUMES_KEY) {
        Some(Value::Array(items)) => items,
        Some(Value::Null) => Vec::new(),
        Some(other) => return Err(format!("unexpected Volumes field: {}", kind(&other))),
        None => return Err("object without a Volumes field".to_string()),
    };
    let warnings = match object.remove(WARNINGS_KEY) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };
    Ok((volumes, warnings))
}

fn annotate_all(mut items: Vec<Value>, node_name: &str) -> Vec<Value> {
    for item in &mut items {
        annotate(item, node_name);
    }
    items
}

/// Tag an element with the node it was read from. Non-objects are left
/// untouched.
pub fn annotate(item: &mut Value, node_name: &str) {
    if let Value::Object(object) = item {
        object.insert(
            RESPONSE_METADATA_KEY.to_string(),
            json!({ "Agent": { "NodeName": node_name } }),
        );
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(node: &str, body: Value) -> Result<NodeContribution, MemberFailure> {
        Ok(NodeContribution {
            node_name: node.to_string(),
            body,
        })
    }

    fn failed(node: &str) -> Result<NodeContribution, MemberFailure> {
        Err(MemberFailure::new(node, "connection refused"))
    }

    #[test]
    fn lists_are_concatenated_in_node_order() {
        let aggregation = collect(vec![
            ok("node-b", json!([{ "Id": "b1" }])),
            ok("node-a", json!([{ "Id": "a1" }, { "Id": "a2" }])),
        ])
        .unwrap();

        let items = aggregation.body.as_array().unwrap();
        let ids: Vec<_> = items.iter().map(|i| i["Id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["a1", "a2", "b1"]);
        assert_eq!(items[0]["Dockhand"]["Agent"]["NodeName"], "node-a");
        assert_eq!(items[2]["Dockhand"]["Agent"]["NodeName"], "node-b");
        assert!(aggregation.failures.is_empty());
    }

    #[test]
    fn partial_failure_keeps_the_successful_contribution() {
        let aggregation = collect(vec![ok("node-a", json!([{ "Id": "a1" }])), failed("node-b")]).unwrap();

        assert_eq!(aggregation.body.as_array().unwrap().len(), 1);
        assert_eq!(aggregation.unreachable_nodes(), vec!["node-b"]);
    }

    #[test]
    fn all_members_failing_is_an_error() {
        let err = collect(vec![failed("node-b"), failed("node-a")]).unwrap_err();
        assert_eq!(err.attempted, 2);
        assert_eq!(err.failures[0].node_name, "node-a");
        assert_eq!(err.failures[1].node_name, "node-b");
    }

    #[test]
    fn volume_objects_merge_both_lists() {
        let aggregation = collect(vec![
            ok("node-a", json!({ "Volumes": [{ "Name": "data" }], "Warnings": null })),
            ok("node-b", json!({ "Volumes": [{ "Name": "logs" }], "Warnings": ["slow disk"] })),
        ])
        .unwrap();

        let volumes = aggregation.body["Volumes"].as_array().unwrap();
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[1]["Dockhand"]["Agent"]["NodeName"], "node-b");
        assert_eq!(aggregation.body["Warnings"], json!(["slow disk"]));
    }

    #[test]
    fn mismatched_shape_is_recorded_as_failure() {
        let aggregation = collect(vec![
            ok("node-a", json!([{ "Id": "a1" }])),
            ok("node-b", json!("oops")),
        ])
        .unwrap();

        assert_eq!(aggregation.body.as_array().unwrap().len(), 1);
        assert_eq!(aggregation.failures.len(), 1);
        assert!(aggregation.failures[0].reason.contains("string"));
    }

    #[test]
    fn empty_node_answer_is_not_a_failure() {
        let aggregation = collect(vec![ok("node-a", json!([])), ok("node-b", json!([]))]).unwrap();
        assert_eq!(aggregation.body, json!([]));
        assert!(aggregation.failures.is_empty());
    }
}
