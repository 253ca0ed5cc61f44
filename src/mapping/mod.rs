//! Field mappings
//!
//! A mapping request is a list of rules `source field -> target field` with an
//! optional transform tag, bound to a source and a target connection. The
//! [`MappingCompiler`] turns a request into an immutable [`MappingPlan`] of
//! executable steps, and the [`PlanStore`] keeps the current plan for each
//! connection pair.

pub mod compiler;
pub mod path;
pub mod plans;
pub mod transform;

pub use compiler::{CompiledMapping, MappingCompiler};
pub use path::FieldPath;
pub use plans::{PlanStatus, PlanStore, PlanView};
pub use transform::{BoundTransform, Transform, TransformError, TransformRegistry};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// One rule as submitted by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRuleSpec {
    pub source_field: String,
    pub target_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
}

impl MappingRuleSpec {
    pub fn new(source_field: impl Into<String>, target_field: impl Into<String>) -> Self {
        Self {
            source_field: source_field.into(),
            target_field: target_field.into(),
            transform: None,
        }
    }

    pub fn with_transform(mut self, tag: impl Into<String>) -> Self {
        self.transform = Some(tag.into());
        self
    }
}

/// A full set of rules for one connection pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingRequest {
    pub source_connection_id: u64,
    pub target_connection_id: u64,
    pub rules: Vec<MappingRuleSpec>,
}

/// An executable step: read, transform, write.
#[derive(Debug, Clone)]
pub struct PlanStep {
    pub source: FieldPath,
    pub target: FieldPath,
    pub transform: Option<BoundTransform>,
}

/// A record that could not be mapped, and the step that rejected it.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("rule {rule_index} ({source_field} -> {target_field}): {reason}")]
pub struct StepFailure {
    pub rule_index: usize,
    pub source_field: String,
    pub target_field: String,
    pub reason: String,
}

/// A compiled, immutable mapping plan.
///
/// Plans are shared as `Arc<MappingPlan>`; replacing the rules for a
/// connection pair creates a new plan with the same id and a higher version.
#[derive(Debug, Clone)]
pub struct MappingPlan {
    pub id: u64,
    pub version: u32,
    pub source_connection_id: u64,
    pub target_connection_id: u64,
    pub created_at: DateTime<Utc>,
    pub steps: Vec<PlanStep>,
    pub rules: Vec<MappingRuleSpec>,
}

impl MappingPlan {
    /// Apply every step in order to one record, producing the target record.
    pub fn apply(&self, record: &Value) -> Result<Value, StepFailure> {
        if !record.is_object() {
            return Err(StepFailure {
                rule_index: 0,
                source_field: String::new(),
                target_field: String::new(),
                reason: "record is not a JSON object".to_string(),
            });
        }

        let mut out = Map::new();
        for (index, step) in self.steps.iter().enumerate() {
            let fail = |reason: String| StepFailure {
                rule_index: index,
                source_field: step.source.to_string(),
                target_field: step.target.to_string(),
                reason,
            };

            let input = step.source.read(record);
            let value = match &step.transform {
                Some(transform) => transform.apply(input).map_err(|e| fail(e.to_string()))?,
                None => input
                    .cloned()
                    .ok_or_else(|| fail(TransformError::MissingValue.to_string()))?,
            };
            step.target.write(&mut out, value).map_err(fail)?;
        }
        Ok(Value::Object(out))
    }

    /// Target paths in step order.
    pub fn target_fields(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.target.as_str()).collect()
    }

    /// True when either side of the plan is the given connection.
    pub fn references(&self, connection_id: u64) -> bool {
        self.source_connection_id == connection_id || self.target_connection_id == connection_id
    }
}
