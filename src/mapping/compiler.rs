//! Mapping compiler
//!
//! Compilation is all-or-nothing: the first failed check aborts with a
//! `SyncError::Compilation` and nothing is produced.

use std::collections::HashSet;
use std::sync::Arc;

use super::{
    FieldPath, MappingRequest, MappingRuleSpec, PlanStep, Transform, TransformRegistry,
};
use crate::connections::ConnectionRegistry;
use crate::error::{SyncError, SyncResult};

/// Output of a successful compilation, not yet stored.
#[derive(Debug, Clone)]
pub struct CompiledMapping {
    pub source_connection_id: u64,
    pub target_connection_id: u64,
    pub steps: Vec<PlanStep>,
    pub rules: Vec<MappingRuleSpec>,
}

/// Validates mapping requests and resolves their transforms
#[derive(Debug, Clone)]
pub struct MappingCompiler {
    transforms: TransformRegistry,
}

impl Default for MappingCompiler {
    fn default() -> Self {
        Self::new(TransformRegistry::with_builtins())
    }
}

impl MappingCompiler {
    pub fn new(transforms: TransformRegistry) -> Self {
        Self { transforms }
    }

    pub fn transforms(&self) -> &TransformRegistry {
        &self.transforms
    }

    /// Make an additional transform available to later compilations.
    pub fn register(&mut self, transform: Arc<dyn Transform>) {
        self.transforms.register(transform);
    }

    /// Check the rule count and both connections, then compile the rules.
    pub async fn compile(
        &self,
        request: &MappingRequest,
        connections: &ConnectionRegistry,
    ) -> SyncResult<CompiledMapping> {
        if request.rules.is_empty() {
            return Err(SyncError::compilation("no mapping rules provided"));
        }
        if request.source_connection_id == request.target_connection_id {
            return Err(SyncError::compilation(
                "source and target connection cannot be the same",
            ));
        }

        for (side, id) in [
            ("source", request.source_connection_id),
            ("target", request.target_connection_id),
        ] {
            let connection = connections.get(id).await.map_err(|_| {
                SyncError::compilation(format!("{} connection {} does not exist", side, id))
            })?;
            if !connection.is_active() {
                return Err(SyncError::compilation(format!(
                    "{} connection {} is disabled",
                    side, id
                )));
            }
        }

        let steps = self.compile_rules(&request.rules)?;
        tracing::debug!(
            source_connection_id = request.source_connection_id,
            target_connection_id = request.target_connection_id,
            steps = steps.len(),
            "Mapping compiled"
        );

        Ok(CompiledMapping {
            source_connection_id: request.source_connection_id,
            target_connection_id: request.target_connection_id,
            steps,
            rules: request.rules.clone(),
        })
    }

    /// Compile the rule list alone: paths, target uniqueness, transforms.
    pub fn compile_rules(&self, rules: &[MappingRuleSpec]) -> SyncResult<Vec<PlanStep>> {
        if rules.is_empty() {
            return Err(SyncError::compilation("no mapping rules provided"));
        }

        let mut steps: Vec<PlanStep> = Vec::with_capacity(rules.len());
        let mut seen_targets: HashSet<String> = HashSet::new();

        for (index, rule) in rules.iter().enumerate() {
            let source = FieldPath::parse(&rule.source_field)
                .map_err(|e| SyncError::compilation_at(format!("source: {}", e), index, rule))?;
            let target = FieldPath::parse(&rule.target_field)
                .map_err(|e| SyncError::compilation_at(format!("target: {}", e), index, rule))?;

            if !seen_targets.insert(target.as_str().to_string()) {
                return Err(SyncError::compilation_at(
                    format!("duplicate target field '{}'", target),
                    index,
                    rule,
                ));
            }
            if let Some(other) = steps.iter().find(|s| s.target.overlaps(&target)) {
                return Err(SyncError::compilation_at(
                    format!("target field '{}' overlaps '{}'", target, other.target),
                    index,
                    rule,
                ));
            }

            let transform = rule
                .transform
                .as_deref()
                .filter(|tag| !tag.trim().is_empty())
                .map(|tag| self.transforms.resolve(tag))
                .transpose()
                .map_err(|e| SyncError::compilation_at(e, index, rule))?;

            steps.push(PlanStep {
                source,
                target,
                transform,
            });
        }

        Ok(steps)
    }
}
