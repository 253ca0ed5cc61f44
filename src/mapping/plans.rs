//! Storage for compiled mapping plans.
//!
//! There is at most one current plan per (source, target) connection pair.
//! Saving a new compilation for a pair swaps the stored `Arc` in one write;
//! executions already holding the previous `Arc` are unaffected.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{CompiledMapping, MappingPlan, MappingRuleSpec};
use crate::error::{SyncError, SyncResult};

/// Whether a plan may be executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Active,
    /// A referenced connection was disabled. Re-saving the mapping
    /// reactivates the plan.
    Suspended,
}

/// Client-facing description of a stored plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanView {
    pub id: u64,
    pub version: u32,
    pub source_connection_id: u64,
    pub target_connection_id: u64,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub rules: Vec<MappingRuleSpec>,
}

#[derive(Debug)]
struct PlanEntry {
    plan: Arc<MappingPlan>,
    status: PlanStatus,
}

impl PlanEntry {
    fn view(&self) -> PlanView {
        PlanView {
            id: self.plan.id,
            version: self.plan.version,
            source_connection_id: self.plan.source_connection_id,
            target_connection_id: self.plan.target_connection_id,
            status: self.status,
            created_at: self.plan.created_at,
            rules: self.plan.rules.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    plans: BTreeMap<u64, PlanEntry>,
    by_pair: HashMap<(u64, u64), u64>,
    next_id: u64,
}

/// Owner of all compiled mapping plans
#[derive(Debug, Default)]
pub struct PlanStore {
    inner: RwLock<Inner>,
}

impl PlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a compilation, replacing the current plan for its connection pair.
    pub async fn save(&self, compiled: CompiledMapping) -> Arc<MappingPlan> {
        let pair = (compiled.source_connection_id, compiled.target_connection_id);
        let mut inner = self.inner.write().await;

        let (id, version) = match inner.by_pair.get(&pair).copied() {
            Some(id) => {
                let previous = inner.plans.get(&id).map_or(0, |e| e.plan.version);
                (id, previous + 1)
            }
            None => {
                inner.next_id += 1;
                let id = inner.next_id;
                inner.by_pair.insert(pair, id);
                (id, 1)
            }
        };

        let plan = Arc::new(MappingPlan {
            id,
            version,
            source_connection_id: compiled.source_connection_id,
            target_connection_id: compiled.target_connection_id,
            created_at: Utc::now(),
            steps: compiled.steps,
            rules: compiled.rules,
        });
        inner.plans.insert(
            id,
            PlanEntry {
                plan: Arc::clone(&plan),
                status: PlanStatus::Active,
            },
        );

        tracing::info!(plan_id = id, version, "Mapping plan saved");
        plan
    }

    /// The current plan and its status.
    pub async fn get(&self, id: u64) -> SyncResult<(Arc<MappingPlan>, PlanStatus)> {
        self.inner
            .read()
            .await
            .plans
            .get(&id)
            .map(|e| (Arc::clone(&e.plan), e.status))
            .ok_or_else(|| SyncError::not_found("mapping plan", id))
    }

    pub async fn view(&self, id: u64) -> SyncResult<PlanView> {
        self.inner
            .read()
            .await
            .plans
            .get(&id)
            .map(PlanEntry::view)
            .ok_or_else(|| SyncError::not_found("mapping plan", id))
    }

    /// All plans ordered by id.
    pub async fn list(&self) -> Vec<PlanView> {
        self.inner.read().await.plans.values().map(PlanEntry::view).collect()
    }

    /// Ids of every plan that reads from or writes to the connection.
    pub async fn references(&self, connection_id: u64) -> Vec<u64> {
        self.inner
            .read()
            .await
            .plans
            .values()
            .filter(|e| e.plan.references(connection_id))
            .map(|e| e.plan.id)
            .collect()
    }

    /// Suspend every active plan that references the connection. Returns the
    /// ids that changed state.
    pub async fn suspend_dependents(&self, connection_id: u64) -> Vec<u64> {
        let mut inner = self.inner.write().await;
        let mut suspended = Vec::new();
        for entry in inner.plans.values_mut() {
            if entry.status == PlanStatus::Active && entry.plan.references(connection_id) {
                entry.status = PlanStatus::Suspended;
                suspended.push(entry.plan.id);
            }
        }
        if !suspended.is_empty() {
            tracing::warn!(connection_id, plans = ?suspended, "Suspended dependent mapping plans");
        }
        suspended
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.plans.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingCompiler;

    fn compiled(source: u64, target: u64, target_field: &str) -> CompiledMapping {
        let rules = vec![MappingRuleSpec::new("email", target_field)];
        CompiledMapping {
            source_connection_id: source,
            target_connection_id: target,
            steps: MappingCompiler::default().compile_rules(&rules).unwrap(),
            rules,
        }
    }

    #[tokio::test]
    async fn test_save_assigns_ids_per_pair() {
        let store = PlanStore::new();
        let a = store.save(compiled(1, 2, "x")).await;
        let b = store.save(compiled(2, 3, "x")).await;

        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(a.version, 1);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_resave_replaces_atomically() {
        let store = PlanStore::new();
        let old = store.save(compiled(1, 2, "old_field")).await;
        let new = store.save(compiled(1, 2, "new_field")).await;

        assert_eq!(old.id, new.id);
        assert_eq!(new.version, 2);
        // The previously handed-out plan is untouched.
        assert_eq!(old.target_fields(), vec!["old_field"]);

        let (current, status) = store.get(old.id).await.unwrap();
        assert_eq!(current.target_fields(), vec!["new_field"]);
        assert_eq!(status, PlanStatus::Active);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_suspend_dependents() {
        let store = PlanStore::new();
        let a = store.save(compiled(1, 2, "x")).await;
        let b = store.save(compiled(3, 1, "x")).await;
        let c = store.save(compiled(3, 4, "x")).await;

        let suspended = store.suspend_dependents(1).await;
        assert_eq!(suspended, vec![a.id, b.id]);
        assert_eq!(store.get(c.id).await.unwrap().1, PlanStatus::Active);
        assert_eq!(store.view(a.id).await.unwrap().status, PlanStatus::Suspended);

        // Already suspended plans are not reported twice.
        assert!(store.suspend_dependents(1).await.is_empty());
    }

    #[tokio::test]
    async fn test_resave_reactivates() {
        let store = PlanStore::new();
        let plan = store.save(compiled(1, 2, "x")).await;
        store.suspend_dependents(2).await;

        store.save(compiled(1, 2, "y")).await;
        assert_eq!(store.get(plan.id).await.unwrap().1, PlanStatus::Active);
    }

    #[tokio::test]
    async fn test_references_and_missing() {
        let store = PlanStore::new();
        store.save(compiled(1, 2, "x")).await;

        assert_eq!(store.references(2).await, vec![1]);
        assert!(store.references(5).await.is_empty());
        assert!(store.get(9).await.is_err());
    }
}
