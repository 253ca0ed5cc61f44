//! Sync executor
//!
//! Runs a compiled plan over a batch of records. A record that fails to map is
//! counted and reported, never aborting the batch. Every run, including a
//! cancelled one, ends with exactly one log entry and one webhook event.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};

use super::{LogDraft, LogStore, SyncLogEntry};
use crate::error::SyncResult;
use crate::mapping::{MappingPlan, StepFailure};
use crate::webhooks::{Dispatcher, EventKind, WebhookEvent};

/// Failures quoted in the log entry's error summary
const SUMMARY_FAILURES: usize = 3;

/// One record that could not be mapped
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordFailure {
    pub record_index: usize,
    #[serde(flatten)]
    pub failure: StepFailure,
}

/// Result of one run
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub entry: SyncLogEntry,
    /// Mapped records, in input order, for the records that succeeded
    pub output: Vec<Value>,
    pub failures: Vec<RecordFailure>,
}

/// Applies plans to record batches
#[derive(Debug)]
pub struct SyncExecutor {
    log_store: Arc<LogStore>,
    dispatcher: Arc<Dispatcher>,
    plan_locks: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl SyncExecutor {
    pub fn new(log_store: Arc<LogStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            log_store,
            dispatcher,
            plan_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Take the run lock for `plan_id`. A run holds it from start to log entry.
    pub async fn lock_plan(&self, plan_id: u64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.plan_locks.lock().await;
            Arc::clone(locks.entry(plan_id).or_default())
        };
        lock.lock_owned().await
    }

    /// Run `plan` over `records`.
    ///
    /// Runs of the same plan are serialized; runs of different plans proceed
    /// in parallel. `cancel` is checked before each record; once it reads
    /// `true` the run stops and is logged as partial.
    pub async fn run(
        &self,
        plan: Arc<MappingPlan>,
        records: Vec<Value>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> SyncResult<SyncReport> {
        let _guard = self.lock_plan(plan.id).await;
        self.run_locked(plan, records, cancel).await
    }

    /// [`run`](Self::run) for a caller already holding [`lock_plan`](Self::lock_plan)
    /// for this plan.
    pub async fn run_locked(
        &self,
        plan: Arc<MappingPlan>,
        records: Vec<Value>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> SyncResult<SyncReport> {
        tracing::info!(
            plan_id = plan.id,
            plan_version = plan.version,
            records = records.len(),
            "Starting sync run"
        );

        let mut output = Vec::with_capacity(records.len());
        let mut failures = Vec::new();
        let mut processed = 0usize;
        let mut cancelled = false;

        for (index, record) in records.iter().enumerate() {
            if cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
                cancelled = true;
                tracing::warn!(plan_id = plan.id, processed, "Sync run cancelled");
                break;
            }

            match plan.apply(record) {
                Ok(mapped) => output.push(mapped),
                Err(failure) => {
                    tracing::debug!(plan_id = plan.id, record = index, error = %failure, "Record failed");
                    failures.push(RecordFailure {
                        record_index: index,
                        failure,
                    });
                }
            }
            processed += 1;
        }

        let draft = LogDraft {
            plan_id: plan.id,
            plan_version: plan.version,
            source_connection_id: plan.source_connection_id,
            target_connection_id: plan.target_connection_id,
            // Equals the batch size unless cancelled.
            record_count: processed as u64,
            success_count: output.len() as u64,
            failure_count: failures.len() as u64,
            partial: cancelled,
            error: summarize(&failures, cancelled, processed, records.len()),
        };
        let entry = self.log_store.append(draft).await?;

        tracing::info!(
            plan_id = plan.id,
            log_id = entry.id,
            success = entry.success_count,
            failed = entry.failure_count,
            partial = entry.partial,
            "Sync run finished"
        );

        let kind = if cancelled {
            EventKind::SyncPartial
        } else {
            EventKind::SyncCompleted
        };
        self.dispatcher
            .emit(WebhookEvent::new(kind, json!({ "log": &entry })))
            .await;

        Ok(SyncReport {
            entry,
            output,
            failures,
        })
    }
}

fn summarize(
    failures: &[RecordFailure],
    cancelled: bool,
    processed: usize,
    total: usize,
) -> Option<String> {
    let mut parts = Vec::new();
    if !failures.is_empty() {
        let quoted: Vec<String> = failures
            .iter()
            .take(SUMMARY_FAILURES)
            .map(|f| format!("record {}: {}", f.record_index, f.failure))
            .collect();
        let mut text = format!("{} record(s) failed: {}", failures.len(), quoted.join("; "));
        if failures.len() > SUMMARY_FAILURES {
            text.push_str(&format!("; and {} more", failures.len() - SUMMARY_FAILURES));
        }
        parts.push(text);
    }
    if cancelled {
        parts.push(format!("cancelled after {} of {} records", processed, total));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}
