//! The engine: one owner for every component, created by [`Engine::init`] and
//! torn down by [`Engine::shutdown`].
//!
//! Operations that touch more than one component go through here:
//! disabling a connection suspends its plans, a referenced connection cannot
//! be deleted, saving mappings and finishing runs emit webhook events.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{watch, Mutex, RwLock};

use crate::config::AppConfig;
use crate::connections::{Connection, ConnectionRegistry, ConnectionSpec};
use crate::error::{SyncError, SyncResult};
use crate::mapping::{MappingCompiler, MappingRequest, PlanStatus, PlanStore, PlanView, Transform};
use crate::sync::{LogFilter, LogQuery, LogStore, SyncExecutor, SyncReport};
use crate::webhooks::{
    DeliveryRecord, Dispatcher, EventKind, HttpTransport, Webhook, WebhookEvent,
    WebhookRegistry, WebhookSpec, WebhookTransport,
};

/// Result of disabling a connection
#[derive(Debug, Clone)]
pub struct DisableOutcome {
    pub connection: Connection,
    /// Plans that moved from active to suspended
    pub suspended_plans: Vec<u64>,
}

#[derive(Debug)]
pub struct Engine {
    config: AppConfig,
    connections: ConnectionRegistry,
    compiler: RwLock<MappingCompiler>,
    plans: PlanStore,
    webhooks: Arc<WebhookRegistry>,
    dispatcher: Arc<Dispatcher>,
    log_store: Arc<LogStore>,
    executor: SyncExecutor,
    /// Serializes changes to which connections plans may reference
    topology: Mutex<()>,
}

impl Engine {
    /// Build every component with the HTTP webhook transport.
    ///
    /// # Errors
    /// `Storage` if the configured log file cannot be opened or reloaded,
    /// `Delivery` if the HTTP client cannot be built.
    pub async fn init(config: AppConfig) -> SyncResult<Self> {
        let transport = HttpTransport::new(config.dispatcher.request_timeout())
            .map_err(|e| SyncError::Delivery(e.to_string()))?;
        Self::with_transport(config, Arc::new(transport)).await
    }

    /// Build every component around the given transport.
    pub async fn with_transport(
        config: AppConfig,
        transport: Arc<dyn WebhookTransport>,
    ) -> SyncResult<Self> {
        let log_store = Arc::new(match &config.log_store.path {
            Some(path) => LogStore::open(path).await?,
            None => LogStore::in_memory(),
        });
        let webhooks = Arc::new(WebhookRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&webhooks),
            transport,
            config.dispatcher.retry_policy(),
        ));
        let executor = SyncExecutor::new(Arc::clone(&log_store), Arc::clone(&dispatcher));

        tracing::info!(
            log_file = ?log_store.path(),
            restored_entries = log_store.len().await,
            max_attempts = config.dispatcher.max_attempts,
            "Engine initialized"
        );

        Ok(Self {
            config,
            connections: ConnectionRegistry::new(),
            compiler: RwLock::new(MappingCompiler::default()),
            plans: PlanStore::new(),
            webhooks,
            dispatcher,
            log_store,
            executor,
            topology: Mutex::new(()),
        })
    }

    /// Wait for in-flight webhook deliveries, then release the engine.
    pub async fn shutdown(&self) {
        tracing::info!("Engine shutting down");
        self.dispatcher.drain().await;
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    // --- connections ---

    pub async fn create_connection(&self, spec: ConnectionSpec) -> SyncResult<Connection> {
        self.connections.create(spec).await
    }

    pub async fn get_connection(&self, id: u64) -> SyncResult<Connection> {
        self.connections.get(id).await
    }

    pub async fn list_connections(&self) -> Vec<Connection> {
        self.connections.list().await
    }

    pub async fn update_connection(&self, id: u64, spec: ConnectionSpec) -> SyncResult<Connection> {
        self.connections.update(id, spec).await
    }

    /// Disable a connection and suspend every active plan that uses it.
    pub async fn disable_connection(&self, id: u64) -> SyncResult<DisableOutcome> {
        let _topology = self.topology.lock().await;
        let connection = self.connections.disable(id).await?;
        let suspended_plans = self.plans.suspend_dependents(id).await;

        self.dispatcher
            .emit(WebhookEvent::new(
                EventKind::ConnectionDisabled,
                json!({
                    "connection_id": id,
                    "suspended_plans": &suspended_plans,
                }),
            ))
            .await;

        Ok(DisableOutcome {
            connection,
            suspended_plans,
        })
    }

    /// Re-enable a connection. Suspended plans stay suspended until their
    /// mappings are saved again.
    pub async fn enable_connection(&self, id: u64) -> SyncResult<Connection> {
        self.connections.enable(id).await
    }

    pub async fn delete_connection(&self, id: u64) -> SyncResult<Connection> {
        let _topology = self.topology.lock().await;
        self.connections.get(id).await?;
        if let Some(plan_id) = self.plans.references(id).await.first() {
            return Err(SyncError::Validation(format!(
                "connection {} is referenced by mapping plan {}",
                id, plan_id
            )));
        }
        self.connections.remove(id).await
    }

    // --- mappings ---

    /// Compile and store a mapping, replacing the plan for the same
    /// connection pair.
    pub async fn save_mapping(&self, request: MappingRequest) -> SyncResult<PlanView> {
        let _topology = self.topology.lock().await;
        let compiled = self
            .compiler
            .read()
            .await
            .compile(&request, &self.connections)
            .await
            .inspect_err(|e| tracing::info!(error = %e, "Mapping rejected"))?;
        let plan = self.plans.save(compiled).await;

        self.dispatcher
            .emit(WebhookEvent::new(
                EventKind::MappingSaved,
                json!({
                    "plan_id": plan.id,
                    "version": plan.version,
                    "source_connection_id": plan.source_connection_id,
                    "target_connection_id": plan.target_connection_id,
                }),
            ))
            .await;

        self.plans.view(plan.id).await
    }

    pub async fn get_plan(&self, id: u64) -> SyncResult<PlanView> {
        self.plans.view(id).await
    }

    pub async fn list_plans(&self) -> Vec<PlanView> {
        self.plans.list().await
    }

    /// Make a transform available to mappings saved from now on.
    pub async fn register_transform(&self, transform: Arc<dyn Transform>) {
        let name = transform.name().to_string();
        self.compiler.write().await.register(transform);
        tracing::info!(transform = %name, "Transform registered");
    }

    // --- sync ---

    /// Run the current plan `plan_id` over `records`.
    ///
    /// # Errors
    /// `NotFound` for an unknown plan, `Validation` for a suspended one,
    /// `Storage` if the log entry cannot be written.
    pub async fn run_sync(
        &self,
        plan_id: u64,
        records: Vec<Value>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> SyncResult<SyncReport> {
        // Status is read under the run lock so a run queued behind another
        // run of the same plan sees a suspension that happened meanwhile.
        let _guard = self.executor.lock_plan(plan_id).await;
        let (plan, status) = self.plans.get(plan_id).await?;
        if status == PlanStatus::Suspended {
            return Err(SyncError::Validation(format!(
                "mapping plan {} is suspended; save its mappings again to reactivate it",
                plan_id
            )));
        }
        self.executor.run_locked(plan, records, cancel).await
    }

    pub async fn query_logs(&self, filter: LogFilter) -> LogQuery {
        self.log_store.query(filter).await
    }

    // --- webhooks ---

    pub async fn create_webhook(&self, spec: WebhookSpec) -> SyncResult<Webhook> {
        if let Some(connection_id) = spec.connection_id {
            self.connections.get(connection_id).await?;
        }
        self.webhooks.create(spec).await
    }

    pub async fn list_webhooks(&self) -> Vec<Webhook> {
        self.webhooks.list().await
    }

    pub async fn list_active_webhooks(&self) -> Vec<Webhook> {
        self.webhooks.list_active().await
    }

    pub async fn set_webhook_enabled(&self, id: u64, enabled: bool) -> SyncResult<Webhook> {
        self.webhooks.set_enabled(id, enabled).await
    }

    pub async fn delete_webhook(&self, id: u64) -> SyncResult<Webhook> {
        self.webhooks.delete(id).await
    }

    pub async fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.dispatcher.deliveries().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::ConnectionKind;
    use crate::error::ErrorKind;
    use crate::mapping::MappingRuleSpec;
    use crate::webhooks::{OutgoingDelivery, TransportError};
    use async_trait::async_trait;

    struct AcceptAll;

    #[async_trait]
    impl WebhookTransport for AcceptAll {
        async fn send(&self, _delivery: &OutgoingDelivery) -> Result<(), TransportError> {
            Ok(())
        }
    }

    async fn engine() -> Engine {
        Engine::with_transport(AppConfig::default(), Arc::new(AcceptAll))
            .await
            .unwrap()
    }

    async fn two_connections(engine: &Engine) -> (u64, u64) {
        let a = engine
            .create_connection(ConnectionSpec::new("fb", ConnectionKind::Facebook, "t1"))
            .await
            .unwrap();
        let b = engine
            .create_connection(ConnectionSpec::new("crm", ConnectionKind::Bitrix24, "t2"))
            .await
            .unwrap();
        (a.id, b.id)
    }

    fn email_mapping(source: u64, target: u64) -> MappingRequest {
        MappingRequest {
            source_connection_id: source,
            target_connection_id: target,
            rules: vec![MappingRuleSpec::new("email", "contact_email")],
        }
    }

    #[tokio::test]
    async fn test_disable_suspends_plan_and_blocks_runs() {
        let engine = engine().await;
        let (a, b) = two_connections(&engine).await;
        let plan = engine.save_mapping(email_mapping(a, b)).await.unwrap();

        let outcome = engine.disable_connection(a).await.unwrap();
        assert_eq!(outcome.suspended_plans, vec![plan.id]);
        assert!(!outcome.connection.is_active());
        assert_eq!(
            engine.get_plan(plan.id).await.unwrap().status,
            PlanStatus::Suspended
        );

        let err = engine
            .run_sync(plan.id, vec![json!({"email": "x"})], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("suspended"));
    }

    #[tokio::test]
    async fn test_queued_run_sees_suspension() {
        let engine = Arc::new(engine().await);
        let (a, b) = two_connections(&engine).await;
        let plan = engine.save_mapping(email_mapping(a, b)).await.unwrap();

        // Stand in for a run already in flight on this plan.
        let in_flight = engine.executor.lock_plan(plan.id).await;

        let queued = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .run_sync(plan.id, vec![json!({"email": "x"})], None)
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let outcome = engine.disable_connection(a).await.unwrap();
        assert_eq!(outcome.suspended_plans, vec![plan.id]);
        drop(in_flight);

        let err = queued.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(engine.log_store.len().await, 0);
    }

    #[tokio::test]
    async fn test_enable_then_resave_reactivates() {
        let engine = engine().await;
        let (a, b) = two_connections(&engine).await;
        let plan = engine.save_mapping(email_mapping(a, b)).await.unwrap();
        engine.disable_connection(b).await.unwrap();

        // Saving against a disabled connection is a compilation error.
        let err = engine.save_mapping(email_mapping(a, b)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Compilation);

        engine.enable_connection(b).await.unwrap();
        assert_eq!(
            engine.get_plan(plan.id).await.unwrap().status,
            PlanStatus::Suspended
        );

        let resaved = engine.save_mapping(email_mapping(a, b)).await.unwrap();
        assert_eq!(resaved.id, plan.id);
        assert_eq!(resaved.version, 2);
        assert_eq!(resaved.status, PlanStatus::Active);
    }

    #[tokio::test]
    async fn test_delete_referenced_connection_rejected() {
        let engine = engine().await;
        let (a, b) = two_connections(&engine).await;
        let plan = engine.save_mapping(email_mapping(a, b)).await.unwrap();

        let err = engine.delete_connection(b).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(
            err.to_string(),
            format!(
                "validation error: connection {} is referenced by mapping plan {}",
                b, plan.id
            )
        );

        let c = engine
            .create_connection(ConnectionSpec::new("spare", ConnectionKind::Hubspot, "t3"))
            .await
            .unwrap();
        engine.delete_connection(c.id).await.unwrap();
        assert_eq!(
            engine.delete_connection(c.id).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_run_sync_writes_log() {
        let engine = engine().await;
        let (a, b) = two_connections(&engine).await;
        let plan = engine.save_mapping(email_mapping(a, b)).await.unwrap();

        let report = engine
            .run_sync(
                plan.id,
                vec![json!({"email": "a"}), json!({}), json!({"email": "c"})],
                None,
            )
            .await
            .unwrap();
        assert_eq!(report.entry.success_count, 2);

        let logs: Vec<_> = engine.query_logs(LogFilter::for_plan(plan.id)).await.collect();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].failure_count, 1);

        assert_eq!(
            engine.run_sync(99, vec![], None).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_events_are_delivered_to_subscribers() {
        let engine = engine().await;
        let (a, b) = two_connections(&engine).await;
        engine
            .create_webhook(WebhookSpec::new(
                "https://hooks.test/in",
                [EventKind::MappingSaved, EventKind::ConnectionDisabled],
            ))
            .await
            .unwrap();

        engine.save_mapping(email_mapping(a, b)).await.unwrap();
        engine.disable_connection(a).await.unwrap();
        engine.shutdown().await;

        let events: Vec<EventKind> = engine.deliveries().await.iter().map(|d| d.event).collect();
        assert_eq!(
            events,
            vec![EventKind::MappingSaved, EventKind::ConnectionDisabled]
        );
    }

    #[tokio::test]
    async fn test_webhook_for_unknown_connection_rejected() {
        let engine = engine().await;
        let mut spec = WebhookSpec::new("https://hooks.test/in", [EventKind::SyncCompleted]);
        spec.connection_id = Some(42);
        assert_eq!(
            engine.create_webhook(spec).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
