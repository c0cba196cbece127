use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, field, info, instrument, warn, Span};

use super::registry::RunningStateRegistry;
use super::watch::{is_supported, WatchEvent, WatchSource};
use super::workload::{HandlerContext, ObservedState, Workload};
use super::Diagnostics;
use crate::config::WatchScope;
use crate::resources::entity::{same_content, Entity};
use crate::resources::status::StatusReporter;
use crate::{telemetry, Error, Metrics, Result};

/// What a full reconciliation has to do, by entity name
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconciliationPlan {
    pub to_create: Vec<String>,
    pub to_delete: Vec<String>,
    pub to_modify: Vec<String>,
    pub in_sync: Vec<String>,
}

impl ReconciliationPlan {
    pub fn compute<E>(
        desired: &BTreeMap<String, E>,
        actual: &BTreeMap<String, ObservedState>,
        replicas: impl Fn(&E) -> i32,
    ) -> Self {
        let mut plan = Self::default();
        for (name, entity) in desired {
            match actual.get(name) {
                None => plan.to_create.push(name.clone()),
                Some(observed) if observed.replicas != replicas(entity) => {
                    plan.to_modify.push(name.clone())
                }
                Some(_) => plan.in_sync.push(name.clone()),
            }
        }
        plan.to_delete = actual
            .keys()
            .filter(|name| !desired.contains_key(*name))
            .cloned()
            .collect();
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_delete.is_empty() && self.to_modify.is_empty()
    }
}

/// Applies watch events and periodic full reconciliations for one kind in one scope
pub struct ReconciliationEngine<W: Workload> {
    workload: Arc<W>,
    source: Arc<dyn WatchSource>,
    scope: WatchScope,
    registry: Mutex<RunningStateRegistry<W::Entity>>,
    reconciled: Arc<AtomicBool>,
    status: Option<StatusReporter>,
    metrics: Metrics,
    diagnostics: Arc<RwLock<Diagnostics>>,
    operation_timeout: Duration,
}

impl<W: Workload> ReconciliationEngine<W> {
    pub fn new(workload: Arc<W>, source: Arc<dyn WatchSource>, scope: WatchScope) -> Self {
        Self {
            workload,
            source,
            scope,
            registry: Mutex::new(RunningStateRegistry::default()),
            reconciled: Arc::new(AtomicBool::new(false)),
            status: None,
            metrics: Metrics::default(),
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            operation_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_status(mut self, status: Option<StatusReporter>) -> Self {
        self.status = status;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<RwLock<Diagnostics>>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set once the first full reconciliation completed
    pub fn reconciled_flag(&self) -> Arc<AtomicBool> {
        self.reconciled.clone()
    }

    pub fn is_reconciled(&self) -> bool {
        self.reconciled.load(Ordering::Acquire)
    }

    pub async fn registry(&self) -> RunningStateRegistry<W::Entity> {
        self.registry.lock().await.clone()
    }

    fn kind(&self) -> &str {
        &self.workload.declaration().kind
    }

    pub async fn handle(&self, event: WatchEvent<W::Entity>) {
        let mut registry = self.registry.lock().await;
        self.process(&mut registry, event).await;
    }

    #[instrument(skip(self, registry, event), fields(kind = %self.kind(), namespace = %self.scope, trace_id))]
    async fn process(&self, registry: &mut RunningStateRegistry<W::Entity>, event: WatchEvent<W::Entity>) {
        if let Some(trace_id) = telemetry::get_trace_id() {
            Span::current().record("trace_id", field::display(&trace_id));
        }
        let action = event.action();
        self.diagnostics.write().await.last_event = Utc::now();

        match event {
            WatchEvent::Added(entity, namespace) => {
                self.add(registry, entity, &namespace).await;
            }
            WatchEvent::Deleted(entity, namespace) => {
                self.delete(registry, entity, &namespace).await;
            }
            WatchEvent::Modified(entity, namespace) => {
                self.modify(registry, entity, &namespace).await;
            }
            WatchEvent::Error(message) => {
                warn!("{} watch reported an error: {message}", self.kind());
            }
        }

        self.metrics
            .event_handled(self.kind(), self.scope.label(), action);
        self.metrics
            .set_running(self.kind(), self.scope.label(), registry.len());
    }

    async fn add(&self, registry: &mut RunningStateRegistry<W::Entity>, entity: W::Entity, namespace: &str) -> bool {
        let name = entity.name().to_string();
        info!("creating {} {name} in namespace {namespace}", self.kind());
        let ctx = self.context(namespace);
        match self.bounded(self.workload.on_add(&entity, &ctx)).await {
            Ok(()) => {
                info!("{} {name} has been created", self.kind());
                registry.put(entity);
                true
            }
            Err(err) => {
                self.failed("create", &name, namespace, &err);
                false
            }
        }
    }

    async fn delete(&self, registry: &mut RunningStateRegistry<W::Entity>, entity: W::Entity, namespace: &str) -> bool {
        let name = entity.name().to_string();
        info!("deleting {} {name} in namespace {namespace}", self.kind());
        let ctx = self.context(namespace);
        match self.bounded(self.workload.on_delete(&entity, &ctx)).await {
            Ok(()) => {
                info!("{} {name} has been deleted", self.kind());
                registry.delete(&name);
                true
            }
            Err(err) => {
                self.failed("delete", &name, namespace, &err);
                false
            }
        }
    }

    async fn modify(&self, registry: &mut RunningStateRegistry<W::Entity>, entity: W::Entity, namespace: &str) -> bool {
        let name = entity.name().to_string();
        let previous = registry.get(&name).cloned();
        if previous.as_ref().is_some_and(|previous| same_content(previous, &entity)) {
            debug!("{} {name} did not change, nothing to do", self.kind());
            return true;
        }

        info!("modifying {} {name} in namespace {namespace}", self.kind());
        let ctx = self.context(namespace);
        match self
            .bounded(self.workload.on_modify(previous.as_ref(), &entity, &ctx))
            .await
        {
            Ok(()) => {
                info!("{} {name} has been modified", self.kind());
                registry.put(entity);
                true
            }
            Err(err) => {
                self.failed("modify", &name, namespace, &err);
                false
            }
        }
    }

    fn failed(&self, operation: &str, name: &str, namespace: &str, err: &Error) {
        warn!(
            "Unable to {operation} {} {name} in namespace {namespace}: {err}",
            self.kind()
        );
        self.metrics
            .handler_failure(self.kind(), self.scope.label(), err);
    }

    fn context(&self, namespace: &str) -> HandlerContext {
        HandlerContext {
            namespace: namespace.to_string(),
            status: self.status.clone(),
        }
    }

    async fn bounded<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.operation_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(Error::OperationTimeout(self.operation_timeout)),
        }
    }

    fn namespace_of(&self, entity: &W::Entity) -> String {
        entity
            .namespace()
            .or(self.scope.namespace())
            .unwrap_or_default()
            .to_string()
    }

    /// Decodes every watched object in scope, skipping the ones that can not be decoded
    async fn desired(&self) -> Result<BTreeMap<String, W::Entity>> {
        let (objects, _) = self.source.list().await?;
        let mut desired = BTreeMap::new();
        for object in objects {
            if !is_supported(self.workload.as_ref(), &object) {
                continue;
            }
            let Some(entity) = object.decode(self.workload.codec()) else {
                warn!(
                    "Skipping {} {}, it can not be decoded",
                    self.kind(),
                    object.name()
                );
                continue;
            };
            let name = entity.name().to_string();
            if desired.insert(name.clone(), entity).is_some() {
                warn!(
                    "{} {name} exists in more than one namespace, only the last one is reconciled",
                    self.kind()
                );
            }
        }
        Ok(desired)
    }

    /// Compares desired and actual state and creates, deletes or modifies what differs
    #[instrument(skip(self), fields(kind = %self.kind(), namespace = %self.scope, trace_id))]
    pub async fn reconcile_all(&self) -> Result<ReconciliationPlan> {
        if let Some(trace_id) = telemetry::get_trace_id() {
            Span::current().record("trace_id", field::display(&trace_id));
        }
        let mut registry = self.registry.lock().await;
        let _timer = self
            .metrics
            .count_and_measure(self.kind(), self.scope.label());
        info!(
            "Running full reconciliation for namespace {} and kind {}",
            self.scope,
            self.kind()
        );

        let desired = self.desired().await?;
        let actual = self.bounded(self.workload.observe(&self.scope)).await?;
        let plan = ReconciliationPlan::compute(&desired, &actual, |entity| {
            self.workload.desired_replicas(entity)
        });

        if plan.is_empty() {
            info!("no change was detected during the reconciliation");
        } else {
            info!(
                create = ?plan.to_create,
                delete = ?plan.to_delete,
                modify = ?plan.to_modify,
                "reconciling {}", self.kind()
            );
        }

        for name in &plan.to_create {
            if let Some(entity) = desired.get(name) {
                let namespace = self.namespace_of(entity);
                self.add(&mut registry, entity.clone(), &namespace).await;
            }
        }

        for name in &plan.to_delete {
            if let Some(observed) = actual.get(name) {
                let mut entity = W::Entity::default();
                entity.set_name(name.clone());
                entity.set_namespace(observed.namespace.clone());
                self.delete(&mut registry, entity, &observed.namespace).await;
            }
        }

        for name in &plan.to_modify {
            if let (Some(entity), Some(observed)) = (desired.get(name), actual.get(name)) {
                let mut belief = registry.get(name).cloned().unwrap_or_else(|| entity.clone());
                self.workload
                    .set_observed_replicas(&mut belief, observed.replicas);
                registry.put(belief);
                self.modify(&mut registry, entity.clone(), &observed.namespace)
                    .await;
            }
        }

        for name in &plan.in_sync {
            if registry.get(name).is_none() {
                if let Some(entity) = desired.get(name) {
                    registry.put(entity.clone());
                }
            }
        }
        registry.retain(|name| desired.contains_key(name) || actual.contains_key(name));

        self.reconciled.store(true, Ordering::Release);
        self.diagnostics.write().await.last_full_reconciliation = Some(Utc::now());
        self.metrics
            .set_running(self.kind(), self.scope.label(), registry.len());
        Ok(plan)
    }

    /// Handles queued events in order, each one holding a permit of the shared pool
    ///
    /// The registry is locked before a permit is taken, so an engine busy with a
    /// full reconciliation does not hold a permit other engines are waiting for.
    pub async fn dispatch(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<WatchEvent<W::Entity>>,
        pool: Arc<Semaphore>,
    ) {
        while let Some(event) = events.recv().await {
            let mut registry = self.registry.lock().await;
            let Ok(_permit) = pool.acquire().await else {
                break;
            };
            self.process(&mut registry, event).await;
        }
        debug!("{} event queue for namespace {} closed", self.kind(), self.scope);
    }

    /// Runs `reconcile_all` after `initial_delay` and then every `period`
    pub fn schedule(self: Arc<Self>, initial_delay: Duration, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + initial_delay, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if let Err(err) = self.reconcile_all().await {
                    warn!(
                        "Full reconciliation of {} in namespace {} failed: {err}",
                        self.kind(),
                        self.scope
                    );
                    self.metrics
                        .handler_failure(self.kind(), self.scope.label(), &err);
                }
            }
        })
    }
}
