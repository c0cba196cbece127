use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::engine::ReconciliationEngine;
use super::watch::{ResourceWatch, WatchBackend, WatchHandle, WatchSource, WatchState};
use super::workload::{OperatorDeclaration, Workload};
use super::State;
use crate::config::{OperatorConfig, WatchScope};
use crate::resources::crd::CrdLifecycleManager;
use crate::resources::status::StatusReporter;
use crate::{Error, Metrics, Result};

/// Seconds before the first full reconciliation of an engine, staggered so engines do not start together
pub fn initial_delay(namespace_index: usize, operator_count: usize, operator_index: usize) -> Duration {
    let seconds = namespace_index * operator_count + operator_index + 2;
    Duration::from_secs(u64::try_from(seconds).unwrap_or(u64::MAX))
}

/// Owns the client, the handler pool and the metrics, and starts one engine per operator and namespace
pub struct OperatorBootstrap {
    client: Client,
    config: OperatorConfig,
    state: State,
    metrics: Metrics,
    crds: Arc<CrdLifecycleManager>,
    pool: Arc<Semaphore>,
    operators: Vec<Arc<dyn Launch>>,
}

impl OperatorBootstrap {
    pub fn new(client: Client, config: OperatorConfig, state: &State) -> Result<Self> {
        let metrics = state
            .create_metrics()
            .map_err(|e| Error::InvalidConfiguration(format!("unable to register metrics: {e}")))?;
        Ok(Self {
            crds: Arc::new(CrdLifecycleManager::new(client.clone())),
            pool: Arc::new(Semaphore::new(config.event_workers.max(1))),
            client,
            config,
            state: state.clone(),
            metrics,
            operators: Vec::new(),
        })
    }

    pub fn register<W: Workload>(mut self, workload: W) -> Self {
        self.operators.push(Arc::new(Registered(Arc::new(workload))));
        self
    }

    pub fn crds(&self) -> &CrdLifecycleManager {
        &self.crds
    }

    /// Shared with workloads that report their own metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Starts every enabled operator in every watched namespace. The first failure stops everything started so far.
    pub async fn run(self) -> Result<RunningOperators> {
        if self.config.full_reconciliation_interval_s == 0 {
            return Err(Error::InvalidConfiguration(
                "the full reconciliation interval must be at least one second".into(),
            ));
        }

        let scopes = self
            .config
            .namespace_scope()
            .resolve(self.client.default_namespace());
        let operators = self.active_operators()?;
        if self.config.metrics {
            self.metrics.record_info(&self.config);
        }

        let namespaces: Vec<String> = scopes.iter().map(ToString::to_string).collect();
        info!(
            "Starting {} operator(s) for namespace(s) {}",
            operators.len(),
            namespaces.join(", ")
        );

        let mut running = RunningOperators::default();
        for (namespace_index, scope) in scopes.iter().enumerate() {
            for (operator_index, (operator, crd)) in operators.iter().enumerate() {
                let delay = initial_delay(namespace_index, operators.len(), operator_index);
                match operator.launch(&self, scope.clone(), *crd, delay).await {
                    Ok(engine) => running.engines.push(engine),
                    Err(err) => {
                        error!(
                            "Unable to start {} for namespace {scope}: {err}",
                            operator.declaration().operator_name()
                        );
                        running.shutdown().await;
                        return Err(err);
                    }
                }
            }
        }

        info!("{} engine(s) started", running.len());
        Ok(running)
    }

    /// Enabled operators with the mode they run in; invalid ones fail in CRD mode and are skipped otherwise
    fn active_operators(&self) -> Result<Vec<(Arc<dyn Launch>, bool)>> {
        let mut active = Vec::new();
        for operator in &self.operators {
            let declaration = operator.declaration();
            if !declaration.enabled {
                info!(
                    "Skipping initialization of {}, it is disabled",
                    declaration.operator_name()
                );
                continue;
            }

            let crd = self.config.crd.unwrap_or(declaration.crd);
            if let Err(err) = declaration.clone().with_crd(crd).validate() {
                if crd {
                    return Err(err);
                }
                warn!("Skipping {}: {err}", declaration.operator_name());
                continue;
            }
            active.push((operator.clone(), crd));
        }

        if active.is_empty() {
            warn!("No suitable operators were found, make sure at least one is registered and enabled");
        }
        Ok(active)
    }
}

#[async_trait]
trait Launch: Send + Sync {
    fn declaration(&self) -> &OperatorDeclaration;

    async fn launch(
        &self,
        bootstrap: &OperatorBootstrap,
        scope: WatchScope,
        crd: bool,
        initial_delay: Duration,
    ) -> Result<EngineHandle>;
}

struct Registered<W>(Arc<W>);

#[async_trait]
impl<W: Workload> Launch for Registered<W> {
    fn declaration(&self) -> &OperatorDeclaration {
        self.0.declaration()
    }

    async fn launch(
        &self,
        bootstrap: &OperatorBootstrap,
        scope: WatchScope,
        crd: bool,
        initial_delay: Duration,
    ) -> Result<EngineHandle> {
        let declaration = self.0.declaration();
        let client = bootstrap.client.clone();
        let config = &bootstrap.config;

        let (source, status): (Arc<dyn WatchSource>, Option<StatusReporter>) = if crd {
            let descriptor = declaration.crd_descriptor(self.0.schema());
            bootstrap.crds.ensure(&descriptor).await?;
            let resource = bootstrap
                .crds
                .kinds()
                .resolve(&descriptor.group, &descriptor.kind)
                .await?;
            (
                Arc::new(WatchBackend::custom_resources(client.clone(), &scope, &resource)),
                Some(StatusReporter::new(client, resource)),
            )
        } else {
            (
                Arc::new(WatchBackend::config_maps(client, &scope, &declaration.selector())),
                None,
            )
        };

        let engine = Arc::new(
            ReconciliationEngine::new(self.0.clone(), source.clone(), scope.clone())
                .with_status(status)
                .with_metrics(bootstrap.metrics.clone())
                .with_diagnostics(bootstrap.state.diagnostics.clone())
                .with_operation_timeout(config.operation_timeout()),
        );

        let (sink, events) = mpsc::unbounded_channel();
        let watch = ResourceWatch::new(self.0.clone(), source, sink, engine.reconciled_flag())
            .with_scope(scope.clone())
            .with_retry_delay(config.watch_retry_delay())
            .with_metrics(bootstrap.metrics.clone())
            .start()
            .await?;

        let dispatcher = tokio::spawn(engine.clone().dispatch(events, bootstrap.pool.clone()));
        let timer = engine.schedule(initial_delay, config.full_reconciliation_interval());

        info!(
            "{} running for namespace {} using {}, first full reconciliation in {}s",
            declaration.operator_name(),
            scope,
            if crd { "custom resources" } else { "ConfigMaps" },
            initial_delay.as_secs()
        );

        Ok(EngineHandle {
            operator: declaration.operator_name(),
            scope,
            watch,
            dispatcher,
            timer,
        })
    }
}

/// A started engine with its watch, event queue and timer
pub struct EngineHandle {
    operator: String,
    scope: WatchScope,
    watch: WatchHandle,
    dispatcher: JoinHandle<()>,
    timer: JoinHandle<()>,
}

impl EngineHandle {
    pub fn watch_state(&self) -> WatchState {
        self.watch.state()
    }

    pub async fn shutdown(self) {
        self.timer.abort();
        self.watch.close().await;
        if let Err(err) = self.dispatcher.await {
            warn!("event queue of {} ended abnormally: {err}", self.operator);
        }
        info!("{} for namespace {} stopped", self.operator, self.scope);
    }
}

#[derive(Default)]
pub struct RunningOperators {
    engines: Vec<EngineHandle>,
}

impl RunningOperators {
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    pub fn watch_states(&self) -> Vec<WatchState> {
        self.engines.iter().map(EngineHandle::watch_state).collect()
    }

    /// Closes every watch and stops every timer
    pub async fn shutdown(self) {
        for engine in self.engines {
            engine.shutdown().await;
        }
    }
}
