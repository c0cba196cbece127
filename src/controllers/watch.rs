use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{DynamicObject, ListParams, WatchEvent as ApiEvent, WatchParams};
use kube::core::ApiResource;
use kube::{Api, Client, ResourceExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::workload::Workload;
use crate::config::WatchScope;
use crate::resources::entity::{EntityCodec, RawBody};
use crate::resources::labels;
use crate::{Error, Metrics, Result};

/// Server side timeout of a single watch request
const WATCH_TIMEOUT_SECS: u32 = 290;

/// A ConfigMap or custom resource seen by a watch
#[derive(Debug, Clone)]
pub enum WatchedObject {
    ConfigMap(ConfigMap),
    CustomResource(DynamicObject),
}

impl WatchedObject {
    pub fn name(&self) -> String {
        match self {
            WatchedObject::ConfigMap(cm) => cm.name_any(),
            WatchedObject::CustomResource(cr) => cr.name_any(),
        }
    }

    pub fn namespace(&self) -> Option<String> {
        match self {
            WatchedObject::ConfigMap(cm) => cm.namespace(),
            WatchedObject::CustomResource(cr) => cr.namespace(),
        }
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        match self {
            WatchedObject::ConfigMap(cm) => cm.labels(),
            WatchedObject::CustomResource(cr) => cr.labels(),
        }
    }

    pub fn resource_version(&self) -> Option<String> {
        match self {
            WatchedObject::ConfigMap(cm) => cm.resource_version(),
            WatchedObject::CustomResource(cr) => cr.resource_version(),
        }
    }

    /// `data.config` of a ConfigMap, `spec` of a custom resource
    pub fn body(&self) -> RawBody<'_> {
        match self {
            WatchedObject::ConfigMap(cm) => RawBody::Yaml(
                cm.data
                    .as_ref()
                    .and_then(|data| data.get("config"))
                    .map(String::as_str),
            ),
            WatchedObject::CustomResource(cr) => RawBody::Json(cr.data.get("spec")),
        }
    }

    pub fn decode<E>(&self, codec: &dyn EntityCodec<E>) -> Option<E> {
        let namespace = self.namespace();
        codec.decode(self.body(), &self.name(), namespace.as_deref())
    }
}

/// Kind label check for ConfigMaps, kind check for custom resources, then the workload's own filter
pub fn is_supported<W: Workload>(workload: &W, object: &WatchedObject) -> bool {
    let declaration = workload.declaration();
    let kind_matches = match object {
        WatchedObject::ConfigMap(cm) => {
            labels::is_a_kind(cm.labels(), &declaration.kind, &declaration.prefix)
        }
        WatchedObject::CustomResource(cr) => cr
            .types
            .as_ref()
            .map_or(true, |types| types.kind == declaration.kind),
    };
    kind_matches && workload.is_supported(object)
}

pub type RawEventStream = BoxStream<'static, kube::Result<ApiEvent<WatchedObject>>>;

/// Where watched objects come from
#[async_trait]
pub trait WatchSource: Send + Sync {
    /// Every watched object in scope and the resource version of the listing
    async fn list(&self) -> Result<(Vec<WatchedObject>, Option<String>)>;

    async fn current_version(&self) -> Result<Option<String>> {
        Ok(self.list().await?.1)
    }

    /// Opens a subscription starting after `resource_version`
    async fn watch(&self, resource_version: &str) -> Result<RawEventStream>;
}

pub enum WatchBackend {
    ConfigMap { api: Api<ConfigMap>, selector: String },
    CustomResource { api: Api<DynamicObject> },
}

impl WatchBackend {
    pub fn config_maps(client: Client, scope: &WatchScope, selector: &BTreeMap<String, String>) -> Self {
        let api = match scope.namespace() {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        let selector = labels::label_selector_string(&labels::label_selector(selector.clone()));
        WatchBackend::ConfigMap { api, selector }
    }

    pub fn custom_resources(client: Client, scope: &WatchScope, resource: &ApiResource) -> Self {
        let api = match scope.namespace() {
            Some(ns) => Api::namespaced_with(client, ns, resource),
            None => Api::all_with(client, resource),
        };
        WatchBackend::CustomResource { api }
    }

    fn list_params(&self) -> ListParams {
        match self {
            WatchBackend::ConfigMap { selector, .. } => ListParams::default().labels(selector),
            WatchBackend::CustomResource { .. } => ListParams::default(),
        }
    }

    fn watch_params(&self) -> WatchParams {
        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        match self {
            WatchBackend::ConfigMap { selector, .. } => params.labels(selector),
            WatchBackend::CustomResource { .. } => params,
        }
    }
}

#[async_trait]
impl WatchSource for WatchBackend {
    async fn list(&self) -> Result<(Vec<WatchedObject>, Option<String>)> {
        let params = self.list_params();
        match self {
            WatchBackend::ConfigMap { api, .. } => {
                let list = api.list(&params).await?;
                let objects = list.items.into_iter().map(WatchedObject::ConfigMap).collect();
                Ok((objects, list.metadata.resource_version))
            }
            WatchBackend::CustomResource { api } => {
                let list = api.list(&params).await?;
                let objects = list.items.into_iter().map(WatchedObject::CustomResource).collect();
                Ok((objects, list.metadata.resource_version))
            }
        }
    }

    async fn current_version(&self) -> Result<Option<String>> {
        let params = self.list_params().limit(1);
        let version = match self {
            WatchBackend::ConfigMap { api, .. } => api.list_metadata(&params).await?.metadata.resource_version,
            WatchBackend::CustomResource { api } => api.list_metadata(&params).await?.metadata.resource_version,
        };
        Ok(version)
    }

    async fn watch(&self, resource_version: &str) -> Result<RawEventStream> {
        let params = self.watch_params();
        let stream = match self {
            WatchBackend::ConfigMap { api, .. } => api
                .watch(&params, resource_version)
                .await?
                .map_ok(|event| map_event(event, WatchedObject::ConfigMap))
                .boxed(),
            WatchBackend::CustomResource { api } => api
                .watch(&params, resource_version)
                .await?
                .map_ok(|event| map_event(event, WatchedObject::CustomResource))
                .boxed(),
        };
        Ok(stream)
    }
}

fn map_event<K>(event: ApiEvent<K>, wrap: fn(K) -> WatchedObject) -> ApiEvent<WatchedObject> {
    match event {
        ApiEvent::Added(o) => ApiEvent::Added(wrap(o)),
        ApiEvent::Modified(o) => ApiEvent::Modified(wrap(o)),
        ApiEvent::Deleted(o) => ApiEvent::Deleted(wrap(o)),
        ApiEvent::Bookmark(bookmark) => ApiEvent::Bookmark(bookmark),
        ApiEvent::Error(err) => ApiEvent::Error(err),
    }
}

/// What a watch hands to its engine, with the namespace the entity was observed in
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<E> {
    Added(E, String),
    Modified(E, String),
    Deleted(E, String),
    Error(String),
}

impl<E> WatchEvent<E> {
    pub fn action(&self) -> &'static str {
        match self {
            WatchEvent::Added(..) => "added",
            WatchEvent::Modified(..) => "modified",
            WatchEvent::Deleted(..) => "deleted",
            WatchEvent::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Created,
    Starting,
    Running,
    /// The server ended the subscription
    Closed,
    /// The subscription broke or could not be re-opened
    Failed,
    Recreating,
    Stopped,
}

enum Flow {
    Continue,
    Reopen,
    Stop,
}

/// One long lived subscription, re-opened until closed
pub struct ResourceWatch<W: Workload> {
    workload: Arc<W>,
    source: Arc<dyn WatchSource>,
    sink: mpsc::UnboundedSender<WatchEvent<W::Entity>>,
    reconciled: Arc<AtomicBool>,
    scope: WatchScope,
    retry_delay: Duration,
    metrics: Metrics,
    resource_version: Option<String>,
    state: watch::Sender<WatchState>,
}

impl<W: Workload> ResourceWatch<W> {
    /// Events are only forwarded to `sink` once `reconciled` is set.
    pub fn new(
        workload: Arc<W>,
        source: Arc<dyn WatchSource>,
        sink: mpsc::UnboundedSender<WatchEvent<W::Entity>>,
        reconciled: Arc<AtomicBool>,
    ) -> Self {
        let (state, _) = watch::channel(WatchState::Created);
        Self {
            workload,
            source,
            sink,
            reconciled,
            scope: WatchScope::All,
            retry_delay: Duration::from_secs(1),
            metrics: Metrics::default(),
            resource_version: None,
            state,
        }
    }

    pub fn with_scope(mut self, scope: WatchScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Opens the first subscription and keeps it alive in the background
    pub async fn start(mut self) -> Result<WatchHandle> {
        let declaration = self.workload.declaration();
        if declaration.kind.trim().is_empty() {
            return Err(Error::InvalidConfiguration(
                "a watch needs the kind of its entities".into(),
            ));
        }
        if !declaration.prefix.ends_with('/') {
            return Err(Error::InvalidConfiguration(format!(
                "the label prefix of {} must end with '/', got '{}'",
                declaration.operator_name(),
                declaration.prefix
            )));
        }

        self.state.send_replace(WatchState::Starting);
        let stream = self.open().await?;
        self.state.send_replace(WatchState::Running);
        info!(
            "{} watch started in namespace {}",
            self.workload.declaration().kind,
            self.scope
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = self.state.subscribe();
        let task = tokio::spawn(self.run(stream, shutdown_rx));
        Ok(WatchHandle {
            shutdown,
            state,
            task,
        })
    }

    async fn open(&mut self) -> Result<RawEventStream> {
        if self.resource_version.is_none() {
            self.resource_version = self.source.current_version().await?;
        }
        let version = self.resource_version.as_deref().unwrap_or("0");
        self.source.watch(version).await
    }

    async fn run(mut self, mut stream: RawEventStream, mut shutdown: watch::Receiver<bool>) {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(event)) => match self.on_event(event) {
                    Flow::Continue => continue,
                    Flow::Reopen => {}
                    Flow::Stop => break,
                },
                Some(Err(err)) => {
                    error!(
                        "{} watch in namespace {} closed with an error: {err}",
                        self.kind(),
                        self.scope
                    );
                    self.state.send_replace(WatchState::Failed);
                }
                None => {
                    debug!("{} watch in namespace {} ended", self.kind(), self.scope);
                    self.state.send_replace(WatchState::Closed);
                }
            }

            drop(stream);
            match self.recreate(&mut shutdown).await {
                Some(reopened) => stream = reopened,
                None => break,
            }
        }

        self.state.send_replace(WatchState::Stopped);
        info!("{} watch in namespace {} stopped", self.kind(), self.scope);
    }

    /// One attempt per close, then one per retry delay until it succeeds or the watch is closed
    async fn recreate(&mut self, shutdown: &mut watch::Receiver<bool>) -> Option<RawEventStream> {
        self.metrics.watch_restarted(self.kind(), self.scope.label());
        loop {
            self.state.send_replace(WatchState::Recreating);
            match self.open().await {
                Ok(stream) => {
                    info!("{} watch recreated in namespace {}", self.kind(), self.scope);
                    self.state.send_replace(WatchState::Running);
                    return Some(stream);
                }
                Err(err) => {
                    error!(
                        "Unable to recreate the {} watch in namespace {}: {err}",
                        self.kind(),
                        self.scope
                    );
                    self.state.send_replace(WatchState::Failed);
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => return None,
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        }
    }

    fn on_event(&mut self, event: ApiEvent<WatchedObject>) -> Flow {
        type Wrap<E> = fn(E, String) -> WatchEvent<E>;
        let (object, wrap): (WatchedObject, Wrap<W::Entity>) = match event {
            ApiEvent::Added(object) => (object, WatchEvent::Added),
            ApiEvent::Modified(object) => (object, WatchEvent::Modified),
            ApiEvent::Deleted(object) => (object, WatchEvent::Deleted),
            ApiEvent::Bookmark(bookmark) => {
                self.resource_version = Some(bookmark.metadata.resource_version);
                return Flow::Continue;
            }
            ApiEvent::Error(err) if err.code == 410 => {
                warn!(
                    "{} watch in namespace {} fell behind, starting over: {}",
                    self.kind(),
                    self.scope,
                    err.message
                );
                self.resource_version = None;
                self.state.send_replace(WatchState::Failed);
                return Flow::Reopen;
            }
            ApiEvent::Error(err) => {
                error!(
                    "Failed {} watch event in namespace {}: {}",
                    self.kind(),
                    self.scope,
                    err.message
                );
                return self.forward(WatchEvent::Error(err.message));
            }
        };

        if let Some(version) = object.resource_version() {
            self.resource_version = Some(version);
        }

        let name = object.name();
        if !is_supported(self.workload.as_ref(), &object) {
            warn!("Unknown {} kind: {name}", self.kind());
            return Flow::Continue;
        }

        let Some(entity) = object.decode(self.workload.codec()) else {
            error!("Unable to parse the {} definition of {name}", self.kind());
            return Flow::Continue;
        };

        if !self.reconciled.load(Ordering::Acquire) {
            debug!(
                "Ignoring {name} until the first full reconciliation in namespace {} has run",
                self.scope
            );
            return Flow::Continue;
        }

        let namespace = object
            .namespace()
            .or_else(|| self.scope.namespace().map(str::to_string))
            .unwrap_or_default();
        self.forward(wrap(entity, namespace))
    }

    fn forward(&self, event: WatchEvent<W::Entity>) -> Flow {
        match self.sink.send(event) {
            Ok(()) => Flow::Continue,
            Err(_) => {
                debug!("{} engine is gone, stopping its watch", self.kind());
                Flow::Stop
            }
        }
    }

    fn kind(&self) -> &str {
        &self.workload.declaration().kind
    }
}

/// Keeps a started watch alive; dropping it stops the watch as well
pub struct WatchHandle {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<WatchState>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub fn state(&self) -> WatchState {
        *self.state.borrow()
    }

    pub fn states(&self) -> watch::Receiver<WatchState> {
        self.state.clone()
    }

    /// Releases the subscription and waits for the watch to stop
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!("watch task ended abnormally: {err}");
        }
    }
}
