use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::WatchEvent as ApiEvent;

use super::watch::{RawEventStream, WatchSource, WatchedObject};
use super::workload::{HandlerContext, ObservedState, OperatorDeclaration, Workload};
use crate::config::WatchScope;
use crate::resources::entity::tests::Widget;
use crate::{Error, Result};

pub type Feed = UnboundedSender<kube::Result<ApiEvent<WatchedObject>>>;

pub fn config_map(name: &str, namespace: &str, kind: Option<&str>, config: Option<&str>) -> WatchedObject {
    WatchedObject::ConfigMap(ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            resource_version: Some("5".into()),
            labels: kind.map(|kind| BTreeMap::from([("example.io/kind".to_string(), kind.to_string())])),
            ..Default::default()
        },
        data: config.map(|config| BTreeMap::from([("config".to_string(), config.to_string())])),
        ..Default::default()
    })
}

pub fn widget_config_map(name: &str, namespace: &str, size: i32) -> WatchedObject {
    config_map(name, namespace, Some("Widget"), Some(&format!("size: {size}")))
}

enum Session {
    Live(futures::channel::mpsc::UnboundedReceiver<kube::Result<ApiEvent<WatchedObject>>>),
    Failure,
}

/// Watch source replaying scripted subscriptions; once the script runs out new subscriptions stay silent
#[derive(Default)]
pub struct ScriptedSource {
    sessions: Mutex<VecDeque<Session>>,
    objects: Mutex<Vec<WatchedObject>>,
    opened: Mutex<Vec<String>>,
    lists: Mutex<usize>,
}

impl ScriptedSource {
    pub fn push_live(&self) -> Feed {
        let (tx, rx) = unbounded();
        self.sessions.lock().unwrap().push_back(Session::Live(rx));
        tx
    }

    pub fn push_failure(&self) {
        self.sessions.lock().unwrap().push_back(Session::Failure);
    }

    pub fn set_objects(&self, objects: Vec<WatchedObject>) {
        *self.objects.lock().unwrap() = objects;
    }

    pub fn opened_versions(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    pub fn version_lookups(&self) -> usize {
        *self.lists.lock().unwrap()
    }
}

#[async_trait]
impl WatchSource for ScriptedSource {
    async fn list(&self) -> Result<(Vec<WatchedObject>, Option<String>)> {
        *self.lists.lock().unwrap() += 1;
        Ok((self.objects.lock().unwrap().clone(), Some("1".into())))
    }

    async fn watch(&self, resource_version: &str) -> Result<RawEventStream> {
        self.opened.lock().unwrap().push(resource_version.to_string());
        let session = self.sessions.lock().unwrap().pop_front();
        match session {
            Some(Session::Live(rx)) => Ok(rx.boxed()),
            Some(Session::Failure) => Err(Error::WorkloadFailed("api server unavailable".into())),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Add(String, i32),
    Delete(String, String),
    Modify(String, Option<i32>, i32),
}

/// Widget workload that keeps its "cluster" in memory
pub struct FakeWorkload {
    declaration: OperatorDeclaration,
    pub calls: Mutex<Vec<Call>>,
    pub actual: Mutex<BTreeMap<String, ObservedState>>,
    failing: Mutex<Vec<String>>,
    rejected: Vec<String>,
    delay: Option<std::time::Duration>,
}

impl Default for FakeWorkload {
    fn default() -> Self {
        Self::with_prefix("example.io/")
    }
}

impl FakeWorkload {
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            declaration: OperatorDeclaration::new("Widget", prefix).with_crd(false),
            calls: Mutex::new(Vec::new()),
            actual: Mutex::new(BTreeMap::new()),
            failing: Mutex::new(Vec::new()),
            rejected: Vec::new(),
            delay: None,
        }
    }

    pub fn with_declaration(mut self, declaration: OperatorDeclaration) -> Self {
        self.declaration = declaration;
        self
    }

    /// Objects with this name are filtered out by the workload itself
    pub fn rejecting(mut self, name: &str) -> Self {
        self.rejected.push(name.to_string());
        self
    }

    /// Every handler call sleeps this long first
    pub fn slow(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_for(&self, name: &str) {
        self.failing.lock().unwrap().push(name.to_string());
    }

    pub fn running(&self, name: &str, namespace: &str, replicas: i32) {
        self.actual.lock().unwrap().insert(
            name.to_string(),
            ObservedState {
                namespace: namespace.to_string(),
                replicas,
            },
        );
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    async fn call(&self, call: Call, name: &str) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().unwrap().push(call);
        if self.failing.lock().unwrap().iter().any(|failing| failing == name) {
            return Err(Error::WorkloadFailed(format!("{name} is broken")));
        }
        Ok(())
    }
}

#[async_trait]
impl Workload for FakeWorkload {
    type Entity = Widget;

    fn declaration(&self) -> &OperatorDeclaration {
        &self.declaration
    }

    fn is_supported(&self, object: &WatchedObject) -> bool {
        !self.rejected.contains(&object.name())
    }

    async fn on_add(&self, entity: &Widget, ctx: &HandlerContext) -> Result<()> {
        self.call(Call::Add(entity.name.clone(), entity.size), &entity.name)
            .await?;
        self.running(&entity.name, &ctx.namespace, entity.size);
        Ok(())
    }

    async fn on_delete(&self, entity: &Widget, ctx: &HandlerContext) -> Result<()> {
        self.call(Call::Delete(entity.name.clone(), ctx.namespace.clone()), &entity.name)
            .await?;
        self.actual.lock().unwrap().remove(&entity.name);
        Ok(())
    }

    async fn on_modify(&self, previous: Option<&Widget>, entity: &Widget, ctx: &HandlerContext) -> Result<()> {
        self.call(
            Call::Modify(entity.name.clone(), previous.map(|p| p.size), entity.size),
            &entity.name,
        )
        .await?;
        self.running(&entity.name, &ctx.namespace, entity.size);
        Ok(())
    }

    async fn observe(&self, _scope: &WatchScope) -> Result<BTreeMap<String, ObservedState>> {
        Ok(self.actual.lock().unwrap().clone())
    }

    fn desired_replicas(&self, entity: &Widget) -> i32 {
        entity.size
    }

    fn set_observed_replicas(&self, entity: &mut Widget, replicas: i32) {
        entity.size = replicas;
    }
}

/// Widget workload relying on the default modify, which recreates the entity
#[derive(Default)]
pub struct Recreating(pub FakeWorkload);

#[async_trait]
impl Workload for Recreating {
    type Entity = Widget;

    fn declaration(&self) -> &OperatorDeclaration {
        self.0.declaration()
    }

    async fn on_add(&self, entity: &Widget, ctx: &HandlerContext) -> Result<()> {
        self.0.on_add(entity, ctx).await
    }

    async fn on_delete(&self, entity: &Widget, ctx: &HandlerContext) -> Result<()> {
        self.0.on_delete(entity, ctx).await
    }

    async fn observe(&self, scope: &WatchScope) -> Result<BTreeMap<String, ObservedState>> {
        self.0.observe(scope).await
    }

    fn desired_replicas(&self, entity: &Widget) -> i32 {
        self.0.desired_replicas(entity)
    }

    fn set_observed_replicas(&self, entity: &mut Widget, replicas: i32) {
        self.0.set_observed_replicas(entity, replicas)
    }
}
