use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::config::WatchScope;
use crate::controllers::workload::ObservedState;
use crate::resources::labels::{label_selector, label_selector_string, DEPLOYMENT_LABEL, KIND_LABEL};
use crate::Result;

pub mod sparkapplication;
pub mod sparkcluster;
pub mod sparkhistoryserver;

pub use sparkapplication::SparkApplicationWorkload;
pub use sparkcluster::SparkClusterWorkload;
pub use sparkhistoryserver::SparkHistoryServerWorkload;

pub const FIELD_MANAGER: &str = "workload-operator";
pub const DEFAULT_PREFIX: &str = "radanalytics.io/";
/// Service account the submitted drivers and the history server run as
pub const SERVICE_ACCOUNT: &str = "spark-operator";

/// `<prefix>kind=<kind>` and `<prefix><kind>=<name>`, carried by everything created for one entity
pub fn resource_labels(prefix: &str, kind: &str, name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (format!("{prefix}{KIND_LABEL}"), kind.into()),
        (format!("{prefix}{kind}"), name.into()),
    ])
}

/// Selects the pods of one deployment of an entity
pub fn pod_selector(prefix: &str, kind: &str, name: &str, deployment: &str) -> BTreeMap<String, String> {
    let mut selector = resource_labels(prefix, kind, name);
    selector.insert(format!("{prefix}{DEPLOYMENT_LABEL}"), deployment.into());
    selector
}

pub fn object_meta(name: &str, namespace: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: Some(namespace.into()),
        labels: Some(labels),
        ..Default::default()
    }
}

pub fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        value_from: None,
    }
}

/// Server side apply, taking over fields owned by other managers
pub async fn apply<K>(client: &Client, namespace: &str, object: &K) -> Result<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let name = object.name_any();
    debug!("Applying {} {name} in namespace {namespace}", K::kind(&()));
    let params = PatchParams::apply(FIELD_MANAGER).force();
    Ok(api.patch(&name, &params, &Patch::Apply(object)).await?)
}

/// Deletes every object matching `selector`; objects that are already gone are skipped
pub async fn delete_labelled<K>(client: &Client, namespace: &str, selector: &str) -> Result<()>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    for object in api.list_metadata(&ListParams::default().labels(selector)).await?.items {
        let name = object.name_any();
        match api.delete(&name, &DeleteParams::background()).await {
            Ok(_) => debug!("Deleted {} {name} in namespace {namespace}", K::kind(&())),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Lists objects carrying `labels` and maps the value of `name_label` to what runs for it
pub async fn observe_labelled<K>(
    client: &Client,
    scope: &WatchScope,
    labels: BTreeMap<String, String>,
    name_label: &str,
    replicas: impl Fn(&K) -> Option<i32>,
) -> Result<BTreeMap<String, ObservedState>>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let api: Api<K> = match scope.namespace() {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let selector = label_selector_string(&label_selector(labels));

    let mut observed = BTreeMap::new();
    for object in api.list(&ListParams::default().labels(&selector)).await?.items {
        let Some(name) = object.labels().get(name_label).cloned() else {
            continue;
        };
        observed.insert(
            name,
            ObservedState {
                namespace: object.namespace().unwrap_or_default(),
                replicas: replicas(&object).unwrap_or(1),
            },
        );
    }
    Ok(observed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_selector_extends_resource_labels() {
        let selector = pod_selector("radanalytics.io/", "SparkCluster", "my-spark", "my-spark-m");
        assert_eq!(
            selector,
            BTreeMap::from([
                ("radanalytics.io/kind".to_string(), "SparkCluster".to_string()),
                ("radanalytics.io/SparkCluster".to_string(), "my-spark".to_string()),
                ("radanalytics.io/deployment".to_string(), "my-spark-m".to_string()),
            ])
        );
    }
}
