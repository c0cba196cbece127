use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetSpec};
use k8s_openapi::api::autoscaling::v1::Scale;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, ExecAction, HTTPGetAction, Pod, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaProps;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, Resource};
use serde_json::json;
use tracing::{info, warn};

use super::{
    apply, delete_labelled, env_var, object_meta, observe_labelled, pod_selector, resource_labels,
    DEFAULT_PREFIX, FIELD_MANAGER,
};
use crate::config::WatchScope;
use crate::controllers::workload::{HandlerContext, ObservedState, OperatorDeclaration, Workload};
use crate::resources::crd::{openapi_schema, PrinterColumn};
use crate::resources::labels::{
    kind_label, label_selector, label_selector_string, POD_TYPE_LABEL, RC_TYPE_LABEL, SERVICE_TYPE_LABEL,
};
use crate::resources::sparkclusters::{SparkCluster, SPARK_CLUSTER_KIND};
use crate::{Metrics, Result};

const MASTER: &str = "master";
const WORKER: &str = "worker";
const UI: &str = "ui";

pub const MASTER_PORT: i32 = 7077;
pub const MASTER_UI_PORT: i32 = 8080;
pub const WORKER_UI_PORT: i32 = 8081;

/// Runs Spark clusters as a master and a worker ReplicaSet plus two Services
pub struct SparkClusterWorkload {
    client: Client,
    declaration: OperatorDeclaration,
    metrics: Metrics,
}

impl SparkClusterWorkload {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            declaration: Self::default_declaration(),
            metrics: Metrics::default(),
        }
    }

    pub fn default_declaration() -> OperatorDeclaration {
        OperatorDeclaration::new(SPARK_CLUSTER_KIND, DEFAULT_PREFIX)
            .with_short_names(["sc"])
            .with_printer_column(PrinterColumn::new("Workers", ".spec.worker.instances").with_type("integer"))
            .with_printer_column(PrinterColumn::new("Image", ".spec.customImage"))
            .with_printer_column(PrinterColumn::new("State", ".status.state"))
    }

    pub fn with_declaration(mut self, declaration: OperatorDeclaration) -> Self {
        self.declaration = declaration;
        self
    }

    /// Per cluster worker counts are reported here
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    fn prefix(&self) -> &str {
        &self.declaration.prefix
    }

    fn labels(&self, name: &str) -> BTreeMap<String, String> {
        resource_labels(self.prefix(), SPARK_CLUSTER_KIND, name)
    }

    fn selector(&self, name: &str, deployment: &str) -> BTreeMap<String, String> {
        pod_selector(self.prefix(), SPARK_CLUSTER_KIND, name, deployment)
    }

    pub fn replica_set(&self, cluster: &SparkCluster, namespace: &str, master: bool) -> ReplicaSet {
        let name = cluster.name.as_str();
        let role = if master { MASTER } else { WORKER };
        let rs_name = if master {
            format!("{name}-m")
        } else {
            format!("{name}-w")
        };

        let mut labels = self.labels(name);
        labels.insert(format!("{}{RC_TYPE_LABEL}", self.prefix()), role.into());
        let selector = self.selector(name, &rs_name);
        let mut pod_labels = selector.clone();
        pod_labels.insert(format!("{}{POD_TYPE_LABEL}", self.prefix()), role.into());

        let mut env = vec![env_var("OSHINKO_SPARK_CLUSTER", name)];
        env.extend(cluster.env.iter().map(|e| env_var(&e.name, &e.value)));

        let mut container = Container {
            name: rs_name.clone(),
            image: Some(cluster.image().into()),
            image_pull_policy: Some("IfNotPresent".into()),
            termination_message_path: Some("/dev/termination-log".into()),
            termination_message_policy: Some("File".into()),
            resources: resources(cluster),
            ..Default::default()
        };

        if master {
            container.ports = Some(vec![
                container_port("spark-master", MASTER_PORT),
                container_port("spark-webui", MASTER_UI_PORT),
            ]);
            container.readiness_probe = Some(http_probe(MASTER_UI_PORT));
            container.liveness_probe = Some(Probe {
                exec: Some(ExecAction {
                    command: Some(vec![
                        "/bin/bash".into(),
                        "-c".into(),
                        format!("curl localhost:{MASTER_UI_PORT} | grep -e Status.*ALIVE"),
                    ]),
                }),
                failure_threshold: Some(3),
                initial_delay_seconds: Some(10),
                period_seconds: Some(10),
                success_threshold: Some(1),
                timeout_seconds: Some(1),
                ..Default::default()
            });
        } else {
            container.ports = Some(vec![container_port("spark-webui", WORKER_UI_PORT)]);
            container.liveness_probe = Some(http_probe(WORKER_UI_PORT));
            env.push(env_var("SPARK_MASTER_ADDRESS", &format!("spark://{name}:{MASTER_PORT}")));
            env.push(env_var(
                "SPARK_MASTER_UI_ADDRESS",
                &format!("http://{name}-ui:{MASTER_UI_PORT}"),
            ));
        }
        container.env = Some(env);

        ReplicaSet {
            metadata: object_meta(&rs_name, namespace, labels),
            spec: Some(ReplicaSetSpec {
                replicas: Some(if master {
                    cluster.master.instances
                } else {
                    cluster.worker.instances
                }),
                selector: label_selector(selector),
                template: Some(PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            }),
            status: None,
        }
    }

    pub fn service(&self, cluster: &SparkCluster, namespace: &str, ui: bool) -> Service {
        let name = cluster.name.as_str();
        let (service_name, port) = if ui {
            (format!("{name}-ui"), MASTER_UI_PORT)
        } else {
            (name.to_string(), MASTER_PORT)
        };

        let mut labels = self.labels(name);
        labels.insert(
            format!("{}{SERVICE_TYPE_LABEL}", self.prefix()),
            if ui { UI } else { MASTER }.into(),
        );

        Service {
            metadata: object_meta(&service_name, namespace, labels),
            spec: Some(ServiceSpec {
                selector: Some(self.selector(name, &format!("{name}-m"))),
                ports: Some(vec![ServicePort {
                    port,
                    target_port: Some(IntOrString::Int(port)),
                    protocol: Some("TCP".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    async fn apply(&self, cluster: &SparkCluster, namespace: &str) -> Result<()> {
        for rs in [
            self.replica_set(cluster, namespace, true),
            self.replica_set(cluster, namespace, false),
        ] {
            apply(&self.client, namespace, &rs).await?;
        }
        for svc in [
            self.service(cluster, namespace, false),
            self.service(cluster, namespace, true),
        ] {
            apply(&self.client, namespace, &svc).await?;
        }
        Ok(())
    }

    async fn scale_workers(&self, cluster: &SparkCluster, namespace: &str) -> Result<()> {
        let rs_api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let rs_name = format!("{}-w", cluster.name);
        info!(
            "Scaling ReplicaSet {rs_name} to {} workers in namespace {namespace}",
            cluster.worker.instances
        );
        let params = PatchParams::apply(&format!("{FIELD_MANAGER}/scale")).force();
        rs_api
            .patch_scale(
                &rs_name,
                &params,
                &Patch::Apply(json!({
                    "apiVersion": Scale::api_version(&()),
                    "kind": Scale::kind(&()),
                    "metadata": { "name": rs_name },
                    "spec": { "replicas": cluster.worker.instances }
                })),
            )
            .await?;
        Ok(())
    }

    async fn report_ready(&self, cluster: &SparkCluster, ctx: &HandlerContext) {
        if let Err(err) = ctx.report_state(&cluster.name, "ready").await {
            warn!("Giving up on the status of SparkCluster {}: {err}", cluster.name);
        }
    }
}

#[async_trait]
impl Workload for SparkClusterWorkload {
    type Entity = SparkCluster;

    fn declaration(&self) -> &OperatorDeclaration {
        &self.declaration
    }

    fn schema(&self) -> Option<JSONSchemaProps> {
        match openapi_schema::<SparkCluster>() {
            Ok(schema) => Some(schema),
            Err(err) => {
                warn!("Unable to generate the SparkCluster schema, the CRD will not validate: {err}");
                None
            }
        }
    }

    async fn on_add(&self, cluster: &SparkCluster, ctx: &HandlerContext) -> Result<()> {
        self.apply(cluster, &ctx.namespace).await?;
        self.metrics
            .cluster_started(&cluster.name, &ctx.namespace, cluster.worker.instances);
        self.report_ready(cluster, ctx).await;
        Ok(())
    }

    async fn on_delete(&self, cluster: &SparkCluster, ctx: &HandlerContext) -> Result<()> {
        let selector = label_selector_string(&label_selector(self.labels(&cluster.name)));
        let namespace = ctx.namespace.as_str();
        delete_labelled::<Service>(&self.client, namespace, &selector).await?;
        delete_labelled::<ReplicaSet>(&self.client, namespace, &selector).await?;
        delete_labelled::<Pod>(&self.client, namespace, &selector).await?;
        self.metrics.cluster_stopped(&cluster.name, namespace);
        Ok(())
    }

    async fn on_modify(
        &self,
        previous: Option<&SparkCluster>,
        cluster: &SparkCluster,
        ctx: &HandlerContext,
    ) -> Result<()> {
        match previous {
            Some(previous) if cluster.is_only_scale(previous) => {
                self.scale_workers(cluster, &ctx.namespace).await?
            }
            _ => self.apply(cluster, &ctx.namespace).await?,
        }
        self.metrics
            .set_workers(&cluster.name, &ctx.namespace, cluster.worker.instances);
        self.report_ready(cluster, ctx).await;
        Ok(())
    }

    async fn observe(&self, scope: &WatchScope) -> Result<BTreeMap<String, ObservedState>> {
        let workers = BTreeMap::from([
            (kind_label(self.prefix()), SPARK_CLUSTER_KIND.to_string()),
            (format!("{}{RC_TYPE_LABEL}", self.prefix()), WORKER.to_string()),
        ]);
        let name_label = format!("{}{SPARK_CLUSTER_KIND}", self.prefix());
        observe_labelled(&self.client, scope, workers, &name_label, |rs: &ReplicaSet| {
            rs.spec.as_ref().and_then(|s| s.replicas)
        })
        .await
    }

    fn desired_replicas(&self, cluster: &SparkCluster) -> i32 {
        cluster.worker.instances
    }

    fn set_observed_replicas(&self, cluster: &mut SparkCluster, replicas: i32) {
        cluster.worker.instances = replicas;
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.into()),
        container_port: port,
        protocol: Some("TCP".into()),
        ..Default::default()
    }
}

fn http_probe(port: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/".into()),
            port: IntOrString::Int(port),
            scheme: Some("HTTP".into()),
            ..Default::default()
        }),
        failure_threshold: Some(3),
        period_seconds: Some(10),
        success_threshold: Some(1),
        timeout_seconds: Some(1),
        ..Default::default()
    }
}

fn resources(cluster: &SparkCluster) -> Option<ResourceRequirements> {
    let mut limits = BTreeMap::new();
    if let Some(memory) = &cluster.memory {
        limits.insert("memory".to_string(), Quantity(memory.clone()));
    }
    if let Some(cpu) = &cluster.cpu {
        limits.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if limits.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        limits: Some(limits.clone()),
        requests: Some(limits),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::sparkclusters::{SparkEnv, DEFAULT_SPARK_IMAGE};
    use assert_json_diff::assert_json_include;
    use http::{Method, Request, Response, StatusCode};
    use kube::client::Body;
    use serde_json::Value;
    use tower_test::mock::{self, Handle};

    type ApiServerHandle = Handle<Request<Body>, Response<Body>>;

    fn workload() -> (SparkClusterWorkload, ApiServerHandle) {
        let (service, handle) = mock::pair::<Request<Body>, Response<Body>>();
        (SparkClusterWorkload::new(Client::new(service, "default")), handle)
    }

    fn cluster(workers: i32) -> SparkCluster {
        let mut cluster = SparkCluster {
            name: "my-spark".into(),
            namespace: Some("ns1".into()),
            ..Default::default()
        };
        cluster.worker.instances = workers;
        cluster
    }

    /// Answers the next request with its own body and returns (method, path, body)
    async fn echo(handle: &mut ApiServerHandle) -> (Method, String, Value) {
        let (request, send) = handle.next_request().await.expect("service not called");
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let bytes = request.into_body().collect_bytes().await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        send.send_response(
            Response::builder()
                .status(StatusCode::OK)
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        );
        (method, path, body)
    }

    #[tokio::test]
    async fn worker_replica_set_points_at_the_master() {
        let (workload, _) = workload();
        let mut spark = cluster(3);
        spark.env = vec![SparkEnv {
            name: "FOO".into(),
            value: "bar".into(),
        }];
        spark.memory = Some("1Gi".into());

        let rs = serde_json::to_value(workload.replica_set(&spark, "ns1", false)).unwrap();
        assert_json_include!(
            actual: rs,
            expected: json!({
                "metadata": {
                    "name": "my-spark-w",
                    "namespace": "ns1",
                    "labels": {
                        "radanalytics.io/kind": "SparkCluster",
                        "radanalytics.io/SparkCluster": "my-spark",
                        "radanalytics.io/rcType": "worker",
                    },
                },
                "spec": {
                    "replicas": 3,
                    "selector": { "matchLabels": { "radanalytics.io/deployment": "my-spark-w" } },
                    "template": {
                        "metadata": { "labels": { "radanalytics.io/podType": "worker" } },
                        "spec": { "containers": [{
                            "image": DEFAULT_SPARK_IMAGE,
                            "env": [
                                { "name": "OSHINKO_SPARK_CLUSTER", "value": "my-spark" },
                                { "name": "FOO", "value": "bar" },
                                { "name": "SPARK_MASTER_ADDRESS", "value": "spark://my-spark:7077" },
                                { "name": "SPARK_MASTER_UI_ADDRESS", "value": "http://my-spark-ui:8080" },
                            ],
                            "resources": { "limits": { "memory": "1Gi" }, "requests": { "memory": "1Gi" } },
                        }] },
                    },
                },
            })
        );
    }

    #[tokio::test]
    async fn master_replica_set_and_services() {
        let (workload, _) = workload();
        let spark = cluster(2);

        let rs = workload.replica_set(&spark, "ns1", true);
        assert_eq!(rs.metadata.name.as_deref(), Some("my-spark-m"));
        assert_eq!(rs.spec.as_ref().and_then(|s| s.replicas), Some(1));

        let master = workload.service(&spark, "ns1", false);
        let ui = workload.service(&spark, "ns1", true);
        assert_eq!(master.metadata.name.as_deref(), Some("my-spark"));
        assert_eq!(ui.metadata.name.as_deref(), Some("my-spark-ui"));
        let port = |svc: &Service| svc.spec.as_ref().unwrap().ports.as_ref().unwrap()[0].port;
        assert_eq!(port(&master), 7077);
        assert_eq!(port(&ui), 8080);
        let selector = ui.spec.as_ref().unwrap().selector.clone().unwrap();
        assert_eq!(
            selector.get("radanalytics.io/deployment").map(String::as_str),
            Some("my-spark-m")
        );
    }

    #[tokio::test]
    async fn add_applies_replica_sets_and_services() {
        let (workload, mut handle) = workload();
        let server = tokio::spawn(async move {
            let mut requests = Vec::new();
            for _ in 0..4 {
                let (method, path, _) = echo(&mut handle).await;
                assert_eq!(method, Method::PATCH);
                requests.push(path);
            }
            requests
        });

        workload
            .on_add(&cluster(2), &HandlerContext::new("ns1"))
            .await
            .unwrap();

        assert_eq!(
            server.await.unwrap(),
            vec![
                "/apis/apps/v1/namespaces/ns1/replicasets/my-spark-m",
                "/apis/apps/v1/namespaces/ns1/replicasets/my-spark-w",
                "/api/v1/namespaces/ns1/services/my-spark",
                "/api/v1/namespaces/ns1/services/my-spark-ui",
            ]
        );
    }

    #[tokio::test]
    async fn worker_count_change_only_scales() {
        let (workload, mut handle) = workload();
        let server = tokio::spawn(async move { echo(&mut handle).await });

        workload
            .on_modify(Some(&cluster(2)), &cluster(5), &HandlerContext::new("ns1"))
            .await
            .unwrap();

        let (method, path, body) = server.await.unwrap();
        assert_eq!(method, Method::PATCH);
        assert_eq!(path, "/apis/apps/v1/namespaces/ns1/replicasets/my-spark-w/scale");
        assert_eq!(body["spec"]["replicas"], 5);
        assert_eq!(body["kind"], "Scale");
    }

    #[tokio::test]
    async fn worker_gauge_follows_the_cluster() {
        let (workload, mut handle) = workload();
        let metrics = Metrics::default();
        let workload = workload.with_metrics(metrics.clone());
        let server = tokio::spawn(async move {
            for _ in 0..5 {
                echo(&mut handle).await;
            }
            handle
        });

        let ctx = HandlerContext::new("ns1");
        workload.on_add(&cluster(2), &ctx).await.unwrap();
        assert_eq!(metrics.started_clusters.with_label_values(&["ns1"]).get(), 1);
        assert_eq!(metrics.running_workers.with_label_values(&["my-spark", "ns1"]).get(), 2);

        workload
            .on_modify(Some(&cluster(2)), &cluster(4), &ctx)
            .await
            .unwrap();
        assert_eq!(metrics.running_workers.with_label_values(&["my-spark", "ns1"]).get(), 4);
        assert_eq!(metrics.started_clusters.with_label_values(&["ns1"]).get(), 1);

        let mut handle = server.await.unwrap();
        let server = tokio::spawn(async move {
            for _ in 0..3 {
                let (request, send) = handle.next_request().await.expect("service not called");
                assert_eq!(request.method(), Method::GET);
                let list = json!({
                    "apiVersion": "meta.k8s.io/v1",
                    "kind": "PartialObjectMetadataList",
                    "metadata": {},
                    "items": [],
                });
                send.send_response(
                    Response::builder()
                        .body(Body::from(serde_json::to_vec(&list).unwrap()))
                        .unwrap(),
                );
            }
        });
        workload.on_delete(&cluster(4), &ctx).await.unwrap();
        server.await.unwrap();
        let gauges = metrics.running_workers.clone();
        let registry = prometheus::Registry::new();
        registry.register(Box::new(gauges)).unwrap();
        assert!(registry.gather().iter().all(|f| f.get_metric().is_empty()));
    }

    #[tokio::test]
    async fn observe_reads_worker_replica_sets() {
        let (workload, mut handle) = workload();
        let rs = |name: &str, ns: &str, replicas: i32| {
            let spark = SparkCluster {
                name: name.into(),
                ..cluster(replicas)
            };
            serde_json::to_value(workload.replica_set(&spark, ns, false)).unwrap()
        };
        let items = vec![rs("a", "ns1", 2), rs("b", "ns2", 4)];

        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.uri().path(), "/apis/apps/v1/replicasets");
            let query = request.uri().query().unwrap_or_default().to_string();
            let list = json!({
                "apiVersion": "apps/v1",
                "kind": "ReplicaSetList",
                "metadata": { "resourceVersion": "7" },
                "items": items,
            });
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&list).unwrap()))
                    .unwrap(),
            );
            query
        });

        let observed = workload.observe(&WatchScope::All).await.unwrap();
        let query = server.await.unwrap();

        assert!(query.contains("rcType%3Dworker"), "{query}");
        assert_eq!(
            observed,
            BTreeMap::from([
                (
                    "a".to_string(),
                    ObservedState {
                        namespace: "ns1".into(),
                        replicas: 2
                    }
                ),
                (
                    "b".to_string(),
                    ObservedState {
                        namespace: "ns2".into(),
                        replicas: 4
                    }
                ),
            ])
        );
    }
}
