use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetSpec};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodTemplateSpec, Service};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaProps;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use tracing::{info, warn};

use super::{
    apply, delete_labelled, object_meta, observe_labelled, resource_labels, DEFAULT_PREFIX, SERVICE_ACCOUNT,
};
use crate::config::WatchScope;
use crate::controllers::workload::{HandlerContext, ObservedState, OperatorDeclaration, Workload};
use crate::resources::crd::{openapi_schema, PrinterColumn};
use crate::resources::labels::{kind_label, label_selector, label_selector_string};
use crate::resources::sparkapplications::{SparkApplication, SPARK_APPLICATION_KIND};
use crate::Result;

/// Submits Spark applications from a single submitter pod
///
/// The submitter runs `spark-submit` in cluster mode and then idles, so the
/// ReplicaSet does not restart it. Driver and executor pods carry the same
/// name label and are removed together with the submitter.
pub struct SparkApplicationWorkload {
    client: Client,
    declaration: OperatorDeclaration,
}

impl SparkApplicationWorkload {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            declaration: Self::default_declaration(),
        }
    }

    pub fn default_declaration() -> OperatorDeclaration {
        OperatorDeclaration::new(SPARK_APPLICATION_KIND, DEFAULT_PREFIX)
            .with_short_names(["sa"])
            .with_printer_column(PrinterColumn::new("Class", ".spec.mainClass"))
            .with_printer_column(PrinterColumn::new("State", ".status.state"))
    }

    pub fn with_declaration(mut self, declaration: OperatorDeclaration) -> Self {
        self.declaration = declaration;
        self
    }

    fn prefix(&self) -> &str {
        &self.declaration.prefix
    }

    fn labels(&self, name: &str) -> BTreeMap<String, String> {
        resource_labels(self.prefix(), SPARK_APPLICATION_KIND, name)
    }

    fn submit_command(&self, app: &SparkApplication, namespace: &str) -> String {
        let name = app.name.as_str();
        let label = format!("{}{SPARK_APPLICATION_KIND}={name}", self.prefix());
        [
            "/opt/spark/bin/spark-submit".to_string(),
            format!("--class {}", app.main_class),
            "--master k8s://https://$KUBERNETES_SERVICE_HOST:$KUBERNETES_SERVICE_PORT".into(),
            format!("--conf spark.kubernetes.namespace={namespace}"),
            "--deploy-mode cluster".into(),
            format!("--conf spark.app.name={name}"),
            format!("--conf spark.kubernetes.container.image={}", app.image()),
            "--conf spark.kubernetes.submission.waitAppCompletion=false".into(),
            format!("--conf spark.kubernetes.driver.label.{label}"),
            "--conf spark.driver.cores=0.100000".into(),
            "--conf spark.kubernetes.driver.limit.cores=200m".into(),
            "--conf spark.driver.memory=512m".into(),
            format!("--conf spark.kubernetes.authenticate.driver.serviceAccountName={SERVICE_ACCOUNT}"),
            format!("--conf spark.kubernetes.executor.label.{label}"),
            "--conf spark.executor.instances=1".into(),
            "--conf spark.executor.cores=1".into(),
            "--conf spark.executor.memory=512m".into(),
            "--conf spark.jars.ivy=/tmp/.ivy2".into(),
            app.main_application_file.clone(),
            "&& sleep 31536000".into(),
        ]
        .join(" ")
    }

    pub fn submitter(&self, app: &SparkApplication, namespace: &str) -> ReplicaSet {
        let labels = self.labels(&app.name);
        let container = Container {
            name: app.name.clone(),
            image: Some(app.image().into()),
            image_pull_policy: Some("IfNotPresent".into()),
            termination_message_path: Some("/dev/termination-log".into()),
            termination_message_policy: Some("File".into()),
            command: Some(vec!["/bin/sh".into(), "-c".into()]),
            args: Some(vec![self.submit_command(app, namespace)]),
            ..Default::default()
        };

        ReplicaSet {
            metadata: object_meta(&app.name, namespace, labels.clone()),
            spec: Some(ReplicaSetSpec {
                replicas: Some(1),
                selector: label_selector(labels.clone()),
                template: Some(PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        service_account_name: Some(SERVICE_ACCOUNT.into()),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            }),
            status: None,
        }
    }
}

#[async_trait]
impl Workload for SparkApplicationWorkload {
    type Entity = SparkApplication;

    fn declaration(&self) -> &OperatorDeclaration {
        &self.declaration
    }

    fn schema(&self) -> Option<JSONSchemaProps> {
        match openapi_schema::<SparkApplication>() {
            Ok(schema) => Some(schema),
            Err(err) => {
                warn!("Unable to generate the SparkApplication schema, the CRD will not validate: {err}");
                None
            }
        }
    }

    async fn on_add(&self, app: &SparkApplication, ctx: &HandlerContext) -> Result<()> {
        info!("Submitting {} in namespace {}", app.name, ctx.namespace);
        apply(&self.client, &ctx.namespace, &self.submitter(app, &ctx.namespace)).await?;
        if let Err(err) = ctx.report_state(&app.name, "submitted").await {
            warn!("Giving up on the status of SparkApplication {}: {err}", app.name);
        }
        Ok(())
    }

    async fn on_delete(&self, app: &SparkApplication, ctx: &HandlerContext) -> Result<()> {
        let name_label = BTreeMap::from([(format!("{}{SPARK_APPLICATION_KIND}", self.prefix()), app.name.clone())]);
        let selector = label_selector_string(&label_selector(name_label));
        let namespace = ctx.namespace.as_str();
        delete_labelled::<Service>(&self.client, namespace, &selector).await?;
        delete_labelled::<ReplicaSet>(&self.client, namespace, &selector).await?;
        delete_labelled::<Pod>(&self.client, namespace, &selector).await?;
        Ok(())
    }

    async fn observe(&self, scope: &WatchScope) -> Result<BTreeMap<String, ObservedState>> {
        let submitters = BTreeMap::from([(kind_label(self.prefix()), SPARK_APPLICATION_KIND.to_string())]);
        let name_label = format!("{}{SPARK_APPLICATION_KIND}", self.prefix());
        observe_labelled(&self.client, scope, submitters, &name_label, |rs: &ReplicaSet| {
            rs.spec.as_ref().and_then(|s| s.replicas)
        })
        .await
    }

    fn desired_replicas(&self, _app: &SparkApplication) -> i32 {
        1
    }

    fn set_observed_replicas(&self, _app: &mut SparkApplication, _replicas: i32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_include;
    use http::{Method, Request, Response};
    use kube::client::Body;
    use serde_json::json;
    use tower_test::mock::{self, Handle};

    type ApiServerHandle = Handle<Request<Body>, Response<Body>>;

    fn workload() -> (SparkApplicationWorkload, ApiServerHandle) {
        let (service, handle) = mock::pair::<Request<Body>, Response<Body>>();
        (SparkApplicationWorkload::new(Client::new(service, "default")), handle)
    }

    fn pi() -> SparkApplication {
        SparkApplication {
            name: "pi".into(),
            namespace: Some("ns1".into()),
            main_class: "org.apache.spark.examples.SparkPi".into(),
            main_application_file: "local:///opt/spark/examples/jars/spark-examples.jar".into(),
            ..Default::default()
        }
    }

    fn empty_list() -> Response<Body> {
        let list = json!({
            "apiVersion": "meta.k8s.io/v1",
            "kind": "PartialObjectMetadataList",
            "metadata": {},
            "items": [],
        });
        Response::builder()
            .body(Body::from(serde_json::to_vec(&list).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn submitter_runs_spark_submit_in_cluster_mode() {
        let (workload, _) = workload();
        let rs = workload.submitter(&pi(), "ns1");
        let args = rs.spec.as_ref().unwrap().template.as_ref().unwrap().spec.as_ref().unwrap().containers[0]
            .args
            .clone()
            .unwrap();
        let command = &args[0];
        assert!(command.starts_with("/opt/spark/bin/spark-submit --class org.apache.spark.examples.SparkPi"));
        assert!(command.contains("--deploy-mode cluster"));
        assert!(command.contains("--conf spark.kubernetes.namespace=ns1"));
        assert!(command.contains("--conf spark.kubernetes.driver.label.radanalytics.io/SparkApplication=pi"));
        assert!(command.ends_with("local:///opt/spark/examples/jars/spark-examples.jar && sleep 31536000"));

        assert_json_include!(
            actual: serde_json::to_value(&rs).unwrap(),
            expected: json!({
                "metadata": {
                    "name": "pi",
                    "labels": {
                        "radanalytics.io/kind": "SparkApplication",
                        "radanalytics.io/SparkApplication": "pi",
                    },
                },
                "spec": {
                    "replicas": 1,
                    "template": { "spec": {
                        "serviceAccountName": "spark-operator",
                        "containers": [{ "command": ["/bin/sh", "-c"] }],
                    } },
                },
            })
        );
    }

    #[tokio::test]
    async fn modify_deletes_then_resubmits() {
        let (workload, mut handle) = workload();
        let server = tokio::spawn(async move {
            let mut requests = Vec::new();
            for _ in 0..3 {
                let (request, send) = handle.next_request().await.expect("service not called");
                requests.push((request.method().clone(), request.uri().path().to_string()));
                send.send_response(empty_list());
            }
            let (request, send) = handle.next_request().await.expect("service not called");
            requests.push((request.method().clone(), request.uri().path().to_string()));
            let body = request.into_body().collect_bytes().await.unwrap();
            send.send_response(Response::builder().body(Body::from(body.to_vec())).unwrap());
            requests
        });

        let mut changed = pi();
        changed.main_class = "org.apache.spark.examples.SparkLR".into();
        workload
            .on_modify(Some(&pi()), &changed, &HandlerContext::new("ns1"))
            .await
            .unwrap();

        assert_eq!(
            server.await.unwrap(),
            vec![
                (Method::GET, "/api/v1/namespaces/ns1/services".to_string()),
                (Method::GET, "/apis/apps/v1/namespaces/ns1/replicasets".to_string()),
                (Method::GET, "/api/v1/namespaces/ns1/pods".to_string()),
                (Method::PATCH, "/apis/apps/v1/namespaces/ns1/replicasets/pi".to_string()),
            ]
        );
    }
}
