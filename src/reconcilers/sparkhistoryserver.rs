use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaProps;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Client;
use tracing::{info, warn};

use super::{
    apply, delete_labelled, env_var, object_meta, observe_labelled, resource_labels, DEFAULT_PREFIX,
    SERVICE_ACCOUNT,
};
use crate::config::WatchScope;
use crate::controllers::workload::{HandlerContext, ObservedState, OperatorDeclaration, Workload};
use crate::resources::crd::{openapi_schema, PrinterColumn};
use crate::resources::labels::{kind_label, label_selector, label_selector_string};
use crate::resources::sparkhistoryservers::{SparkHistoryServer, SPARK_HISTORY_SERVER_KIND};
use crate::Result;

pub const HISTORY_UI_PORT: i32 = 9001;

/// Runs a Spark history server as a single replica Deployment
pub struct SparkHistoryServerWorkload {
    client: Client,
    declaration: OperatorDeclaration,
}

impl SparkHistoryServerWorkload {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            declaration: Self::default_declaration(),
        }
    }

    pub fn default_declaration() -> OperatorDeclaration {
        OperatorDeclaration::new(SPARK_HISTORY_SERVER_KIND, DEFAULT_PREFIX)
            .with_short_names(["shs"])
            .with_printer_column(PrinterColumn::new("Exposed", ".spec.expose").with_type("boolean"))
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
        resource_labels(self.prefix(), SPARK_HISTORY_SERVER_KIND, name)
    }

    pub fn deployment(&self, server: &SparkHistoryServer, namespace: &str) -> Deployment {
        let labels = self.labels(&server.name);
        let container = Container {
            name: "history-server".into(),
            image: Some(server.image().into()),
            command: Some(vec!["/bin/sh".into(), "-c".into()]),
            args: Some(vec![
                "mkdir -p /tmp/spark-events && /entrypoint ls && /opt/spark/bin/spark-class \
                 org.apache.spark.deploy.history.HistoryServer"
                    .into(),
            ]),
            env: Some(vec![env_var(
                "SPARK_HISTORY_OPTS",
                &format!("-Dspark.history.ui.port={HISTORY_UI_PORT}"),
            )]),
            ports: Some(vec![ContainerPort {
                name: Some("web-ui".into()),
                container_port: HISTORY_UI_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        };

        Deployment {
            metadata: object_meta(&server.name, namespace, labels.clone()),
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: label_selector(labels.clone()),
                strategy: Some(DeploymentStrategy {
                    type_: Some("Recreate".into()),
                    rolling_update: None,
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        service_account_name: Some(SERVICE_ACCOUNT.into()),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }

    pub fn service(&self, server: &SparkHistoryServer, namespace: &str) -> Service {
        let labels = self.labels(&server.name);
        Service {
            metadata: object_meta(&server.name, namespace, labels.clone()),
            spec: Some(ServiceSpec {
                selector: Some(labels),
                ports: Some(vec![ServicePort {
                    name: Some("web-ui".into()),
                    port: HISTORY_UI_PORT,
                    target_port: Some(IntOrString::Int(HISTORY_UI_PORT)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }
}

#[async_trait]
impl Workload for SparkHistoryServerWorkload {
    type Entity = SparkHistoryServer;

    fn declaration(&self) -> &OperatorDeclaration {
        &self.declaration
    }

    fn schema(&self) -> Option<JSONSchemaProps> {
        match openapi_schema::<SparkHistoryServer>() {
            Ok(schema) => Some(schema),
            Err(err) => {
                warn!("Unable to generate the SparkHistoryServer schema, the CRD will not validate: {err}");
                None
            }
        }
    }

    async fn on_add(&self, server: &SparkHistoryServer, ctx: &HandlerContext) -> Result<()> {
        info!("Starting history server {} in namespace {}", server.name, ctx.namespace);
        apply(&self.client, &ctx.namespace, &self.deployment(server, &ctx.namespace)).await?;
        if server.expose {
            apply(&self.client, &ctx.namespace, &self.service(server, &ctx.namespace)).await?;
        }
        if let Err(err) = ctx.report_state(&server.name, "ready").await {
            warn!("Giving up on the status of SparkHistoryServer {}: {err}", server.name);
        }
        Ok(())
    }

    async fn on_delete(&self, server: &SparkHistoryServer, ctx: &HandlerContext) -> Result<()> {
        let selector = label_selector_string(&label_selector(self.labels(&server.name)));
        let namespace = ctx.namespace.as_str();
        delete_labelled::<Service>(&self.client, namespace, &selector).await?;
        delete_labelled::<Deployment>(&self.client, namespace, &selector).await?;
        Ok(())
    }

    async fn observe(&self, scope: &WatchScope) -> Result<BTreeMap<String, ObservedState>> {
        let servers = BTreeMap::from([(kind_label(self.prefix()), SPARK_HISTORY_SERVER_KIND.to_string())]);
        let name_label = format!("{}{SPARK_HISTORY_SERVER_KIND}", self.prefix());
        observe_labelled(&self.client, scope, servers, &name_label, |d: &Deployment| {
            d.spec.as_ref().and_then(|s| s.replicas)
        })
        .await
    }

    fn desired_replicas(&self, _server: &SparkHistoryServer) -> i32 {
        1
    }

    fn set_observed_replicas(&self, _server: &mut SparkHistoryServer, _replicas: i32) {}
}
