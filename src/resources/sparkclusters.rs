use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::entity::Entity;

pub const SPARK_CLUSTER_KIND: &str = "SparkCluster";
pub const DEFAULT_SPARK_IMAGE: &str = "quay.io/radanalyticsio/openshift-spark:3.0";

/// A Spark cluster configuration
///
/// Two clusters are the same cluster when their names match, see [`Entity`].
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct SparkCluster {
    /// Defaults to the name of the ConfigMap or custom resource
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub master: SparkNodes,
    pub worker: SparkNodes,
    /// Image used for master and worker pods
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_image: Option<String>,
    /// Memory limit of every pod, e.g. `1Gi`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// CPU limit of every pod, e.g. `500m`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Additional environment of master and worker containers
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<SparkEnv>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct SparkNodes {
    pub instances: i32,
}

impl Default for SparkNodes {
    fn default() -> Self {
        Self { instances: 1 }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct SparkEnv {
    pub name: String,
    pub value: String,
}

impl SparkCluster {
    pub fn image(&self) -> &str {
        self.custom_image
            .as_deref()
            .filter(|image| !image.is_empty())
            .unwrap_or(DEFAULT_SPARK_IMAGE)
    }

    /// Only the number of workers differs from `other`
    pub fn is_only_scale(&self, other: &SparkCluster) -> bool {
        if self.worker.instances == other.worker.instances {
            return false;
        }
        let mut scaled = other.clone();
        scaled.worker.instances = self.worker.instances;
        super::entity::same_content(self, &scaled)
    }
}

impl PartialEq for SparkCluster {
    fn eq(&self, other: &Self) -> bool {
        self.same_entity(other)
    }
}

impl Eq for SparkCluster {}

impl Entity for SparkCluster {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }

    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    fn set_namespace(&mut self, namespace: String) {
        self.namespace = Some(namespace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::entity::{DefaultCodec, EntityCodec, RawBody};

    #[test]
    fn yaml_config_gets_defaults() {
        let cluster: SparkCluster = DefaultCodec
            .decode(RawBody::Yaml(Some("worker:\n  instances: 3\n")), "my-spark", Some("ns1"))
            .unwrap();
        assert_eq!(cluster.name, "my-spark");
        assert_eq!(cluster.master.instances, 1);
        assert_eq!(cluster.worker.instances, 3);
        assert_eq!(cluster.image(), DEFAULT_SPARK_IMAGE);
    }

    #[test]
    fn only_scale_is_detected() {
        let mut before = SparkCluster {
            name: "a".into(),
            ..Default::default()
        };
        let mut after = before.clone();
        after.worker.instances = 4;
        assert!(after.is_only_scale(&before));

        after.memory = Some("1Gi".into());
        assert!(!after.is_only_scale(&before));

        before.worker.instances = 4;
        assert!(!after.is_only_scale(&before));
    }

    #[test]
    fn equality_is_by_name() {
        let a = SparkCluster {
            name: "a".into(),
            ..Default::default()
        };
        let mut b = a.clone();
        b.worker.instances = 7;
        assert_eq!(a, b);
    }

    #[test]
    fn schema_is_structural() {
        let schema = crate::resources::crd::openapi_schema::<SparkCluster>().unwrap();
        let properties = schema.properties.unwrap();
        assert!(properties.contains_key("customImage"));
        assert!(properties.contains_key("worker"));
    }
}
