use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::entity::Entity;
use super::sparkclusters::DEFAULT_SPARK_IMAGE;

pub const SPARK_HISTORY_SERVER_KIND: &str = "SparkHistoryServer";

/// A Spark history server, optionally reachable through a Service
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct SparkHistoryServer {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_image: Option<String>,
    /// Creates a Service in front of the web UI
    pub expose: bool,
}

impl SparkHistoryServer {
    pub fn image(&self) -> &str {
        self.custom_image
            .as_deref()
            .filter(|image| !image.is_empty())
            .unwrap_or(DEFAULT_SPARK_IMAGE)
    }
}

impl PartialEq for SparkHistoryServer {
    fn eq(&self, other: &Self) -> bool {
        self.same_entity(other)
    }
}

impl Eq for SparkHistoryServer {}

impl Entity for SparkHistoryServer {
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
