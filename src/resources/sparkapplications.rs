use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::entity::Entity;
use super::sparkclusters::DEFAULT_SPARK_IMAGE;

pub const SPARK_APPLICATION_KIND: &str = "SparkApplication";

/// A Spark application submitted in cluster mode
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct SparkApplication {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Image of the driver and the executors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// e.g. `local:///opt/spark/examples/jars/spark-examples.jar`
    pub main_application_file: String,
    pub main_class: String,
}

impl SparkApplication {
    pub fn image(&self) -> &str {
        self.image
            .as_deref()
            .filter(|image| !image.is_empty())
            .unwrap_or(DEFAULT_SPARK_IMAGE)
    }
}

impl PartialEq for SparkApplication {
    fn eq(&self, other: &Self) -> bool {
        self.same_entity(other)
    }
}

impl Eq for SparkApplication {}

impl Entity for SparkApplication {
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
    fn yaml_config_is_camel_case() {
        let app: SparkApplication = DefaultCodec
            .decode(
                RawBody::Yaml(Some("mainClass: org.apache.spark.examples.SparkPi\nmainApplicationFile: local:///pi.jar\n")),
                "pi",
                Some("ns1"),
            )
            .unwrap();
        assert_eq!(app.name, "pi");
        assert_eq!(app.namespace.as_deref(), Some("ns1"));
        assert_eq!(app.main_class, "org.apache.spark.examples.SparkPi");
        assert_eq!(app.main_application_file, "local:///pi.jar");
        assert_eq!(app.image(), DEFAULT_SPARK_IMAGE);
    }
}
