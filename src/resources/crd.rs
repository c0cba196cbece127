use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceColumnDefinition, CustomResourceDefinition, CustomResourceDefinitionNames,
    CustomResourceDefinitionSpec, CustomResourceDefinitionVersion, CustomResourceSubresourceStatus,
    CustomResourceSubresources, CustomResourceValidation, JSONSchemaProps, JSONSchemaPropsOrArray,
    JSONSchemaPropsOrBool,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ListParams, PostParams};
use kube::core::ApiResource;
use kube::{Api, Client};
use schemars::JsonSchema;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{Error, Result};

pub const CRD_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrinterColumn {
    pub name: String,
    pub json_path: String,
    /// Defaults to `string`
    pub type_: Option<String>,
}

impl PrinterColumn {
    pub fn new(name: &str, json_path: &str) -> Self {
        Self {
            name: name.to_string(),
            json_path: json_path.to_string(),
            type_: None,
        }
    }

    pub fn with_type(mut self, type_: &str) -> Self {
        self.type_ = Some(type_.to_string());
        self
    }
}

/// What is needed to find or create the CRD of a single kind
#[derive(Debug, Clone, Default)]
pub struct CrdDescriptor {
    pub kind: String,
    pub group: String,
    pub plural: Option<String>,
    pub short_names: Vec<String>,
    /// Schema of `spec`
    pub schema: Option<JSONSchemaProps>,
    pub printer_columns: Vec<PrinterColumn>,
}

impl CrdDescriptor {
    pub fn new(kind: &str, group: &str) -> Self {
        Self {
            kind: kind.to_string(),
            group: group.to_string(),
            ..Default::default()
        }
    }

    pub fn plural_name(&self) -> String {
        match self.plural.as_deref().map(str::trim) {
            Some(plural) if !plural.is_empty() => plural.to_lowercase(),
            _ => format!("{}s", self.kind).to_lowercase(),
        }
    }

    /// `<plural>.<group>`
    pub fn crd_name(&self) -> String {
        format!("{}.{}", self.plural_name(), self.group)
    }
}

/// Custom kinds known to this process, so custom objects can be addressed dynamically
#[derive(Clone, Default)]
pub struct KindRegistry {
    kinds: Arc<RwLock<HashMap<(String, String), ApiResource>>>,
}

impl KindRegistry {
    pub async fn register(&self, resource: ApiResource) {
        debug!(
            "Registering custom kind {}/{}#{}",
            resource.group, resource.version, resource.kind
        );
        self.kinds
            .write()
            .await
            .insert((resource.group.clone(), resource.kind.clone()), resource);
    }

    pub async fn get(&self, group: &str, kind: &str) -> Option<ApiResource> {
        self.kinds
            .read()
            .await
            .get(&(group.to_string(), kind.to_string()))
            .cloned()
    }

    pub async fn resolve(&self, group: &str, kind: &str) -> Result<ApiResource> {
        self.get(group, kind)
            .await
            .ok_or_else(|| Error::UnknownKind(format!("{group}/{kind}")))
    }
}

/// Finds or creates CRDs and registers their kinds
pub struct CrdLifecycleManager {
    client: Client,
    kinds: KindRegistry,
    lock: Mutex<()>,
}

impl CrdLifecycleManager {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            kinds: KindRegistry::default(),
            lock: Mutex::new(()),
        }
    }

    pub fn kinds(&self) -> &KindRegistry {
        &self.kinds
    }

    /// Reuses the CRD with the same kind and group if one exists, creates it otherwise.
    pub async fn ensure(&self, descriptor: &CrdDescriptor) -> Result<ApiResource> {
        let _guard = self.lock.lock().await;
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());

        let existing = crds.list(&ListParams::default()).await?;
        let crd = match existing
            .items
            .into_iter()
            .find(|crd| crd.spec.names.kind == descriptor.kind && crd.spec.group == descriptor.group)
        {
            Some(crd) => {
                info!(
                    "CustomResourceDefinition for {} has been found in the K8s, so we are skipping the creation.",
                    descriptor.kind
                );
                crd
            }
            None => self.create(&crds, descriptor).await?,
        };

        let resource = api_resource(&crd);
        self.kinds.register(resource.clone()).await;
        Ok(resource)
    }

    async fn create(
        &self,
        crds: &Api<CustomResourceDefinition>,
        descriptor: &CrdDescriptor,
    ) -> Result<CustomResourceDefinition> {
        info!("Creating CustomResourceDefinition for {}.", descriptor.kind);
        let schema = descriptor.schema.clone().map(|mut schema| {
            strip_defaults(&mut schema);
            schema
        });
        let validated = schema.is_some();

        match crds.create(&PostParams::default(), &build_crd(descriptor, schema)).await {
            Ok(crd) => Ok(crd),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!("{} has been created concurrently, reusing it", descriptor.crd_name());
                crds.get(&descriptor.crd_name())
                    .await
                    .map_err(|source| Error::CrdCreationFailed {
                        kind: descriptor.kind.clone(),
                        source,
                    })
            }
            Err(kube::Error::Api(ae)) if validated && (ae.code == 400 || ae.code == 422) => {
                warn!(
                    "Consider upgrading the Kubernetes cluster, schema validation of custom resources was rejected: {}",
                    ae.message
                );
                crds.create(&PostParams::default(), &build_crd(descriptor, None))
                    .await
                    .map_err(|source| Error::CrdCreationFailed {
                        kind: descriptor.kind.clone(),
                        source,
                    })
            }
            Err(source) => Err(Error::CrdCreationFailed {
                kind: descriptor.kind.clone(),
                source,
            }),
        }
    }
}

/// Builds a namespaced single version CRD. Without a schema every field is accepted.
pub fn build_crd(descriptor: &CrdDescriptor, schema: Option<JSONSchemaProps>) -> CustomResourceDefinition {
    let plural = descriptor.plural_name();
    let short_names: Vec<String> = descriptor
        .short_names
        .iter()
        .map(|name| name.trim().to_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let printer_columns: Vec<CustomResourceColumnDefinition> = descriptor
        .printer_columns
        .iter()
        .map(|column| CustomResourceColumnDefinition {
            name: column.name.clone(),
            json_path: column.json_path.clone(),
            type_: column.type_.clone().unwrap_or_else(|| "string".to_string()),
            ..Default::default()
        })
        .collect();

    CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some(format!("{plural}.{}", descriptor.group)),
            ..Default::default()
        },
        spec: CustomResourceDefinitionSpec {
            group: descriptor.group.clone(),
            names: CustomResourceDefinitionNames {
                kind: descriptor.kind.clone(),
                list_kind: Some(format!("{}List", descriptor.kind)),
                plural,
                singular: Some(descriptor.kind.to_lowercase()),
                short_names: (!short_names.is_empty()).then_some(short_names),
                ..Default::default()
            },
            scope: "Namespaced".to_string(),
            versions: vec![CustomResourceDefinitionVersion {
                name: CRD_VERSION.to_string(),
                served: true,
                storage: true,
                schema: Some(CustomResourceValidation {
                    open_api_v3_schema: Some(root_schema(schema)),
                }),
                subresources: Some(CustomResourceSubresources {
                    status: Some(CustomResourceSubresourceStatus(json!({}))),
                    scale: None,
                }),
                additional_printer_columns: (!printer_columns.is_empty()).then_some(printer_columns),
                ..Default::default()
            }],
            ..Default::default()
        },
        status: None,
    }
}

fn root_schema(spec: Option<JSONSchemaProps>) -> JSONSchemaProps {
    match spec {
        Some(spec) => JSONSchemaProps {
            type_: Some("object".to_string()),
            properties: Some(BTreeMap::from([
                ("spec".to_string(), spec),
                ("status".to_string(), preserve_unknown_fields()),
            ])),
            ..Default::default()
        },
        None => preserve_unknown_fields(),
    }
}

fn preserve_unknown_fields() -> JSONSchemaProps {
    JSONSchemaProps {
        type_: Some("object".to_string()),
        x_kubernetes_preserve_unknown_fields: Some(true),
        ..Default::default()
    }
}

/// Removes every `default` annotation, recursing into nested schemas
pub fn strip_defaults(schema: &mut JSONSchemaProps) {
    schema.default = None;

    for property in schema.properties.iter_mut().flat_map(|p| p.values_mut()) {
        strip_defaults(property);
    }

    match &mut schema.items {
        Some(JSONSchemaPropsOrArray::Schema(items)) => strip_defaults(items),
        Some(JSONSchemaPropsOrArray::Schemas(items)) => items.iter_mut().for_each(strip_defaults),
        None => {}
    }

    if let Some(JSONSchemaPropsOrBool::Schema(additional)) = &mut schema.additional_properties {
        strip_defaults(additional);
    }

    for nested in [&mut schema.all_of, &mut schema.any_of, &mut schema.one_of]
        .into_iter()
        .flatten()
        .flatten()
    {
        strip_defaults(nested);
    }
}

/// Structural OpenAPI v3 schema of `T`, as accepted by the API server
pub fn openapi_schema<T: JsonSchema>() -> Result<JSONSchemaProps> {
    let generator = schemars::gen::SchemaSettings::openapi3()
        .with(|s| {
            s.inline_subschemas = true;
            s.meta_schema = None;
        })
        .with_visitor(kube::core::schema::StructuralSchemaRewriter)
        .into_generator();
    let schema = generator.into_root_schema_for::<T>();
    Ok(serde_json::from_value(serde_json::to_value(schema)?)?)
}

fn api_resource(crd: &CustomResourceDefinition) -> ApiResource {
    let version = crd
        .spec
        .versions
        .iter()
        .find(|v| v.storage)
        .or_else(|| crd.spec.versions.first())
        .map(|v| v.name.clone())
        .unwrap_or_else(|| CRD_VERSION.to_string());

    ApiResource {
        api_version: format!("{}/{version}", crd.spec.group),
        group: crd.spec.group.clone(),
        version,
        kind: crd.spec.names.kind.clone(),
        plural: crd.spec.names.plural.clone(),
    }
}
