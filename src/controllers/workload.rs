use std::collections::BTreeMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaProps;
use regex::Regex;

use super::watch::WatchedObject;
use crate::config::WatchScope;
use crate::resources::crd::{CrdDescriptor, PrinterColumn};
use crate::resources::entity::{DefaultCodec, Entity, EntityCodec};
use crate::resources::labels;
use crate::resources::status::StatusReporter;
use crate::{Error, Result};

/// Kind metadata of one operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorDeclaration {
    /// Entity kind, e.g. `SparkCluster`
    pub kind: String,
    /// Label prefix, ends with `/`. Without the slash it is the CRD group.
    pub prefix: String,
    pub short_names: Vec<String>,
    pub plural: Option<String>,
    pub printer_columns: Vec<PrinterColumn>,
    /// Watch custom resources instead of labelled ConfigMaps
    pub crd: bool,
    pub enabled: bool,
}

impl OperatorDeclaration {
    pub fn new(kind: &str, prefix: &str) -> Self {
        Self {
            kind: kind.to_string(),
            prefix: prefix.to_string(),
            short_names: Vec::new(),
            plural: None,
            printer_columns: Vec::new(),
            crd: true,
            enabled: true,
        }
    }

    pub fn with_short_names<I, S>(mut self, short_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.short_names = short_names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_plural(mut self, plural: &str) -> Self {
        self.plural = Some(plural.to_string());
        self
    }

    pub fn with_printer_column(mut self, column: PrinterColumn) -> Self {
        self.printer_columns.push(column);
        self
    }

    pub fn with_crd(mut self, crd: bool) -> Self {
        self.crd = crd;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn operator_name(&self) -> String {
        format!("'{}' operator", self.kind)
    }

    pub fn group(&self) -> &str {
        self.prefix.trim_end_matches('/')
    }

    /// Labels selecting the ConfigMaps of this kind
    pub fn selector(&self) -> BTreeMap<String, String> {
        labels::for_kind(&self.kind, &self.prefix)
    }

    pub fn validate(&self) -> Result<()> {
        static GROUP: OnceLock<Regex> = OnceLock::new();
        let group = GROUP.get_or_init(|| {
            Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
        });

        if self.kind.trim().is_empty() {
            return Err(Error::InvalidConfiguration("the entity kind must not be empty".into()));
        }
        if self.prefix.is_empty() || !self.prefix.ends_with('/') {
            return Err(Error::InvalidConfiguration(format!(
                "the prefix of {} must be non-empty and end with '/', got '{}'",
                self.operator_name(),
                self.prefix
            )));
        }
        if self.crd && !group.is_match(self.group()) {
            return Err(Error::InvalidConfiguration(format!(
                "'{}' is not a valid API group for {}",
                self.group(),
                self.operator_name()
            )));
        }
        if let Some(column) = self
            .printer_columns
            .iter()
            .find(|c| c.name.trim().is_empty() || c.json_path.trim().is_empty())
        {
            return Err(Error::InvalidConfiguration(format!(
                "printer column {column:?} of {} needs a name and a JSON path",
                self.operator_name()
            )));
        }
        Ok(())
    }

    pub fn crd_descriptor(&self, schema: Option<JSONSchemaProps>) -> CrdDescriptor {
        CrdDescriptor {
            kind: self.kind.clone(),
            group: self.group().to_string(),
            plural: self.plural.clone(),
            short_names: self.short_names.clone(),
            schema,
            printer_columns: self.printer_columns.clone(),
        }
    }
}

/// What the workload reports about resources it created for one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedState {
    pub namespace: String,
    pub replicas: i32,
}

/// Passed to every handler call
#[derive(Clone)]
pub struct HandlerContext {
    /// Namespace the entity was observed in
    pub namespace: String,
    pub status: Option<StatusReporter>,
}

impl HandlerContext {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            status: None,
        }
    }

    /// Reports `state` on the custom resource; a no-op for ConfigMaps
    pub async fn report_state(&self, name: &str, state: &str) -> Result<()> {
        match &self.status {
            Some(status) => status.set_state(&self.namespace, name, state).await,
            None => Ok(()),
        }
    }
}

/// The domain logic of one operator
#[async_trait]
pub trait Workload: Send + Sync + 'static {
    type Entity: Entity;

    fn declaration(&self) -> &OperatorDeclaration;

    fn codec(&self) -> &dyn EntityCodec<Self::Entity> {
        &DefaultCodec
    }

    /// Validation schema of the custom resource `spec`
    fn schema(&self) -> Option<JSONSchemaProps> {
        None
    }

    /// Filter applied to every watched object on top of the kind check
    fn is_supported(&self, _object: &WatchedObject) -> bool {
        true
    }

    async fn on_add(&self, entity: &Self::Entity, ctx: &HandlerContext) -> Result<()>;

    async fn on_delete(&self, entity: &Self::Entity, ctx: &HandlerContext) -> Result<()>;

    /// `previous` is the last applied version, if any. Recreates by default.
    async fn on_modify(
        &self,
        _previous: Option<&Self::Entity>,
        entity: &Self::Entity,
        ctx: &HandlerContext,
    ) -> Result<()> {
        self.on_delete(entity, ctx).await?;
        self.on_add(entity, ctx).await
    }

    /// Ground truth: entity name to what the cluster currently runs for it
    async fn observe(&self, scope: &WatchScope) -> Result<BTreeMap<String, ObservedState>>;

    /// The magnitude compared against [`ObservedState::replicas`]
    fn desired_replicas(&self, entity: &Self::Entity) -> i32;

    fn set_observed_replicas(&self, entity: &mut Self::Entity, replicas: i32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_declaration() {
        let declaration = OperatorDeclaration::new("SparkCluster", "radanalytics.io/")
            .with_short_names(["sc"])
            .with_printer_column(PrinterColumn::new("Workers", ".spec.worker.instances"));
        assert!(declaration.validate().is_ok());
        assert_eq!(declaration.group(), "radanalytics.io");
        assert_eq!(declaration.operator_name(), "'SparkCluster' operator");

        let descriptor = declaration.crd_descriptor(None);
        assert_eq!(descriptor.crd_name(), "sparkclusters.radanalytics.io");
        assert_eq!(descriptor.short_names, vec!["sc".to_string()]);
    }

    #[test]
    fn prefix_must_end_with_slash() {
        for prefix in ["", "radanalytics.io"] {
            let declaration = OperatorDeclaration::new("SparkCluster", prefix);
            assert!(matches!(
                declaration.validate(),
                Err(Error::InvalidConfiguration(_))
            ));
        }
    }

    #[test]
    fn kind_must_be_set() {
        assert!(OperatorDeclaration::new(" ", "radanalytics.io/").validate().is_err());
    }

    #[test]
    fn group_is_only_checked_for_crds() {
        let declaration = OperatorDeclaration::new("Thing", "Not A Group/");
        assert!(declaration.validate().is_err());
        assert!(declaration.with_crd(false).validate().is_ok());
    }

    #[test]
    fn printer_columns_need_a_path() {
        let declaration = OperatorDeclaration::new("Thing", "example.io/")
            .with_printer_column(PrinterColumn::new("Broken", ""));
        assert!(declaration.validate().is_err());
    }

    #[test]
    fn selector_uses_kind_label() {
        let declaration = OperatorDeclaration::new("Thing", "example.io/");
        assert_eq!(
            declaration.selector(),
            BTreeMap::from([("example.io/kind".to_string(), "Thing".to_string())])
        );
    }
}
