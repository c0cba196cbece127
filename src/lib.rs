use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YamlError: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Invalid operator configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Unable to create the CustomResourceDefinition for {kind}: {source}")]
    CrdCreationFailed {
        kind: String,
        #[source]
        source: kube::Error,
    },

    #[error("The kind {0} has not been registered")]
    UnknownKind(String),

    #[error("Operation did not finish within {0:?}")]
    OperationTimeout(Duration),

    #[error("Workload operation failed: {0}")]
    WorkloadFailed(String),

    #[error("Unable to update the status of {name} in namespace {namespace} after {attempts} attempts")]
    StatusUpdateFailed {
        name: String,
        namespace: String,
        attempts: u32,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::YamlError(_) => "YamlError",
            Error::KubeError(_) => "KubeError",
            Error::InvalidConfiguration(_) => "InvalidConfiguration",
            Error::CrdCreationFailed { .. } => "CrdCreationFailed",
            Error::UnknownKind(_) => "UnknownKind",
            Error::OperationTimeout(_) => "OperationTimeout",
            Error::WorkloadFailed(_) => "WorkloadFailed",
            Error::StatusUpdateFailed { .. } => "StatusUpdateFailed",
        }
    }
}

/// Operator configuration read from flags and the environment
pub mod config;

pub mod controllers;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// Bundled workloads
pub mod reconcilers;

/// Entities, CRDs and label conventions
pub mod resources;

pub use config::{NamespaceScope, OperatorConfig};
pub use controllers::bootstrap::OperatorBootstrap;
pub use controllers::workload::{HandlerContext, ObservedState, OperatorDeclaration, Workload};
pub use controllers::State;
pub use resources::entity::{DefaultCodec, Entity, EntityCodec};
