use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::Metrics;

pub mod bootstrap;
pub mod engine;
#[cfg(test)]
pub(crate) mod fakes;
pub mod registry;
pub mod watch;
pub mod workload;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    pub last_full_reconciliation: Option<DateTime<Utc>>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            last_full_reconciliation: None,
        }
    }
}

/// State shared between the operators and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the engines
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
}

impl Default for State {
    fn default() -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry: prometheus::Registry::default(),
        }
    }
}

/// State wrapper around the operator outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Registers a fresh set of metrics with this state's registry
    pub fn create_metrics(&self) -> Result<Metrics, prometheus::Error> {
        Metrics::default().register(&self.registry)
    }
}
