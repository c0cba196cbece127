use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use kube::api::{DynamicObject, Patch, PatchParams};
use kube::core::ApiResource;
use kube::{Api, Client};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::{Error, Result};

pub const STATUS_ATTEMPTS: u32 = 3;
pub const STATUS_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfoStatus {
    pub state: String,
    pub last_transition_time: String,
}

impl InfoStatus {
    pub fn new(state: &str) -> Self {
        Self {
            state: state.to_string(),
            last_transition_time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Writes the `status` subresource of custom objects of one kind
#[derive(Clone)]
pub struct StatusReporter {
    client: Client,
    resource: ApiResource,
    attempts: u32,
    backoff: Duration,
}

impl StatusReporter {
    pub fn new(client: Client, resource: ApiResource) -> Self {
        Self {
            client,
            resource,
            attempts: STATUS_ATTEMPTS,
            backoff: STATUS_BACKOFF,
        }
    }

    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// Sets `status.state`; an object that no longer exists is not an error.
    pub async fn set_state(&self, namespace: &str, name: &str, state: &str) -> Result<()> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &self.resource);
        let patch = Patch::Merge(json!({ "status": InfoStatus::new(state) }));

        for attempt in 1..=self.attempts {
            match api.patch_status(name, &PatchParams::default(), &patch).await {
                Ok(_) => {
                    debug!("Status of {} {name} set to {state}", self.resource.kind);
                    return Ok(());
                }
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    debug!("{} {name} is gone, not updating its status", self.resource.kind);
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        "Failed to update the status of {} {name} (attempt {attempt}/{}): {err}",
                        self.resource.kind, self.attempts
                    );
                    if attempt < self.attempts {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
            }
        }

        Err(Error::StatusUpdateFailed {
            name: name.to_string(),
            namespace: namespace.to_string(),
            attempts: self.attempts,
        })
    }
}
