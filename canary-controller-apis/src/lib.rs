use kube::CustomResource;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &'static str = "example.canary.io";

pub const API_VERSION: &'static str = "v1beta1";

/// Configuration of a canary release.
///
/// The controller mirrors these objects into its own snapshot table and
/// reports every successful sync as a Kubernetes Event on the object.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "example.canary.io",
    version = "v1beta1",
    kind = "Canary",
    plural = "canaries",
    derive = "PartialEq",
    namespaced,
    printcolumn = r#"{
        "name":"Image",
        "type": "string",
        "jsonPath": ".spec.image",
        "description": "The container image rolled out by this canary."
    }"#,
    printcolumn = r#"{
        "name":"Replicas",
        "type": "integer",
        "jsonPath": ".spec.replicas",
        "description": "Number of canary replicas."
    }"#,
    printcolumn = r#"{
        "name":"Schedule",
        "type": "string",
        "jsonPath": ".spec.cron",
        "description": "Cron expression controlling when the canary runs."
    }"#
)]
pub struct CanarySpec {
    /// Container image reference, e.g. `registry.example.com/app:1.2.3`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Schedule expression in cron syntax.
    pub cron: String,
    /// Number of replicas.
    pub replicas: i32,
}

impl Canary {
    /// Human readable identity in the `{name}.{namespace}` form used in logs and notifications.
    pub fn id(&self) -> String {
        format!(
            "{}.{}",
            self.metadata.name.as_deref().unwrap_or(""),
            self.metadata.namespace.as_deref().unwrap_or(""),
        )
    }
}
