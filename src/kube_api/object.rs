use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Any Kubernetes object: the typed envelope plus whatever else the server sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeObject {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// `spec`, `status`, `data` and anything else.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl KubeObject {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    pub fn owner_refs(&self) -> Vec<KubeObjectRef> {
        self.metadata
            .owner_references
            .iter()
            .flatten()
            .map(KubeObjectRef::from)
            .collect()
    }
}

/// A pointer to another object, as found in owner references and events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeObjectRef {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl KubeObjectRef {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = Some(api_version.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

impl From<&OwnerReference> for KubeObjectRef {
    fn from(owner: &OwnerReference) -> Self {
        Self::new(&owner.kind, &owner.name).with_api_version(&owner.api_version)
    }
}

/// Whether a response body carries an actual object rather than a `Status`
/// or an empty document.
pub(crate) fn is_object_data(value: &Value) -> bool {
    let Value::Object(object) = value else {
        return false;
    };
    object.get("metadata").is_some_and(Value::is_object)
        && object.get("kind").and_then(Value::as_str) != Some("Status")
}
