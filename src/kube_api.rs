//! Typed access to one Kubernetes resource kind.
//!
//! A [`KubeApi`] builds URLs for its kind, negotiates the api group/version the
//! cluster actually serves, performs CRUD calls and runs watches. The
//! non-generic half of it, an [`ApiEndpoint`], is what the
//! [`ApiRegistry`](crate::registry::ApiRegistry) tracks.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use http::StatusCode;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{APIGroup, APIResourceList};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::OnceCell;

use crate::{
    json_api::{JsonApiError, KubeJsonApi, RequestInit, ResponseBody},
    registry::ApiRegistry,
    seq::seq,
};

mod descriptor;
pub use descriptor::{builtin, builtins, ResourceDescriptor};
mod object;
pub(crate) use object::is_object_data;
pub use object::{KubeObject, KubeObjectRef};
mod patch;
pub use patch::{
    Patch, PatchError, PatchStrategy, CONTENT_TYPE_JSON_PATCH,
    CONTENT_TYPE_MERGE_PATCH, CONTENT_TYPE_STRATEGIC_MERGE_PATCH,
};
mod path;
pub use path::{api_url, ApiPath, InvalidApiPath};
mod watch;
pub use watch::{WatchError, WatchEvent, WatchHandle, WatchOptions};

/// Turns a raw object body into `K`.
pub type Constructor<K> = fn(Value) -> serde_json::Result<K>;

pub const DEFAULT_NAMESPACE: &str = "default";

pub(crate) fn namespace_or_default(namespace: Option<&str>) -> &str {
    namespace
        .filter(|namespace| !namespace.is_empty())
        .unwrap_or(DEFAULT_NAMESPACE)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Request(#[from] JsonApiError),
    #[error(transparent)]
    InvalidPath(#[from] InvalidApiPath),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error("failed to decode {kind} object: {source}")]
    Decode {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} is cluster-scoped and cannot be addressed in namespace {namespace:?}")]
    ClusterScopedNamespace { kind: String, namespace: String },
    #[error("{kind} has fallback api bases but does not check the preferred version")]
    FallbackWithoutVersionCheck { kind: String },
    #[error("{kind} body must be a JSON object")]
    ExpectedObject { kind: String },
}

impl ApiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Request(err) => err.status(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }
}

/// The api group/version an endpoint talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVersion {
    pub api_prefix: String,
    pub api_group: String,
    pub api_version: String,
    pub resource: String,
}

impl ResolvedVersion {
    fn declared(path: &ApiPath) -> Self {
        Self {
            api_prefix: path.api_prefix.clone(),
            api_group: path.api_group.clone(),
            api_version: path.api_version.clone(),
            resource: path.resource.clone(),
        }
    }

    pub fn api_version_with_group(&self) -> String {
        path::version_with_group(&self.api_group, &self.api_version)
    }

    pub fn api_base(&self) -> String {
        seq([
            self.api_prefix.as_str(),
            self.api_group.as_str(),
            self.api_version.as_str(),
            self.resource.as_str(),
        ])
        .filter(|part| !part.is_empty())
        .join("/")
    }
}

/// The type-independent state of a resource client: where its kind lives and
/// which version was negotiated.
pub struct ApiEndpoint {
    kind: String,
    namespaced: bool,
    primary: ApiPath,
    fallbacks: Vec<ApiPath>,
    check_preferred_version: bool,
    resolved: OnceCell<ResolvedVersion>,
    resource_versions: Mutex<HashMap<String, String>>,
    json: Arc<KubeJsonApi>,
    registry: Weak<ApiRegistry>,
    watch_ids: AtomicU64,
}

impl fmt::Debug for ApiEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiEndpoint")
            .field("kind", &self.kind)
            .field("api_base", &self.api_base())
            .finish()
    }
}

impl ApiEndpoint {
    fn new(
        json: Arc<KubeJsonApi>,
        descriptor: ResourceDescriptor,
        registry: Weak<ApiRegistry>,
    ) -> Result<Self, ApiError> {
        if !descriptor.fallback_api_bases.is_empty() && !descriptor.check_preferred_version {
            return Err(ApiError::FallbackWithoutVersionCheck {
                kind: descriptor.kind,
            });
        }
        let primary = ApiPath::parse(&descriptor.api_base)?;
        let fallbacks = descriptor
            .fallback_api_bases
            .iter()
            .map(|api_base| ApiPath::parse(api_base))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            kind: descriptor.kind,
            namespaced: descriptor.namespaced,
            primary,
            fallbacks,
            check_preferred_version: descriptor.check_preferred_version,
            resolved: OnceCell::new(),
            resource_versions: Mutex::default(),
            json,
            registry,
            watch_ids: AtomicU64::new(0),
        })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is_namespaced(&self) -> bool {
        self.namespaced
    }

    pub fn json(&self) -> &KubeJsonApi {
        &self.json
    }

    /// The negotiated version, or the primary api base's until negotiation ran.
    pub fn version(&self) -> ResolvedVersion {
        self.resolved
            .get()
            .cloned()
            .unwrap_or_else(|| ResolvedVersion::declared(&self.primary))
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.initialized()
    }

    pub fn api_base(&self) -> String {
        self.version().api_base()
    }

    pub fn api_version_with_group(&self) -> String {
        self.version().api_version_with_group()
    }

    /// URL of one object, or of the collection when `name` is `None`.
    pub fn url(&self, name: Option<&str>, namespace: Option<&str>) -> String {
        let namespace = self.namespaced.then(|| namespace_or_default(namespace));
        self.build_url(namespace, name)
    }

    /// Collection URL. `None` lists across all namespaces.
    pub(crate) fn collection_path(&self, namespace: Option<&str>) -> String {
        let namespace = namespace.filter(|_| self.namespaced);
        self.build_url(namespace, None)
    }

    fn build_url(&self, namespace: Option<&str>, name: Option<&str>) -> String {
        let version = self.version();
        api_url(
            &version.api_prefix,
            &version.api_version_with_group(),
            namespace,
            &version.resource,
            name,
        )
    }

    pub(crate) fn next_watch_id(&self) -> String {
        let n = self.watch_ids.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{n}", self.kind.to_lowercase())
    }

    pub(crate) fn listed_resource_version(&self, namespace: &str) -> Option<String> {
        self.resource_versions.lock().get(namespace).cloned()
    }

    fn record_resource_version(&self, namespace: &str, resource_version: &str) {
        self.resource_versions
            .lock()
            .insert(namespace.to_owned(), resource_version.to_owned());
    }

    /// Runs version negotiation once, if this kind asks for it.
    pub async fn ensure_resolved(self: &Arc<Self>) -> ResolvedVersion {
        if !self.check_preferred_version {
            return self.version();
        }
        self.resolved
            .get_or_init(|| self.negotiate())
            .await
            .clone()
    }

    async fn negotiate(self: &Arc<Self>) -> ResolvedVersion {
        let candidates: Vec<&ApiPath> = std::iter::once(&self.primary)
            .chain(&self.fallbacks)
            .collect();

        for candidate in &candidates {
            if !self.serves_resource(candidate).await {
                continue;
            }

            let api_version = self
                .preferred_version(candidate)
                .await
                .unwrap_or_else(|| candidate.api_version.clone());
            let resolved = ResolvedVersion {
                api_version,
                ..ResolvedVersion::declared(candidate)
            };
            info!(
                "[KUBE-API] {} resolved to {}",
                self.kind,
                resolved.api_version_with_group()
            );
            if let Some(registry) = self.registry.upgrade() {
                registry.reregister_api(Arc::clone(self), &self.api_base(), resolved.api_base());
            }
            return resolved;
        }

        let last = candidates.last().copied().unwrap_or(&self.primary);
        warn!(
            "[KUBE-API] no api serves {}, keeping {}",
            self.kind,
            last.api_base()
        );
        ResolvedVersion::declared(last)
    }

    async fn serves_resource(&self, candidate: &ApiPath) -> bool {
        let path = format!(
            "{}/{}",
            candidate.api_prefix,
            candidate.api_version_with_group()
        );
        let body = match self.json.get(&path, RequestInit::new()).await {
            Ok(body) => body,
            Err(err) => {
                debug!("[KUBE-API] skipping {path} for {}: {err}", self.kind);
                return false;
            }
        };
        body.into_json()
            .and_then(|value| serde_json::from_value::<APIResourceList>(value).ok())
            .is_some_and(|list| {
                list.resources
                    .iter()
                    .any(|resource| resource.name == candidate.resource)
            })
    }

    async fn preferred_version(&self, candidate: &ApiPath) -> Option<String> {
        let path = seq([candidate.api_prefix.as_str(), candidate.api_group.as_str()])
            .filter(|part| !part.is_empty())
            .join("/");
        match self.json.get(&path, RequestInit::new()).await {
            Ok(body) => body
                .into_json()
                .and_then(|value| serde_json::from_value::<APIGroup>(value).ok())
                .and_then(|group| group.preferred_version)
                .map(|preferred| preferred.version),
            Err(err) => {
                debug!("[KUBE-API] no group metadata at {path}: {err}");
                None
            }
        }
    }
}

/// CRUD and watch for one kind, decoding objects as `K`.
pub struct KubeApi<K = KubeObject> {
    endpoint: Arc<ApiEndpoint>,
    construct: Constructor<K>,
}

impl<K> Clone for KubeApi<K> {
    fn clone(&self) -> Self {
        Self {
            endpoint: Arc::clone(&self.endpoint),
            construct: self.construct,
        }
    }
}

impl<K> fmt::Debug for KubeApi<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KubeApi").field(&self.endpoint).finish()
    }
}

fn deserialize<K: DeserializeOwned>(value: Value) -> serde_json::Result<K> {
    serde_json::from_value(value)
}

impl<K: DeserializeOwned> KubeApi<K> {
    /// An unregistered client decoding objects with `serde`.
    pub fn new(json: Arc<KubeJsonApi>, descriptor: ResourceDescriptor) -> Result<Self, ApiError> {
        Self::with_constructor(json, descriptor, deserialize::<K>)
    }

    /// A client that registers itself in `registry`, now and again once its
    /// version is negotiated.
    pub fn registered(
        json: Arc<KubeJsonApi>,
        descriptor: ResourceDescriptor,
        registry: &Arc<ApiRegistry>,
    ) -> Result<Self, ApiError> {
        Self::registered_with_constructor(json, descriptor, registry, deserialize::<K>)
    }
}

impl<K> KubeApi<K> {
    pub fn with_constructor(
        json: Arc<KubeJsonApi>,
        descriptor: ResourceDescriptor,
        construct: Constructor<K>,
    ) -> Result<Self, ApiError> {
        let endpoint = ApiEndpoint::new(json, descriptor, Weak::new())?;
        Ok(Self {
            endpoint: Arc::new(endpoint),
            construct,
        })
    }

    pub fn registered_with_constructor(
        json: Arc<KubeJsonApi>,
        descriptor: ResourceDescriptor,
        registry: &Arc<ApiRegistry>,
        construct: Constructor<K>,
    ) -> Result<Self, ApiError> {
        let endpoint = Arc::new(ApiEndpoint::new(
            json,
            descriptor,
            Arc::downgrade(registry),
        )?);
        registry.register_api(Arc::clone(&endpoint));
        Ok(Self {
            endpoint,
            construct,
        })
    }

    pub fn endpoint(&self) -> &Arc<ApiEndpoint> {
        &self.endpoint
    }

    pub fn kind(&self) -> &str {
        self.endpoint.kind()
    }

    pub fn url(&self, name: Option<&str>, namespace: Option<&str>) -> String {
        self.endpoint.url(name, namespace)
    }

    fn construct(&self, value: Value) -> Result<K, ApiError> {
        (self.construct)(value).map_err(|source| ApiError::Decode {
            kind: self.endpoint.kind.clone(),
            source,
        })
    }

    fn object_from(&self, body: ResponseBody) -> Result<Option<K>, ApiError> {
        match body.into_json() {
            Some(value) if is_object_data(&value) => self.construct(value).map(Some),
            _ => Ok(None),
        }
    }

    /// `None` when the server answered without an object.
    pub async fn get(&self, name: &str, namespace: Option<&str>) -> Result<Option<K>, ApiError> {
        self.endpoint.ensure_resolved().await;
        let url = self.url(Some(name), namespace);
        let body = self.endpoint.json.get(&url, RequestInit::new()).await?;
        self.object_from(body)
    }

    /// Lists one namespace, or every namespace for `None`.
    pub async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, ApiError> {
        self.endpoint.ensure_resolved().await;
        let namespace = namespace.filter(|namespace| !namespace.is_empty());
        let url = self.endpoint.collection_path(namespace);
        let body = self.endpoint.json.get(&url, RequestInit::new()).await?;
        let Some(Value::Object(mut list)) = body.into_json() else {
            return Ok(Vec::new());
        };

        if let Some(resource_version) = list
            .get("metadata")
            .and_then(|metadata| metadata.get("resourceVersion"))
            .and_then(Value::as_str)
        {
            self.endpoint
                .record_resource_version(namespace.unwrap_or_default(), resource_version);
        }

        // Items come without their own apiVersion/kind.
        let api_version = list.get("apiVersion").cloned();
        let kind = list
            .get("kind")
            .and_then(Value::as_str)
            .map(|kind| Value::from(kind.strip_suffix("List").unwrap_or(kind)));
        let items = match list.remove("items") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };
        items
            .into_iter()
            .map(|mut item| {
                if let Value::Object(object) = &mut item {
                    for (key, value) in [("apiVersion", &api_version), ("kind", &kind)] {
                        if let Some(value) = value {
                            object.entry(key).or_insert_with(|| value.clone());
                        }
                    }
                }
                self.construct(item)
            })
            .collect()
    }

    pub async fn create(
        &self,
        name: &str,
        namespace: Option<&str>,
        data: Value,
    ) -> Result<Option<K>, ApiError> {
        self.endpoint.ensure_resolved().await;
        let version = self.endpoint.version();
        let mut body = self.with_metadata(data, name, namespace)?;
        body.insert("apiVersion".into(), version.api_version_with_group().into());
        body.insert("kind".into(), self.endpoint.kind.clone().into());

        let url = self.url(None, namespace);
        let response = self
            .endpoint
            .json
            .post(&url, RequestInit::new().json(Value::Object(body)))
            .await?;
        self.object_from(response)
    }

    pub async fn update(
        &self,
        name: &str,
        namespace: Option<&str>,
        data: Value,
    ) -> Result<Option<K>, ApiError> {
        self.endpoint.ensure_resolved().await;
        let body = self.with_metadata(data, name, namespace)?;
        let url = self.url(Some(name), namespace);
        let response = self
            .endpoint
            .json
            .put(&url, RequestInit::new().json(Value::Object(body)))
            .await?;
        self.object_from(response)
    }

    pub async fn patch(
        &self,
        name: &str,
        namespace: Option<&str>,
        patch: &Patch,
    ) -> Result<Option<K>, ApiError> {
        self.endpoint.ensure_resolved().await;
        let url = self.url(Some(name), namespace);
        let init = RequestInit::new()
            .json(patch.to_body())
            .content_type(patch.strategy().content_type());
        let response = self.endpoint.json.patch(&url, init).await?;
        self.object_from(response)
    }

    /// Deletes in the background; dependents are collected by the server.
    pub async fn delete(&self, name: &str, namespace: Option<&str>) -> Result<Option<K>, ApiError> {
        if let Some(namespace) = namespace.filter(|namespace| !namespace.is_empty()) {
            if !self.endpoint.namespaced {
                return Err(ApiError::ClusterScopedNamespace {
                    kind: self.endpoint.kind.clone(),
                    namespace: namespace.to_owned(),
                });
            }
        }

        self.endpoint.ensure_resolved().await;
        let url = self.url(Some(name), namespace);
        let init = RequestInit::new().query("propagationPolicy", "Background");
        let response = self.endpoint.json.del(&url, init).await?;
        self.object_from(response)
    }

    /// Starts a watch on a spawned task; must be called within a Tokio runtime.
    pub fn watch<F>(&self, options: WatchOptions, callback: F) -> WatchHandle
    where
        K: Send + 'static,
        F: FnMut(Result<WatchEvent<K>, WatchError>) + Send + 'static,
    {
        watch::spawn(Arc::clone(&self.endpoint), self.construct, options, callback)
    }

    fn with_metadata(
        &self,
        data: Value,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Map<String, Value>, ApiError> {
        let mut body = match data {
            Value::Object(body) => body,
            Value::Null => Map::new(),
            _ => {
                return Err(ApiError::ExpectedObject {
                    kind: self.endpoint.kind.clone(),
                })
            }
        };
        let metadata = body
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if !metadata.is_object() {
            *metadata = Value::Object(Map::new());
        }
        if let Value::Object(metadata) = metadata {
            metadata.insert("name".into(), name.into());
            if self.endpoint.namespaced {
                metadata.insert("namespace".into(), namespace_or_default(namespace).into());
            }
        }
        Ok(body)
    }
}
