//! Lookup tables from api base paths to resource clients and their stores.

use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;

use crate::{
    kube_api::{api_url, ApiEndpoint, ApiPath, KubeObject, KubeObjectRef},
    seq::seq,
};

/// A cache of objects fed by one api.
pub trait ObjectStore: Send + Sync {
    fn api(&self) -> Arc<ApiEndpoint>;
}

/// Addresses a registered api by its base path or by the endpoint itself.
#[derive(Debug, Clone, Copy)]
pub enum ApiSelector<'a> {
    Base(&'a str),
    Api(&'a Arc<ApiEndpoint>),
}

impl<'a> From<&'a str> for ApiSelector<'a> {
    fn from(api_base: &'a str) -> Self {
        Self::Base(api_base)
    }
}

impl<'a> From<&'a String> for ApiSelector<'a> {
    fn from(api_base: &'a String) -> Self {
        Self::Base(api_base)
    }
}

impl<'a> From<&'a Arc<ApiEndpoint>> for ApiSelector<'a> {
    fn from(api: &'a Arc<ApiEndpoint>) -> Self {
        Self::Api(api)
    }
}

/// Every api base maps to at most one api and at most one store. Entries keep
/// their registration order.
#[derive(Default)]
pub struct ApiRegistry {
    apis: RwLock<Vec<(String, Arc<ApiEndpoint>)>>,
    stores: RwLock<Vec<(String, Arc<dyn ObjectStore>)>>,
}

impl std::fmt::Debug for ApiRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let apis: Vec<String> = self.apis.read().iter().map(|(base, _)| base.clone()).collect();
        f.debug_struct("ApiRegistry").field("apis", &apis).finish()
    }
}

fn upsert<T>(entries: &mut Vec<(String, T)>, key: String, value: T) {
    match entries.iter_mut().find(|(existing, _)| *existing == key) {
        Some(entry) => entry.1 = value,
        None => entries.push((key, value)),
    }
}

impl ApiRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `api` under its current api base unless that base is taken.
    pub fn register_api(&self, api: Arc<ApiEndpoint>) {
        let api_base = api.api_base();
        let mut apis = self.apis.write();
        if apis.iter().any(|(existing, _)| *existing == api_base) {
            debug!("[API-MANAGER] {api_base} is already registered");
            return;
        }
        apis.push((api_base, api));
    }

    /// Registers `api` under `api_base` after it moved away from
    /// `previous_base`. The store bound to `previous_base` moves along when
    /// `previous_base` belonged to `api`; bindings under other bases stay.
    pub(crate) fn reregister_api(&self, api: Arc<ApiEndpoint>, previous_base: &str, api_base: String) {
        let mut apis = self.apis.write();
        if apis.iter().any(|(existing, _)| *existing == api_base) {
            debug!("[API-MANAGER] {api_base} is already registered");
            return;
        }

        let owned_previous = apis
            .iter()
            .any(|(existing, registered)| existing == previous_base && Arc::ptr_eq(registered, &api));
        if owned_previous && previous_base != api_base {
            let mut stores = self.stores.write();
            if let Some(index) = stores.iter().position(|(existing, _)| existing == previous_base) {
                let (_, store) = stores.remove(index);
                upsert(&mut stores, api_base.clone(), store);
            }
        }

        apis.push((api_base, api));
    }

    pub fn unregister_api<'a>(&self, selector: impl Into<ApiSelector<'a>>) {
        let mut apis = self.apis.write();
        match selector.into() {
            ApiSelector::Base(api_base) => apis.retain(|(existing, _)| existing != api_base),
            ApiSelector::Api(api) => apis.retain(|(_, existing)| !Arc::ptr_eq(existing, api)),
        }
    }

    /// Binds `store` to the base of its own api.
    pub fn register_store(&self, store: Arc<dyn ObjectStore>) {
        let api = store.api();
        self.register_store_for(store, &[api]);
    }

    /// Binds `store` to the base of each of `apis`.
    pub fn register_store_for(&self, store: Arc<dyn ObjectStore>, apis: &[Arc<ApiEndpoint>]) {
        let mut stores = self.stores.write();
        for api in apis {
            upsert(&mut stores, api.api_base(), Arc::clone(&store));
        }
    }

    /// Exact lookup, then lookup by the canonical base of `path`.
    pub fn get_api(&self, path: &str) -> Option<Arc<ApiEndpoint>> {
        let apis = self.apis.read();
        let exact = |key: &str| {
            apis.iter()
                .find(|(api_base, _)| api_base == key)
                .map(|(_, api)| Arc::clone(api))
        };
        exact(path).or_else(|| {
            let api_base = ApiPath::parse(path).ok()?.api_base();
            exact(&api_base)
        })
    }

    pub fn find_api(&self, predicate: impl Fn(&ApiEndpoint) -> bool) -> Option<Arc<ApiEndpoint>> {
        seq(self.apis.read().iter())
            .find(|(_, api)| predicate(&**api))
            .map(|(_, api)| Arc::clone(api))
    }

    pub fn get_api_by_kind(&self, kind: &str, api_version_with_group: &str) -> Option<Arc<ApiEndpoint>> {
        self.find_api(|api| api.kind() == kind && api.api_version_with_group() == api_version_with_group)
    }

    pub fn apis(&self) -> Vec<Arc<ApiEndpoint>> {
        self.apis.read().iter().map(|(_, api)| Arc::clone(api)).collect()
    }

    pub fn get_store<'a>(&self, selector: impl Into<ApiSelector<'a>>) -> Option<Arc<dyn ObjectStore>> {
        let api = match selector.into() {
            ApiSelector::Base(path) => self.get_api(path)?,
            ApiSelector::Api(api) => Arc::clone(api),
        };
        let api_base = api.api_base();
        self.stores
            .read()
            .iter()
            .find(|(existing, _)| *existing == api_base)
            .map(|(_, store)| Arc::clone(store))
    }

    /// Best-effort URL for the object `reference` points at. Never fails; when
    /// no registered api matches, the URL is guessed from the kind.
    pub fn lookup_api_link(&self, reference: &KubeObjectRef, parent: Option<&KubeObject>) -> String {
        let api_version = reference
            .api_version
            .as_deref()
            .filter(|api_version| !api_version.is_empty())
            .unwrap_or("v1");
        let namespace = reference
            .namespace
            .as_deref()
            .or_else(|| parent.and_then(KubeObject::namespace));
        let name = Some(reference.name.as_str());

        if let Some(api) = self.get_api_by_kind(&reference.kind, api_version) {
            return api.url(name, namespace);
        }

        let resource = pluralize(&reference.kind);
        for api_prefix in ["/apis", "/api"] {
            let link = api_url(api_prefix, api_version, namespace, &resource, name);
            if self.get_api(&link).is_some() {
                return link;
            }
        }

        if let Some(api) = self.find_api(|api| api.kind() == reference.kind) {
            return api.url(name, namespace);
        }

        api_url("/apis", api_version, namespace, &resource, name)
    }
}

fn pluralize(kind: &str) -> String {
    let resource = kind.to_lowercase();
    if kind.ends_with('s') {
        resource + "es"
    } else {
        resource + "s"
    }
}
