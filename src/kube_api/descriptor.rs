/// Static description of one resource kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub kind: String,
    pub namespaced: bool,
    /// Collection path of the preferred api, e.g. `/apis/apps/v1/deployments`.
    pub api_base: String,
    /// Tried in order after `api_base` during version negotiation.
    pub fallback_api_bases: Vec<String>,
    pub check_preferred_version: bool,
}

impl ResourceDescriptor {
    pub fn new(kind: impl Into<String>, namespaced: bool, api_base: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespaced,
            api_base: api_base.into(),
            fallback_api_bases: Vec::new(),
            check_preferred_version: false,
        }
    }

    pub fn with_fallback_api_bases<I, S>(mut self, api_bases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallback_api_bases = api_bases.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_preferred_version_check(mut self) -> Self {
        self.check_preferred_version = true;
        self
    }
}

struct Builtin {
    kind: &'static str,
    namespaced: bool,
    api_base: &'static str,
    fallbacks: &'static [&'static str],
}

const fn namespaced(kind: &'static str, api_base: &'static str) -> Builtin {
    Builtin {
        kind,
        namespaced: true,
        api_base,
        fallbacks: &[],
    }
}

const fn cluster(kind: &'static str, api_base: &'static str) -> Builtin {
    Builtin {
        kind,
        namespaced: false,
        api_base,
        fallbacks: &[],
    }
}

static BUILTINS: &[Builtin] = &[
    cluster("Namespace", "/api/v1/namespaces"),
    cluster("Node", "/api/v1/nodes"),
    namespaced("Pod", "/api/v1/pods"),
    namespaced("Service", "/api/v1/services"),
    namespaced("ConfigMap", "/api/v1/configmaps"),
    namespaced("Secret", "/api/v1/secrets"),
    namespaced("Deployment", "/apis/apps/v1/deployments"),
    namespaced("Job", "/apis/batch/v1/jobs"),
    Builtin {
        fallbacks: &["/apis/batch/v1beta1/cronjobs"],
        ..namespaced("CronJob", "/apis/batch/v1/cronjobs")
    },
    Builtin {
        fallbacks: &["/apis/extensions/v1beta1/ingresses"],
        ..namespaced("Ingress", "/apis/networking.k8s.io/v1/ingresses")
    },
    cluster("StorageClass", "/apis/storage.k8s.io/v1/storageclasses"),
];

impl Builtin {
    fn descriptor(&self) -> ResourceDescriptor {
        let descriptor = ResourceDescriptor::new(self.kind, self.namespaced, self.api_base);
        if self.fallbacks.is_empty() {
            descriptor
        } else {
            descriptor
                .with_fallback_api_bases(self.fallbacks.iter().copied())
                .with_preferred_version_check()
        }
    }
}

/// The descriptor of a well-known kind.
pub fn builtin(kind: &str) -> Option<ResourceDescriptor> {
    BUILTINS
        .iter()
        .find(|builtin| builtin.kind == kind)
        .map(Builtin::descriptor)
}

pub fn builtins() -> impl Iterator<Item = ResourceDescriptor> {
    BUILTINS.iter().map(Builtin::descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_with_fallbacks_check_preferred_version() {
        let cron_job = builtin("CronJob").unwrap();
        assert!(cron_job.namespaced);
        assert!(cron_job.check_preferred_version);
        assert_eq!(cron_job.fallback_api_bases, vec!["/apis/batch/v1beta1/cronjobs"]);

        let node = builtin("Node").unwrap();
        assert!(!node.namespaced);
        assert!(!node.check_preferred_version);
        assert!(node.fallback_api_bases.is_empty());
    }

    #[test]
    fn unknown_kinds() {
        assert_eq!(builtin("Widget"), None);
        assert!(builtins().any(|descriptor| descriptor.kind == "StorageClass"));
    }
}
