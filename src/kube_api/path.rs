use crate::seq::seq;

/// The pieces of a Kubernetes REST path such as
/// `/apis/apps/v1/namespaces/default/deployments/web`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApiPath {
    /// `/api` for the core group, `/apis` otherwise.
    pub api_prefix: String,
    /// Empty for the core group.
    pub api_group: String,
    pub api_version: String,
    pub namespace: Option<String>,
    /// The plural resource name.
    pub resource: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid api path: {0:?}")]
pub struct InvalidApiPath(pub String);

impl ApiPath {
    pub fn parse(path: &str) -> Result<Self, InvalidApiPath> {
        let invalid = || InvalidApiPath(path.to_owned());

        let without_query = path.split(['?', '#']).next().unwrap_or_default();
        let mut segments = without_query.split('/').filter(|segment| !segment.is_empty());
        let prefix = segments.next().ok_or_else(invalid)?;
        let parts: Vec<&str> = segments.collect();

        let mut namespace = None;
        let mut name = None;
        let (api_group, api_version, resource);

        if let Some(split) = parts.iter().position(|part| *part == "namespaces") {
            let (left, right) = (&parts[..split], &parts[split + 1..]);
            match right {
                [] => resource = "namespaces",
                [namespace_name] => {
                    resource = "namespaces";
                    name = Some(*namespace_name);
                }
                [ns, plural, rest @ ..] => {
                    namespace = Some(*ns);
                    resource = *plural;
                    name = rest.first().copied();
                }
            }
            let (version, group) = left.split_last().ok_or_else(invalid)?;
            api_version = *version;
            api_group = group.join("/");
        } else {
            match parts.as_slice() {
                [] => return Err(invalid()),
                [version] => {
                    api_group = String::new();
                    api_version = *version;
                    resource = "";
                }
                [version, plural] => {
                    api_group = String::new();
                    api_version = *version;
                    resource = *plural;
                }
                [group, version, plural, object] => {
                    api_group = group.to_string();
                    api_version = *version;
                    resource = *plural;
                    name = Some(*object);
                }
                // Three segments are ambiguous: `group/version/resource` or
                // `version/resource/name`. A dotted first segment or a
                // `v<digit>` second segment means the former.
                [first, second, rest @ ..] => {
                    if first.contains('.') || looks_like_version(second) {
                        api_group = first.to_string();
                        api_version = *second;
                        resource = rest.first().copied().unwrap_or_default();
                        name = rest.get(1).copied();
                    } else {
                        api_group = String::new();
                        api_version = *first;
                        resource = *second;
                        name = rest.first().copied();
                    }
                }
            }
        }

        Ok(Self {
            api_prefix: format!("/{prefix}"),
            api_group,
            api_version: api_version.to_owned(),
            namespace: namespace.map(str::to_owned),
            resource: resource.to_owned(),
            name: name.map(str::to_owned),
        })
    }

    /// `group/version`, or just `version` for the core group.
    pub fn api_version_with_group(&self) -> String {
        version_with_group(&self.api_group, &self.api_version)
    }

    /// The canonical collection path, without namespace or name.
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

fn looks_like_version(segment: &str) -> bool {
    let mut chars = segment.chars();
    chars.next() == Some('v') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

pub(crate) fn version_with_group(api_group: &str, api_version: &str) -> String {
    seq([api_group, api_version])
        .filter(|part| !part.is_empty())
        .join("/")
}

/// Builds `{prefix}/{group/version}[/namespaces/{ns}]/{resource}[/{name}]`.
pub fn api_url(
    api_prefix: &str,
    api_version_with_group: &str,
    namespace: Option<&str>,
    resource: &str,
    name: Option<&str>,
) -> String {
    let mut parts = vec![api_prefix, api_version_with_group];
    if let Some(namespace) = namespace.filter(|namespace| !namespace.is_empty()) {
        parts.extend(["namespaces", namespace]);
    }
    parts.push(resource);
    if let Some(name) = name.filter(|name| !name.is_empty()) {
        parts.push(name);
    }
    parts.join("/")
}
