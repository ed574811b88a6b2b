use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use kube_client::config::{KubeconfigError, Kubeconfig};
use log::warn;
use serde::{Deserialize, Serialize};

/// A cluster the console can connect to, found in a kubeconfig.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntity {
    pub metadata: EntityMetadata,
    pub spec: ClusterSpec,
    pub status: ClusterStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMetadata {
    /// Unique across the merged view.
    pub uid: String,
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub kubeconfig_path: PathBuf,
    pub kubeconfig_context: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterPhase {
    Connected,
    #[default]
    Disconnected,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub phase: ClusterPhase,
}

impl CatalogEntity {
    pub fn cluster(kubeconfig_path: &Path, context: &str) -> Self {
        let labels = BTreeMap::from([("file".to_owned(), kubeconfig_path.display().to_string())]);
        Self {
            metadata: EntityMetadata {
                uid: format!("{}:{context}", kubeconfig_path.display()),
                name: context.to_owned(),
                source: "local".to_owned(),
                labels,
            },
            spec: ClusterSpec {
                kubeconfig_path: kubeconfig_path.to_owned(),
                kubeconfig_context: context.to_owned(),
            },
            status: ClusterStatus::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.metadata.uid
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("failed to read kubeconfig {}: {source}", .path.display())]
    Kubeconfig {
        path: PathBuf,
        #[source]
        source: KubeconfigError,
    },
    #[error("failed to inspect {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One entity per context whose cluster and user both exist in the file.
pub fn entities_from_kubeconfig(path: &Path, kubeconfig: &Kubeconfig) -> Vec<CatalogEntity> {
    kubeconfig
        .contexts
        .iter()
        .filter_map(|named| {
            let Some(context) = named.context.as_ref() else {
                warn!("[KUBECONFIG-SYNC]: context {} in {} is empty", named.name, path.display());
                return None;
            };
            let has_cluster = kubeconfig
                .clusters
                .iter()
                .any(|cluster| cluster.name == context.cluster);
            let has_user = kubeconfig
                .auth_infos
                .iter()
                .any(|user| user.name == context.user);
            if !(has_cluster && has_user) {
                warn!(
                    "[KUBECONFIG-SYNC]: skipping context {} in {}: missing cluster or user",
                    named.name,
                    path.display()
                );
                return None;
            }
            Some(CatalogEntity::cluster(path, &named.name))
        })
        .collect()
}

pub fn read_kubeconfig_entities(path: &Path) -> Result<Vec<CatalogEntity>, SyncError> {
    let kubeconfig = Kubeconfig::read_from(path).map_err(|source| SyncError::Kubeconfig {
        path: path.to_owned(),
        source,
    })?;
    Ok(entities_from_kubeconfig(path, &kubeconfig))
}
