//! Persisted convergence record.
//!
//! The state document maps every logical resource slot to the remote object
//! that backs it. A slot is `Some` iff the object is believed to exist
//! remotely. Each slot is written only by the task that owns it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Current state document format version.
pub const STATE_VERSION: u32 = 1;

/// Opaque remote identifier plus the policy path dependents point at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub id: String,
    pub path: String,
}

impl Reference {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }
}

/// Mutable convergence record for one cluster's infrastructure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfraState {
    pub version: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier0_gateway_ref: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_cluster_ref: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_zone_ref: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snat_ip_pool_ref: Option<Reference>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier1_gateway_ref: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale_service_ref: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_ref: Option<Reference>,
    /// Generated display name of the segment (`<cluster>-<suffix>`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snat_ip_address_alloc_ref: Option<Reference>,
    /// Realized SNAT address, without prefix length.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snat_ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snat_rule_ref: Option<Reference>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for InfraState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            tier0_gateway_ref: None,
            edge_cluster_ref: None,
            transport_zone_ref: None,
            snat_ip_pool_ref: None,
            tier1_gateway_ref: None,
            locale_service_ref: None,
            segment_ref: None,
            segment_name: None,
            snat_ip_address_alloc_ref: None,
            snat_ip_address: None,
            snat_rule_ref: None,
            updated_at: None,
        }
    }
}

impl InfraState {
    /// True if no slot holds anything.
    pub fn is_empty(&self) -> bool {
        self.tier0_gateway_ref.is_none()
            && self.edge_cluster_ref.is_none()
            && self.transport_zone_ref.is_none()
            && self.snat_ip_pool_ref.is_none()
            && !self.has_owned_objects()
    }

    /// True if any object this pipeline created is still referenced.
    pub fn has_owned_objects(&self) -> bool {
        self.tier1_gateway_ref.is_some()
            || self.locale_service_ref.is_some()
            || self.segment_ref.is_some()
            || self.segment_name.is_some()
            || self.snat_ip_address_alloc_ref.is_some()
            || self.snat_ip_address.is_some()
            || self.snat_rule_ref.is_some()
    }

    /// Drop the references to shared objects that were only looked up.
    pub fn release_shared(&mut self) {
        self.tier0_gateway_ref = None;
        self.edge_cluster_ref = None;
        self.transport_zone_ref = None;
        self.snat_ip_pool_ref = None;
    }

    /// Stamp the document with the current time.
    pub fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }

    pub fn to_json(&self) -> Result<String, StateError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self, StateError> {
        let state: InfraState = serde_json::from_str(data)?;
        if state.version > STATE_VERSION {
            return Err(StateError::UnsupportedVersion(state.version));
        }
        Ok(state)
    }
}

/// Errors raised by state stores.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("unsupported state version {0}")]
    UnsupportedVersion(u32),
}

/// Backing store for the state document.
///
/// The runner saves after every task that changed state, so a crash loses at
/// most one task's progress.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<InfraState, StateError>;
    async fn save(&self, state: &InfraState) -> Result<(), StateError>;
}

/// Stores the state document as pretty JSON in a single file.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_err(&self, source: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> Result<InfraState, StateError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => InfraState::from_json(&data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No state file yet, starting empty");
                Ok(InfraState::default())
            }
            Err(e) => Err(self.io_err(e)),
        }
    }

    async fn save(&self, state: &InfraState) -> Result<(), StateError> {
        let data = state.to_json()?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_err(e))?;
        }

        // Write-then-rename so a crash never leaves a truncated document.
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| self.io_err(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_err(e))?;
        debug!(path = %self.path.display(), "State saved");
        Ok(())
    }
}

/// Discards every save. Loads return an empty document.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

#[async_trait]
impl StateStore for NoopStore {
    async fn load(&self) -> Result<InfraState, StateError> {
        Ok(InfraState::default())
    }

    async fn save(&self, _state: &InfraState) -> Result<(), StateError> {
        Ok(())
    }
}
