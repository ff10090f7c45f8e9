//! Desired infrastructure for one cluster.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

pub use crate::catalog::Tag;
use crate::error::{ReconcileError, Result};

/// Tag scope carrying the owning cluster's name.
pub const SCOPE_CLUSTER: &str = "edgeweave/cluster";
/// Tag scope marking objects as managed by this reconciler.
pub const SCOPE_MANAGED_BY: &str = "edgeweave/managed-by";
pub const MANAGED_BY: &str = "edgeweave-infra";

/// Description set on every object this reconciler creates.
pub const DESCRIPTION: &str = "created by edgeweave-infra";

/// Desired state input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfraSpec {
    pub cluster_name: String,
    /// Node network; the segment gateway is its first host address.
    pub workers_network: IpNet,
    pub tier0_gateway_name: String,
    pub edge_cluster_name: String,
    pub transport_zone_name: String,
    pub snat_ip_pool_name: String,
    /// Tags attached to every created object in addition to the ownership tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_tags: Vec<Tag>,
}

impl InfraSpec {
    /// Load and validate a JSON spec file.
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read_to_string(path).await.map_err(|e| {
            ReconcileError::InvalidSpec(format!("reading {}: {}", path.display(), e))
        })?;
        let spec: InfraSpec = serde_json::from_str(&data).map_err(|e| {
            ReconcileError::InvalidSpec(format!("parsing {}: {}", path.display(), e))
        })?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        let names = [
            ("cluster_name", &self.cluster_name),
            ("tier0_gateway_name", &self.tier0_gateway_name),
            ("edge_cluster_name", &self.edge_cluster_name),
            ("transport_zone_name", &self.transport_zone_name),
            ("snat_ip_pool_name", &self.snat_ip_pool_name),
        ];
        for (field, value) in names {
            if value.trim().is_empty() {
                return Err(ReconcileError::InvalidSpec(format!("{} is empty", field)));
            }
        }
        if let Some(tag) = self.extra_tags.iter().find(|t| t.scope.is_empty()) {
            return Err(ReconcileError::InvalidSpec(format!(
                "extra tag {:?} has an empty scope",
                tag.tag
            )));
        }
        self.gateway_address()?;
        Ok(())
    }

    /// Name used for gateways, locale services and NAT rules.
    pub fn full_cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Prefix shared by every segment display name of this cluster.
    pub fn segment_name_prefix(&self) -> String {
        format!("{}-", self.full_cluster_name())
    }

    /// Display name of the SNAT address allocation.
    pub fn snat_allocation_name(&self) -> String {
        format!("{}_SNAT", self.full_cluster_name())
    }

    /// Ownership and audit tags attached to every created object.
    pub fn create_tags(&self) -> Vec<Tag> {
        let mut tags = vec![
            Tag::new(SCOPE_CLUSTER, self.full_cluster_name()),
            Tag::new(SCOPE_MANAGED_BY, MANAGED_BY),
        ];
        tags.extend(self.extra_tags.iter().cloned());
        tags
    }

    /// First host of the workers network with its prefix length, e.g.
    /// `10.250.0.1/16`.
    pub fn gateway_address(&self) -> Result<String> {
        let net = self.workers_network.trunc();
        let host = match net {
            IpNet::V4(v4) if v4.prefix_len() < 31 => {
                IpAddr::V4(Ipv4Addr::from(u32::from(v4.network()) + 1))
            }
            IpNet::V6(v6) if v6.prefix_len() < 127 => {
                IpAddr::V6(Ipv6Addr::from(u128::from(v6.network()) + 1))
            }
            _ => {
                return Err(ReconcileError::InvalidSpec(format!(
                    "workers network {} has no room for a gateway address",
                    self.workers_network
                )));
            }
        };
        Ok(format!("{}/{}", host, net.prefix_len()))
    }
}
