//! Lookup tasks for pre-existing shared objects.
//!
//! These never create, update or delete anything; they resolve a display
//! name to a reference. A missing shared object is fatal.

use async_trait::async_trait;
use tracing::debug;

use super::{EnsurerContext, Outcome, Task, malformed};
use crate::catalog::{
    Api, EdgeCluster, IpAddressPool, Pagination, PolicyObject, Tier0, TransportZone, paths,
};
use crate::error::{ReconcileError, Result};
use crate::spec::InfraSpec;
use crate::state::{InfraState, Reference};

/// The shared objects the pipeline builds on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedObject {
    Tier0Gateway,
    EdgeCluster,
    TransportZone,
    SnatIpPool,
}

impl SharedObject {
    fn label(self) -> &'static str {
        match self {
            SharedObject::Tier0Gateway => "tier-0 gateway lookup",
            SharedObject::EdgeCluster => "edge cluster lookup",
            SharedObject::TransportZone => "transport zone lookup",
            SharedObject::SnatIpPool => "SNAT IP pool lookup",
        }
    }

    fn name(self, spec: &InfraSpec) -> &str {
        match self {
            SharedObject::Tier0Gateway => &spec.tier0_gateway_name,
            SharedObject::EdgeCluster => &spec.edge_cluster_name,
            SharedObject::TransportZone => &spec.transport_zone_name,
            SharedObject::SnatIpPool => &spec.snat_ip_pool_name,
        }
    }

    fn slot(self, state: &InfraState) -> &Option<Reference> {
        match self {
            SharedObject::Tier0Gateway => &state.tier0_gateway_ref,
            SharedObject::EdgeCluster => &state.edge_cluster_ref,
            SharedObject::TransportZone => &state.transport_zone_ref,
            SharedObject::SnatIpPool => &state.snat_ip_pool_ref,
        }
    }

    fn slot_mut(self, state: &mut InfraState) -> &mut Option<Reference> {
        match self {
            SharedObject::Tier0Gateway => &mut state.tier0_gateway_ref,
            SharedObject::EdgeCluster => &mut state.edge_cluster_ref,
            SharedObject::TransportZone => &mut state.transport_zone_ref,
            SharedObject::SnatIpPool => &mut state.snat_ip_pool_ref,
        }
    }
}

/// Resolves one shared object by exact display name.
pub struct LookupTask {
    object: SharedObject,
}

impl LookupTask {
    pub fn new(object: SharedObject) -> Self {
        Self { object }
    }

    pub fn object(&self) -> SharedObject {
        self.object
    }
}

/// Page through a collection until an item with the exact display name
/// turns up or the listing is exhausted.
async fn find_by_name<T: PolicyObject>(
    api: &Api<'_, T>,
    name: &str,
    paginated: bool,
) -> Result<Option<T>> {
    let mut pages = Pagination::default();
    let mut cursor: Option<String> = None;
    loop {
        let page = api
            .list(cursor.as_deref())
            .await
            .map_err(ReconcileError::listing)?;

        let next = pages.advance(&page);
        if let Some(item) = page
            .results
            .into_iter()
            .find(|item| item.display_name() == Some(name))
        {
            return Ok(Some(item));
        }
        if !paginated {
            return Ok(None);
        }

        debug!(
            collection = api.collection(),
            listed = pages.listed(),
            total = ?pages.total(),
            "Searched page"
        );
        match next {
            Some(c) => cursor = Some(c),
            None => return Ok(None),
        }
    }
}

async fn find_reference<T: PolicyObject>(
    api: &Api<'_, T>,
    name: &str,
    paginated: bool,
) -> Result<Option<Reference>> {
    find_by_name(api, name, paginated)
        .await?
        .map(|item| reference_of(&item, name))
        .transpose()
}

fn reference_of<T: PolicyObject>(item: &T, name: &str) -> Result<Reference> {
    item.reference().ok_or_else(|| malformed(T::KIND, name))
}

#[async_trait]
impl Task for LookupTask {
    fn label(&self) -> &'static str {
        self.object.label()
    }

    fn name_to_log<'a>(&self, spec: &'a InfraSpec) -> Option<&'a str> {
        Some(self.object.name(spec))
    }

    fn reference(&self, state: &InfraState) -> Option<Reference> {
        self.object.slot(state).clone()
    }

    async fn ensure(
        &self,
        ctx: &EnsurerContext,
        spec: &InfraSpec,
        state: &mut InfraState,
    ) -> Result<Outcome> {
        let name = self.object.name(spec);
        let catalog = ctx.catalog();
        // Edge clusters and transport zones are scoped to the default
        // enforcement point and come back in a single listing.
        let found = match self.object {
            SharedObject::Tier0Gateway => {
                find_reference(&Api::<Tier0>::new(catalog, paths::TIER0S), name, true).await?
            }
            SharedObject::EdgeCluster => {
                let api = Api::<EdgeCluster>::new(catalog, paths::edge_clusters());
                find_reference(&api, name, false).await?
            }
            SharedObject::TransportZone => {
                let api = Api::<TransportZone>::new(catalog, paths::transport_zones());
                match find_by_name(&api, name, false).await? {
                    Some(tz) => {
                        debug!(object = name, tz_type = ?tz.tz_type, "Found transport zone");
                        Some(reference_of(&tz, name)?)
                    }
                    None => None,
                }
            }
            SharedObject::SnatIpPool => {
                find_reference(&Api::<IpAddressPool>::new(catalog, paths::IP_POOLS), name, true)
                    .await?
            }
        }
        .ok_or_else(|| ReconcileError::NotFound(name.to_string()))?;

        let slot = self.object.slot_mut(state);
        if slot.as_ref() == Some(&found) {
            return Ok(Outcome::Unchanged);
        }
        *slot = Some(found);
        Ok(Outcome::Found)
    }
}
