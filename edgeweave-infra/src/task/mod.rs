//! Resource tasks.
//!
//! Each task owns one logical infrastructure object. It computes the desired
//! object from the [`InfraSpec`] and the upstream references already in state,
//! compares it against the catalog and converges it. Tasks hold no state of
//! their own; everything flows through [`InfraState`].
//!
//! Lookup tasks only resolve names of pre-existing shared objects. Tasks that
//! create objects additionally implement [`Recoverable`] and [`Deletable`].

pub mod lookup;
pub mod segment;
pub mod snat;
pub mod tier1;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::catalog::{CatalogClient, CatalogError, ListResult, ObjectSummary, Tag};
use crate::error::{ReconcileError, Result};
use crate::spec::InfraSpec;
use crate::state::{InfraState, Reference};

pub use lookup::{LookupTask, SharedObject};
pub use segment::SegmentTask;
pub use snat::{SnatIpAddressAllocationTask, SnatIpAddressRealizationTask, SnatRuleTask};
pub use tier1::{Tier1GatewayLocaleServiceTask, Tier1GatewayTask};

/// Default bound on waiting for an allocated address to be realized.
pub const DEFAULT_REALIZATION_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_REALIZATION_POLL_INTERVAL: Duration = Duration::from_secs(1);

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// What a task did to converge its object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A shared object was resolved, or a realized value was recorded.
    Found,
    Created,
    Updated,
    Unchanged,
    /// Teardown removed the object.
    Deleted,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Found => "found",
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Unchanged => "unchanged",
            Outcome::Deleted => "deleted",
        }
    }

    /// Whether the state document changed as a result.
    pub fn is_change(&self) -> bool {
        !matches!(self, Outcome::Unchanged)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call-time dependencies shared by all tasks of a run.
pub struct EnsurerContext {
    catalog: Arc<dyn CatalogClient>,
    rng: Mutex<Box<dyn RngCore + Send>>,
    realization_timeout: Duration,
    realization_poll_interval: Duration,
}

impl EnsurerContext {
    pub fn new(catalog: Arc<dyn CatalogClient>) -> Self {
        Self {
            catalog,
            rng: Mutex::new(Box::new(StdRng::from_entropy())),
            realization_timeout: DEFAULT_REALIZATION_TIMEOUT,
            realization_poll_interval: DEFAULT_REALIZATION_POLL_INTERVAL,
        }
    }

    /// Replace the generator used for IDs and name suffixes.
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Mutex::new(Box::new(rng));
        self
    }

    pub fn with_realization_timeout(mut self, timeout: Duration) -> Self {
        self.realization_timeout = timeout;
        self
    }

    pub fn with_realization_poll_interval(mut self, interval: Duration) -> Self {
        self.realization_poll_interval = interval;
        self
    }

    pub fn catalog(&self) -> &dyn CatalogClient {
        self.catalog.as_ref()
    }

    pub fn realization_timeout(&self) -> Duration {
        self.realization_timeout
    }

    pub fn realization_poll_interval(&self) -> Duration {
        self.realization_poll_interval
    }

    /// Random lowercase alphanumeric token.
    pub fn random_string(&self, len: usize) -> String {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        (0..len)
            .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
            .collect()
    }

    /// Client-chosen ID for idempotent creation, e.g. `segment-k3j9...`.
    pub fn generate_id(&self, kind: &str) -> String {
        format!("{}-{}", kind, self.random_string(16))
    }
}

/// Contract every resource task implements.
#[async_trait]
pub trait Task: Send + Sync {
    fn label(&self) -> &'static str;

    /// Name of the shared object a lookup resolves, for logging.
    fn name_to_log<'a>(&self, _spec: &'a InfraSpec) -> Option<&'a str> {
        None
    }

    /// The reference this task maintains.
    fn reference(&self, state: &InfraState) -> Option<Reference>;

    /// Converge the object. Calling twice with no remote change in between
    /// yields [`Outcome::Unchanged`] the second time.
    async fn ensure(
        &self,
        ctx: &EnsurerContext,
        spec: &InfraSpec,
        state: &mut InfraState,
    ) -> Result<Outcome>;

    fn recoverable(&self) -> Option<&dyn Recoverable> {
        None
    }

    fn deletable(&self) -> Option<&dyn Deletable> {
        None
    }
}

/// Tasks whose objects can be re-associated after losing their reference.
#[async_trait]
pub trait Recoverable: Task {
    /// One page of every object of this task's kind.
    async fn list_all(
        &self,
        ctx: &EnsurerContext,
        state: &InfraState,
        cursor: Option<&str>,
    ) -> Result<ListResult<ObjectSummary>>;

    /// Whether a listed display name is the one this task would create.
    fn matches(&self, spec: &InfraSpec, display_name: &str) -> bool;

    fn set_recovered_reference(
        &self,
        state: &mut InfraState,
        reference: Reference,
        name: Option<String>,
    );
}

/// Tasks that own their object and remove it on teardown.
#[async_trait]
pub trait Deletable: Task {
    /// Delete the object if referenced. Returns false when there was nothing
    /// to delete.
    async fn ensure_deleted(&self, ctx: &EnsurerContext, state: &mut InfraState) -> Result<bool>;
}

/// The full pipeline in dependency order.
pub fn standard_tasks() -> Vec<Box<dyn Task>> {
    vec![
        Box::new(LookupTask::new(SharedObject::Tier0Gateway)),
        Box::new(LookupTask::new(SharedObject::EdgeCluster)),
        Box::new(LookupTask::new(SharedObject::TransportZone)),
        Box::new(LookupTask::new(SharedObject::SnatIpPool)),
        Box::new(Tier1GatewayTask::new()),
        Box::new(Tier1GatewayLocaleServiceTask::new()),
        Box::new(SegmentTask::new()),
        Box::new(SnatIpAddressAllocationTask::new()),
        Box::new(SnatIpAddressRealizationTask::new()),
        Box::new(SnatRuleTask::new()),
    ]
}

/// Dereference an upstream slot.
pub(crate) fn require<'a>(
    slot: &'a Option<Reference>,
    what: &'static str,
) -> Result<&'a Reference> {
    slot.as_ref().ok_or(ReconcileError::MissingDependency(what))
}

/// Tag sets compare unordered, duplicates included.
pub fn equal_tags(a: &[Tag], b: &[Tag]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut counts: HashMap<&Tag, i32> = HashMap::new();
    for tag in a {
        *counts.entry(tag).or_default() += 1;
    }
    for tag in b {
        *counts.entry(tag).or_default() -= 1;
    }
    counts.values().all(|c| *c == 0)
}

/// Ordered lists compare element by element.
pub fn equal_strings(a: &[String], b: &[String]) -> bool {
    a == b
}

/// Missing optional field on the remote side counts as drift.
pub(crate) fn differs<T: PartialEq + ?Sized>(current: Option<&T>, desired: &T) -> bool {
    current != Some(desired)
}

/// Map a delete result: already gone counts as nothing deleted.
pub(crate) fn delete_tolerant(result: std::result::Result<(), CatalogError>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(ReconcileError::deleting(e)),
    }
}

/// Stored object lacks id or path.
pub(crate) fn malformed(kind: &str, name: &str) -> ReconcileError {
    ReconcileError::Reading(format!("{} {} has no id or path", kind, name))
}
