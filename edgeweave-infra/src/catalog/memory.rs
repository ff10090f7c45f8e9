//! In-process catalog.
//!
//! Behaves like the policy API closely enough to drive the reconciler in
//! tests: cursor pagination with an optional total count, server-assigned
//! `path` and `_revision`, create-on-PATCH, and IP allocations that only show
//! a concrete address in realized state after a number of polls.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{
    ApiErrorPayload, AttributeVal, CatalogClient, CatalogError, ListResult, RealizedEntity,
};
use crate::state::Reference;

/// Operation kinds recorded in the call journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    List,
    Get,
    Patch,
    Update,
    Delete,
    Realized,
}

/// One recorded catalog call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub path: String,
}

struct Inner {
    /// Objects in insertion order.
    objects: Vec<(String, Value)>,
    page_size: usize,
    report_total: bool,
    calls: Vec<Call>,
    failures: Vec<(Op, String, CatalogError)>,
    next_address: u32,
    realize_after: u32,
    realized_state: String,
    addresses: HashMap<String, String>,
    polls: HashMap<String, u32>,
}

/// Thread-safe in-memory catalog.
pub struct MemoryCatalog {
    inner: Mutex<Inner>,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: Vec::new(),
                page_size: 1000,
                report_total: true,
                calls: Vec::new(),
                failures: Vec::new(),
                next_address: u32::from(Ipv4Addr::new(192, 0, 2, 10)),
                realize_after: 0,
                realized_state: RealizedEntity::STATE_REALIZED.to_string(),
                addresses: HashMap::new(),
                polls: HashMap::new(),
            }),
        }
    }

    /// Limit how many results a single list call returns.
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.lock().page_size = page_size.max(1);
        self
    }

    /// Leave `result_count` out of list responses.
    pub fn without_result_count(self) -> Self {
        self.lock().report_total = false;
        self
    }

    /// First address handed out to IP allocations.
    pub fn with_address_range_start(self, start: Ipv4Addr) -> Self {
        self.lock().next_address = u32::from(start);
        self
    }

    /// Number of realization polls that report nothing before the address
    /// appears.
    pub fn with_realize_after(self, polls: u32) -> Self {
        self.lock().realize_after = polls;
        self
    }

    /// State reported alongside the allocated address once it shows up.
    pub fn with_realized_state(self, state: &str) -> Self {
        self.lock().realized_state = state.to_string();
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a pre-existing object with just an identity.
    pub fn seed(&self, collection: &str, id: &str, display_name: &str) -> Reference {
        let path = format!("{}/{}", collection, id);
        self.insert(
            &path,
            json!({ "id": id, "path": path, "display_name": display_name }),
        );
        Reference::new(id, path)
    }

    /// Insert or replace an object verbatim (server fields are filled in).
    pub fn insert(&self, path: &str, value: Value) {
        let mut inner = self.lock();
        let value = stamp(path, value, 1);
        match inner.objects.iter_mut().find(|(p, _)| p == path) {
            Some(slot) => slot.1 = value,
            None => inner.objects.push((path.to_string(), value)),
        }
    }

    pub fn object(&self, path: &str) -> Option<Value> {
        self.lock()
            .objects
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, v)| v.clone())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.object(path).is_some()
    }

    /// Delete an object out-of-band, bypassing the journal.
    pub fn remove(&self, path: &str) -> bool {
        let mut inner = self.lock();
        let before = inner.objects.len();
        inner
            .objects
            .retain(|(p, _)| p != path && !p.starts_with(&format!("{}/", path)));
        inner.addresses.remove(path);
        inner.objects.len() != before
    }

    /// Overwrite one top-level field out-of-band (drift injection).
    pub fn set_field(&self, path: &str, field: &str, value: Value) -> bool {
        let mut inner = self.lock();
        match inner.objects.iter_mut().find(|(p, _)| p == path) {
            Some((_, Value::Object(obj))) => {
                obj.insert(field.to_string(), value);
                true
            }
            _ => false,
        }
    }

    /// Make the next call of `op` on exactly `path` fail with an API error.
    pub fn fail_next(&self, op: Op, path: &str, status: u16, message: &str) {
        self.lock().failures.push((
            op,
            path.to_string(),
            CatalogError::Api {
                status,
                payload: ApiErrorPayload::new(message),
            },
        ));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Number of calls of one kind.
    pub fn count(&self, op: Op) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    /// Calls that changed remote state (patch, update, delete).
    pub fn mutations(&self) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c.op, Op::Patch | Op::Update | Op::Delete))
            .cloned()
            .collect()
    }

    /// Successfully deleted paths, in call order.
    pub fn deleted_paths(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == Op::Delete)
            .map(|c| c.path.clone())
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Record the call and pop a matching injected failure, if any.
    fn enter(&self, inner: &mut Inner, op: Op, path: &str) -> Result<(), CatalogError> {
        if let Some(pos) = inner
            .failures
            .iter()
            .position(|(o, p, _)| *o == op && p == path)
        {
            let (_, _, err) = inner.failures.remove(pos);
            return Err(err);
        }
        if op != Op::Delete {
            inner.calls.push(Call {
                op,
                path: path.to_string(),
            });
        }
        Ok(())
    }
}

fn is_child(collection: &str, path: &str) -> bool {
    path.strip_prefix(collection)
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|id| !id.is_empty() && !id.contains('/'))
}

fn not_found(path: &str) -> CatalogError {
    CatalogError::NotFound {
        path: path.to_string(),
    }
}

/// Fill in the server-owned fields.
fn stamp(path: &str, value: Value, revision: u64) -> Value {
    let mut obj = match value {
        Value::Object(obj) => obj,
        _ => Map::new(),
    };
    let id = path.rsplit('/').next().unwrap_or_default();
    obj.insert("id".to_string(), Value::String(id.to_string()));
    obj.insert("path".to_string(), Value::String(path.to_string()));
    obj.insert("_revision".to_string(), json!(revision));
    Value::Object(obj)
}

fn revision(value: &Value) -> u64 {
    value.get("_revision").and_then(Value::as_u64).unwrap_or(0)
}

fn is_ip_allocation(path: &str) -> bool {
    path.rsplit_once('/')
        .is_some_and(|(collection, _)| collection.ends_with("/ip-allocations"))
}

#[async_trait]
impl CatalogClient for MemoryCatalog {
    async fn list(
        &self,
        collection: &str,
        cursor: Option<&str>,
    ) -> Result<ListResult<Value>, CatalogError> {
        let mut inner = self.lock();
        self.enter(&mut inner, Op::List, collection)?;

        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| CatalogError::Api {
                    status: 400,
                    payload: ApiErrorPayload::new(format!("invalid cursor {:?}", c)),
                })?,
            None => 0,
        };
        let all: Vec<Value> = inner
            .objects
            .iter()
            .filter(|(p, _)| is_child(collection, p))
            .map(|(_, v)| v.clone())
            .collect();
        let total = all.len();
        let end = offset.saturating_add(inner.page_size).min(total);
        let results = all.get(offset..end).map(<[Value]>::to_vec).unwrap_or_default();
        Ok(ListResult {
            results,
            cursor: (end < total).then(|| end.to_string()),
            result_count: inner.report_total.then_some(total as u64),
        })
    }

    async fn get(&self, path: &str) -> Result<Value, CatalogError> {
        let mut inner = self.lock();
        self.enter(&mut inner, Op::Get, path)?;
        inner
            .objects
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| not_found(path))
    }

    async fn patch(&self, path: &str, body: Value) -> Result<(), CatalogError> {
        let mut inner = self.lock();
        self.enter(&mut inner, Op::Patch, path)?;
        match inner.objects.iter_mut().find(|(p, _)| p == path) {
            Some((_, existing)) => {
                let rev = revision(existing) + 1;
                let mut merged = match existing.take() {
                    Value::Object(obj) => obj,
                    _ => Map::new(),
                };
                if let Value::Object(fields) = body {
                    merged.extend(fields);
                }
                *existing = stamp(path, Value::Object(merged), rev);
            }
            None => {
                let value = stamp(path, body, 1);
                inner.objects.push((path.to_string(), value));
            }
        }
        Ok(())
    }

    async fn update(&self, path: &str, body: Value) -> Result<Value, CatalogError> {
        let mut inner = self.lock();
        self.enter(&mut inner, Op::Update, path)?;
        let stored = match inner.objects.iter_mut().find(|(p, _)| p == path) {
            Some((_, existing)) => {
                let rev = revision(existing) + 1;
                *existing = stamp(path, body, rev);
                existing.clone()
            }
            None => {
                let value = stamp(path, body, 1);
                inner.objects.push((path.to_string(), value.clone()));
                value
            }
        };
        if is_ip_allocation(path) && !inner.addresses.contains_key(path) {
            let addr = Ipv4Addr::from(inner.next_address).to_string();
            inner.next_address += 1;
            inner.addresses.insert(path.to_string(), addr);
            inner.polls.insert(path.to_string(), 0);
        }
        Ok(stored)
    }

    async fn delete(&self, path: &str) -> Result<(), CatalogError> {
        let mut inner = self.lock();
        self.enter(&mut inner, Op::Delete, path)?;
        let before = inner.objects.len();
        inner.objects.retain(|(p, _)| p != path);
        if inner.objects.len() == before {
            return Err(not_found(path));
        }
        inner.addresses.remove(path);
        inner.calls.push(Call {
            op: Op::Delete,
            path: path.to_string(),
        });
        Ok(())
    }

    async fn realized_entities(
        &self,
        intent_path: &str,
    ) -> Result<Vec<RealizedEntity>, CatalogError> {
        let mut inner = self.lock();
        self.enter(&mut inner, Op::Realized, intent_path)?;
        if !inner.objects.iter().any(|(p, _)| p == intent_path) {
            return Err(not_found(intent_path));
        }
        let realize_after = inner.realize_after;
        let polls = inner.polls.entry(intent_path.to_string()).or_insert(0);
        *polls += 1;
        if *polls <= realize_after {
            return Ok(Vec::new());
        }
        let Some(addr) = inner.addresses.get(intent_path).cloned() else {
            return Ok(Vec::new());
        };
        Ok(vec![RealizedEntity {
            id: intent_path.rsplit('/').next().map(str::to_string),
            entity_type: Some("RealizedIpAllocation".to_string()),
            state: Some(inner.realized_state.clone()),
            extended_attributes: vec![AttributeVal {
                key: RealizedEntity::ALLOCATION_IP.to_string(),
                values: vec![addr],
            }],
        }])
    }
}
