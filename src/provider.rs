//! Provider abstraction for resource CRUD, and the bundled local provider.
//!
//! The reconciler only ever talks to a [`Provider`]. Real deployments
//! implement the trait against their cloud API; [`LocalProvider`] is a
//! deterministic in-process implementation used by the CLI and the test
//! suites so stacks can be converged without credentials.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::graph::{AttributeMap, ResourceKind};

/// Provider operations, used in error reports and invocation logs.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    /// Create a new resource.
    Create,
    /// Update an existing resource in place.
    Update,
    /// Destroy an existing resource.
    Destroy,
    /// Read a resource's current attributes.
    Describe,
}

impl Operation {
    /// Lower-case operation name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
            Self::Describe => "describe",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful create call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreatedResource {
    /// Provider-assigned identifier.
    pub id: String,
    /// Attributes observed after creation, including provider-computed
    /// values the caller never supplied.
    pub attributes: AttributeMap,
}

/// Result of an update call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UpdateOutcome {
    /// The update applied in place; attributes observed afterwards.
    Applied(AttributeMap),
    /// The change cannot apply in place; the resource must be replaced.
    RequiresReplacement,
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Minimal interface implemented by resource providers.
pub trait Provider {
    /// Provider specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates a resource of the given kind and returns its identifier and
    /// observed attributes.
    fn create<'a>(
        &'a self,
        kind: ResourceKind,
        attributes: &'a AttributeMap,
    ) -> ProviderFuture<'a, CreatedResource, Self::Error>;

    /// Applies attribute changes to an existing resource, or signals that
    /// the change requires replacement.
    fn update<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
        attributes: &'a AttributeMap,
    ) -> ProviderFuture<'a, UpdateOutcome, Self::Error>;

    /// Destroys an existing resource.
    fn destroy<'a>(&'a self, kind: ResourceKind, id: &'a str)
    -> ProviderFuture<'a, (), Self::Error>;

    /// Reads the resource's current attributes, or `None` when it no longer
    /// exists.
    fn describe<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<AttributeMap>, Self::Error>;
}

/// Errors raised by [`LocalProvider`].
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum LocalProviderError {
    /// The requested resource does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Kind of the missing resource.
        kind: ResourceKind,
        /// Identifier that failed to resolve.
        id: String,
    },
}

#[derive(Debug)]
struct LocalRecord {
    kind: ResourceKind,
    attributes: AttributeMap,
}

#[derive(Debug, Default)]
struct LocalResources {
    records: BTreeMap<String, LocalRecord>,
    instance_count: u32,
}

/// Deterministic in-process provider.
///
/// Identifiers follow the conventional per-kind prefixes (`sg-`, `key-`,
/// `i-`, `alarm-`) with a UUID suffix. Instance creation synthesises network
/// attributes and one volume id per requested additional volume. Updates that
/// touch a replacement-forcing attribute (the security group or key pair
/// name, key material, or the boot image) report
/// [`UpdateOutcome::RequiresReplacement`] instead of applying.
///
/// Resources live only for the process lifetime, so an update addressing an
/// id from a previous process upserts the attributes under that id instead
/// of failing; file-backed state stays usable across CLI invocations.
#[derive(Debug, Default)]
pub struct LocalProvider {
    inner: Mutex<LocalResources>,
}

impl LocalProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attributes whose change forces replacement, per kind.
    #[must_use]
    pub const fn replacement_forcing(kind: ResourceKind) -> &'static [&'static str] {
        match kind {
            ResourceKind::SecurityGroup => &["name"],
            ResourceKind::KeyPair => &["key_name", "public_key"],
            ResourceKind::Instance => &["image_id"],
            ResourceKind::Alarm => &[],
        }
    }

    /// Number of resources currently held.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.lock().records.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocalResources> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn id_for(kind: ResourceKind) -> String {
        let prefix = match kind {
            ResourceKind::SecurityGroup => "sg",
            ResourceKind::KeyPair => "key",
            ResourceKind::Instance => "i",
            ResourceKind::Alarm => "alarm",
        };
        format!("{prefix}-{}", Uuid::new_v4().simple())
    }

    fn observe_instance(attributes: &mut AttributeMap, serial: u32) {
        attributes.insert(String::from("private_ip"), json!(format!("10.0.0.{serial}")));
        let wants_public_ip = attributes
            .get("associate_public_ip")
            .is_some_and(|flag| flag == &json!(true));
        if wants_public_ip {
            attributes.insert(
                String::from("public_ip"),
                json!(format!("198.51.100.{serial}")),
            );
        }
        let volume_count = attributes
            .get("additional_volumes")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        let volume_ids: Vec<String> = (0..volume_count)
            .map(|_| format!("vol-{}", Uuid::new_v4().simple()))
            .collect();
        attributes.insert(String::from("additional_volume_ids"), json!(volume_ids));
    }
}

impl Provider for LocalProvider {
    type Error = LocalProviderError;

    fn create<'a>(
        &'a self,
        kind: ResourceKind,
        attributes: &'a AttributeMap,
    ) -> ProviderFuture<'a, CreatedResource, Self::Error> {
        Box::pin(async move {
            let mut resources = self.lock();
            let id = Self::id_for(kind);
            let mut observed = attributes.clone();
            observed.insert(String::from("id"), json!(id));
            if kind == ResourceKind::Instance {
                resources.instance_count += 1;
                let serial = resources.instance_count;
                Self::observe_instance(&mut observed, serial);
            }
            resources.records.insert(
                id.clone(),
                LocalRecord {
                    kind,
                    attributes: observed.clone(),
                },
            );
            Ok(CreatedResource {
                id,
                attributes: observed,
            })
        })
    }

    fn update<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
        attributes: &'a AttributeMap,
    ) -> ProviderFuture<'a, UpdateOutcome, Self::Error> {
        Box::pin(async move {
            let mut resources = self.lock();
            let known = resources
                .records
                .get(id)
                .filter(|record| record.kind == kind)
                .map(|record| record.attributes.clone());
            let Some(stored) = known else {
                let mut observed = attributes.clone();
                observed.insert(String::from("id"), json!(id));
                resources.records.insert(
                    id.to_owned(),
                    LocalRecord {
                        kind,
                        attributes: observed.clone(),
                    },
                );
                return Ok(UpdateOutcome::Applied(observed));
            };

            let forces_replacement = Self::replacement_forcing(kind).iter().any(|attr| {
                attributes
                    .get(*attr)
                    .is_some_and(|desired| stored.get(*attr) != Some(desired))
            });
            if forces_replacement {
                return Ok(UpdateOutcome::RequiresReplacement);
            }

            let mut merged = stored;
            merged.extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
            resources.records.insert(
                id.to_owned(),
                LocalRecord {
                    kind,
                    attributes: merged.clone(),
                },
            );
            Ok(UpdateOutcome::Applied(merged))
        })
    }

    fn destroy<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut resources = self.lock();
            let known = resources
                .records
                .get(id)
                .is_some_and(|record| record.kind == kind);
            if !known {
                return Err(LocalProviderError::NotFound {
                    kind,
                    id: id.to_owned(),
                });
            }
            resources.records.remove(id);
            Ok(())
        })
    }

    fn describe<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<AttributeMap>, Self::Error> {
        Box::pin(async move {
            let resources = self.lock();
            Ok(resources
                .records
                .get(id)
                .filter(|record| record.kind == kind)
                .map(|record| record.attributes.clone()))
        })
    }
}
