//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::graph::{AttributeMap, ResourceKind};
use crate::provider::{CreatedResource, Operation, Provider, ProviderFuture, UpdateOutcome};
use crate::state::{StackState, StateStore, StateStoreError};

/// Records a single invocation made through [`RecordingProvider`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecordedCall {
    /// Operation invoked.
    pub operation: Operation,
    /// Kind the operation targeted.
    pub kind: ResourceKind,
}

/// Errors raised by [`RecordingProvider`].
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ScriptedProviderError {
    /// A failure scripted via [`RecordingProvider::fail_on`].
    #[error("scripted {operation} failure for {kind}")]
    Scripted {
        /// Operation that was scripted to fail.
        operation: Operation,
        /// Kind the failure was scripted for.
        kind: ResourceKind,
    },
    /// The requested resource does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Kind of the missing resource.
        kind: ResourceKind,
        /// Identifier that failed to resolve.
        id: String,
    },
}

#[derive(Debug, Default)]
struct RecordingInner {
    counter: u32,
    calls: Vec<RecordedCall>,
    fail: BTreeSet<(ResourceKind, Operation)>,
    hang: BTreeSet<(ResourceKind, Operation)>,
    replace_on_update: BTreeSet<ResourceKind>,
    resources: BTreeMap<String, (ResourceKind, AttributeMap)>,
}

/// Scripted provider double that records every invocation.
///
/// Identifiers are deterministic (`sg-1`, `i-2`, …) so assertions stay
/// stable. Failures, hangs, and forced replacements are scripted per
/// kind/operation pair. Clones share the same underlying script and log.
#[derive(Clone, Debug, Default)]
pub struct RecordingProvider {
    inner: Arc<Mutex<RecordingInner>>,
}

impl RecordingProvider {
    /// Creates a provider with an empty script and log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts every matching call to fail.
    pub fn fail_on(&self, kind: ResourceKind, operation: Operation) {
        self.lock().fail.insert((kind, operation));
    }

    /// Scripts every matching call to never complete, for timeout tests.
    pub fn hang_on(&self, kind: ResourceKind, operation: Operation) {
        self.lock().hang.insert((kind, operation));
    }

    /// Scripts updates of the given kind to require replacement.
    pub fn replace_on_update(&self, kind: ResourceKind) {
        self.lock().replace_on_update.insert(kind);
    }

    /// Clears every scripted failure, hang, and forced replacement.
    pub fn clear_scripts(&self) {
        let mut inner = self.lock();
        inner.fail.clear();
        inner.hang.clear();
        inner.replace_on_update.clear();
    }

    /// Snapshot of every invocation recorded so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Operations recorded against one kind, in order.
    #[must_use]
    pub fn calls_for(&self, kind: ResourceKind) -> Vec<Operation> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.kind == kind)
            .map(|call| call.operation)
            .collect()
    }

    /// Total number of provider calls recorded.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Identifiers of the resources currently live in the double.
    #[must_use]
    pub fn live_ids(&self) -> Vec<String> {
        self.lock().resources.keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, RecordingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, kind: ResourceKind, operation: Operation) -> Outcome {
        let mut inner = self.lock();
        if inner.hang.contains(&(kind, operation)) {
            return Outcome::Hang;
        }
        inner.calls.push(RecordedCall { operation, kind });
        if inner.fail.contains(&(kind, operation)) {
            return Outcome::Fail;
        }
        Outcome::Proceed
    }

    fn next_id(inner: &mut RecordingInner, kind: ResourceKind) -> String {
        inner.counter += 1;
        let prefix = match kind {
            ResourceKind::SecurityGroup => "sg",
            ResourceKind::KeyPair => "key",
            ResourceKind::Instance => "i",
            ResourceKind::Alarm => "alarm",
        };
        format!("{prefix}-{}", inner.counter)
    }

    fn observe(kind: ResourceKind, serial: u32, attributes: &mut AttributeMap) {
        if kind != ResourceKind::Instance {
            return;
        }
        attributes.insert(String::from("private_ip"), json!(format!("10.0.0.{serial}")));
        if attributes
            .get("associate_public_ip")
            .is_some_and(|flag| flag == &json!(true))
        {
            attributes.insert(
                String::from("public_ip"),
                json!(format!("198.51.100.{serial}")),
            );
        }
        let volume_count = attributes
            .get("additional_volumes")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        let ids: Vec<String> = (0..volume_count)
            .map(|index| format!("vol-{serial}-{index}"))
            .collect();
        attributes.insert(String::from("additional_volume_ids"), json!(ids));
    }
}

enum Outcome {
    Proceed,
    Fail,
    Hang,
}

impl Provider for RecordingProvider {
    type Error = ScriptedProviderError;

    fn create<'a>(
        &'a self,
        kind: ResourceKind,
        attributes: &'a AttributeMap,
    ) -> ProviderFuture<'a, CreatedResource, Self::Error> {
        match self.record(kind, Operation::Create) {
            Outcome::Hang => Box::pin(std::future::pending()),
            Outcome::Fail => Box::pin(std::future::ready(Err(ScriptedProviderError::Scripted {
                operation: Operation::Create,
                kind,
            }))),
            Outcome::Proceed => Box::pin(async move {
                let mut inner = self.lock();
                let id = Self::next_id(&mut inner, kind);
                let serial = inner.counter;
                let mut observed = attributes.clone();
                observed.insert(String::from("id"), json!(id));
                Self::observe(kind, serial, &mut observed);
                inner.resources.insert(id.clone(), (kind, observed.clone()));
                Ok(CreatedResource {
                    id,
                    attributes: observed,
                })
            }),
        }
    }

    fn update<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
        attributes: &'a AttributeMap,
    ) -> ProviderFuture<'a, UpdateOutcome, Self::Error> {
        match self.record(kind, Operation::Update) {
            Outcome::Hang => Box::pin(std::future::pending()),
            Outcome::Fail => Box::pin(std::future::ready(Err(ScriptedProviderError::Scripted {
                operation: Operation::Update,
                kind,
            }))),
            Outcome::Proceed => Box::pin(async move {
                let mut inner = self.lock();
                if inner.replace_on_update.contains(&kind) {
                    return Ok(UpdateOutcome::RequiresReplacement);
                }
                let (_, stored) =
                    inner
                        .resources
                        .get_mut(id)
                        .ok_or_else(|| ScriptedProviderError::NotFound {
                            kind,
                            id: id.to_owned(),
                        })?;
                stored.extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
                Ok(UpdateOutcome::Applied(stored.clone()))
            }),
        }
    }

    fn destroy<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error> {
        match self.record(kind, Operation::Destroy) {
            Outcome::Hang => Box::pin(std::future::pending()),
            Outcome::Fail => Box::pin(std::future::ready(Err(ScriptedProviderError::Scripted {
                operation: Operation::Destroy,
                kind,
            }))),
            Outcome::Proceed => Box::pin(async move {
                let mut inner = self.lock();
                inner
                    .resources
                    .remove(id)
                    .map(|_| ())
                    .ok_or_else(|| ScriptedProviderError::NotFound {
                        kind,
                        id: id.to_owned(),
                    })
            }),
        }
    }

    fn describe<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<AttributeMap>, Self::Error> {
        match self.record(kind, Operation::Describe) {
            Outcome::Hang => Box::pin(std::future::pending()),
            Outcome::Fail => Box::pin(std::future::ready(Err(ScriptedProviderError::Scripted {
                operation: Operation::Describe,
                kind,
            }))),
            Outcome::Proceed => Box::pin(async move {
                let inner = self.lock();
                Ok(inner
                    .resources
                    .get(id)
                    .filter(|(stored_kind, _)| *stored_kind == kind)
                    .map(|(_, stored)| stored.clone()))
            }),
        }
    }
}

/// In-memory state store with a save counter, for incremental-save tests.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStateStore {
    inner: Arc<Mutex<(StackState, usize)>>,
}

impl InMemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with the given state.
    #[must_use]
    pub fn with_state(state: StackState) -> Self {
        Self {
            inner: Arc::new(Mutex::new((state, 0))),
        }
    }

    /// The most recently saved state.
    #[must_use]
    pub fn current(&self) -> StackState {
        self.lock().0.clone()
    }

    /// Number of times `save` has been called.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.lock().1
    }

    fn lock(&self) -> MutexGuard<'_, (StackState, usize)> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateStore for InMemoryStateStore {
    fn load(&self) -> Result<StackState, StateStoreError> {
        Ok(self.current())
    }

    fn save(&self, state: &StackState) -> Result<(), StateStoreError> {
        let mut inner = self.lock();
        inner.0 = state.clone();
        inner.1 += 1;
        Ok(())
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }

    /// Sets a single environment variable while holding the global mutex.
    pub async fn set_var(key: &str, value: &str) -> Self {
        Self::set_vars(&[(key, value)]).await
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
