//! Machine lifecycle reconciler
//!
//! Drives one machine through create, wait-for-ready and read-back, or
//! delete. Mutations on the same key are serialized through the
//! [`ResourceKeyLock`]; reads are not serialized and may observe a machine
//! mid-transition.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use metal_common::{
    DriftReport, Error, LifecycleState, Operation, ResourceKey, ResourceSnapshot, ResourceSpec,
    Result, WaitSpec,
};

use crate::client::RemoteResourceClient;
use crate::lock::ResourceKeyLock;
use crate::poller::{ConditionPoller, Observation};

/// Previously applied machine: its id and the spec it was created from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorState {
    pub id: String,
    pub spec: ResourceSpec,
}

/// What `apply` did to reach the desired spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyAction {
    Created,
    /// Force-replace fields changed, the old machine was destroyed
    Replaced {
        previous_id: String,
        fields: Vec<&'static str>,
    },
    Refreshed,
}

#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub action: ApplyAction,
    pub snapshot: ResourceSnapshot,
    pub drift: DriftReport,
}

/// Reconciler for machines of one provider
pub struct LifecycleReconciler {
    client: Arc<dyn RemoteResourceClient>,
    locks: Arc<ResourceKeyLock>,
    ready: WaitSpec,
    /// Last recorded lifecycle state per key
    lifecycle: RwLock<HashMap<ResourceKey, LifecycleState>>,
    /// Mutations currently running, one per key
    in_flight: DashMap<ResourceKey, Operation>,
}

/// Marks a mutation as running until dropped
struct InFlight<'a> {
    table: &'a DashMap<ResourceKey, Operation>,
    key: ResourceKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.key);
    }
}

impl LifecycleReconciler {
    /// Create a reconciler with its own lock table
    pub fn new(client: Arc<dyn RemoteResourceClient>, ready: WaitSpec) -> Self {
        Self {
            client,
            locks: Arc::new(ResourceKeyLock::new()),
            ready,
            lifecycle: RwLock::new(HashMap::new()),
            in_flight: DashMap::new(),
        }
    }

    /// Use a lock table shared with other reconcilers
    pub fn with_locks(mut self, locks: Arc<ResourceKeyLock>) -> Self {
        self.locks = locks;
        self
    }

    pub fn ready_condition(&self) -> &WaitSpec {
        &self.ready
    }

    /// Last recorded lifecycle state, `Absent` for unknown keys
    pub fn lifecycle(&self, key: &ResourceKey) -> LifecycleState {
        self.lifecycle.read().get(key).copied().unwrap_or_default()
    }

    fn transition(&self, key: &ResourceKey, next: LifecycleState) -> LifecycleState {
        let prev = self
            .lifecycle
            .write()
            .insert(key.clone(), next)
            .unwrap_or_default();
        if prev != next {
            debug!("{}: {} -> {}", key, prev, next);
        }
        prev
    }

    fn begin(&self, key: &ResourceKey, operation: Operation) -> Result<InFlight<'_>> {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(_) => Err(Error::Conflict {
                key: key.to_string(),
                operation,
            }),
            Entry::Vacant(slot) => {
                slot.insert(operation);
                Ok(InFlight {
                    table: &self.in_flight,
                    key: key.clone(),
                })
            }
        }
    }

    /// Create a machine, wait until it is ready and read it back
    ///
    /// On failure the machine may still exist at the provider. Nothing is
    /// cleaned up; the error carries the id once one was assigned.
    pub async fn create(&self, spec: &ResourceSpec) -> Result<ResourceSnapshot> {
        self.create_with_drift(spec).await.map(|(snapshot, _)| snapshot)
    }

    async fn create_with_drift(&self, spec: &ResourceSpec) -> Result<(ResourceSnapshot, DriftReport)> {
        spec.validate()?;

        let key = spec.key();
        let _guard = self.locks.acquire(&key).await;
        let _mutation = self.begin(&key, Operation::Create)?;
        self.transition(&key, LifecycleState::Creating);

        let result = self.create_locked(spec, &key).await;
        match &result {
            Ok((snapshot, drift)) => {
                // The machine lives under its id from here on
                self.transition(&key, LifecycleState::Absent);
                info!("Machine {} is active as {}", spec.hostname, snapshot.id);
                if !drift.is_empty() {
                    warn!(
                        "Machine {} differs from its spec in {:?}, accepting provider values",
                        snapshot.id,
                        drift.field_names()
                    );
                }
            }
            Err(e) => {
                self.transition(&key, LifecycleState::Failed);
                warn!("Failed to create machine {}: {}", spec.hostname, e);
            }
        }
        result
    }

    async fn create_locked(
        &self,
        spec: &ResourceSpec,
        key: &ResourceKey,
    ) -> Result<(ResourceSnapshot, DriftReport)> {
        info!("Creating machine {} ({})", spec.hostname, key);
        let id = self.client.create(spec).await?;

        // The assigned id becomes the key for any later mutation
        let id_key = ResourceKey::from_id(&id);
        let _guard = self.locks.acquire(&id_key).await;
        let _mutation = self.begin(&id_key, Operation::Create)?;
        self.transition(key, LifecycleState::AwaitingReady);
        self.transition(&id_key, LifecycleState::AwaitingReady);

        let result = self.await_ready_and_read(spec, &id).await;
        let state = if result.is_ok() {
            LifecycleState::Active
        } else {
            LifecycleState::Failed
        };
        self.transition(&id_key, state);
        result
    }

    async fn await_ready_and_read(&self, spec: &ResourceSpec, id: &str) -> Result<(ResourceSnapshot, DriftReport)> {
        self.wait_for(id, &self.ready).await?;

        // Networking and secrets only show up once the machine booted
        let snapshot = self.read(id).await.map_err(|e| e.during(Operation::Create))?;
        snapshot.primary_network().map_err(|e| e.during(Operation::Create))?;

        let drift = DriftReport::compute(spec, &snapshot);
        Ok((snapshot, drift))
    }

    /// Poll the machine until `wait.attribute` equals `wait.target`
    ///
    /// A machine that reports `Failed` ends the wait early with
    /// `Error::ProvisioningFailed`, unless `Failed` is what is awaited.
    pub async fn wait_for(&self, id: &str, wait: &WaitSpec) -> Result<ResourceSnapshot> {
        let poller = ConditionPoller::new(wait.clone());
        let attribute = wait.attribute.as_str();
        let target = wait.target.as_str();
        let client = &self.client;

        poller
            .wait(id, || async move {
                let snapshot = client.get(id).await.map_err(|e| e.during(Operation::Wait))?;
                let state = snapshot.attribute(attribute);

                if snapshot.state == LifecycleState::Failed && state.as_deref() != Some(target) {
                    return Err(Error::ProvisioningFailed {
                        id: id.to_string(),
                        last_event: snapshot.last_event,
                    });
                }
                Ok::<_, Error>(Observation::new(snapshot, state))
            })
            .await
    }

    /// Read the authoritative state of a machine
    ///
    /// A machine the provider has no record of yields `Error::NotFound`,
    /// which callers treat as removal rather than failure.
    pub async fn read(&self, id: &str) -> Result<ResourceSnapshot> {
        let snapshot = match self.client.get(id).await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_not_found() => {
                info!("Machine {} no longer exists at the provider", id);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if snapshot.id != id {
            return Err(Error::transport(
                Operation::Read,
                id,
                format!("provider returned machine {}", snapshot.id),
            ));
        }
        Ok(snapshot)
    }

    /// Read a machine and report drift against the declared spec
    pub async fn read_with_drift(
        &self,
        id: &str,
        declared: &ResourceSpec,
    ) -> Result<(ResourceSnapshot, DriftReport)> {
        let snapshot = self.read(id).await?;
        let drift = DriftReport::compute(declared, &snapshot);
        for field in &drift.fields {
            info!(
                "Machine {} drifted on {}: declared {:?}, observed {:?}",
                id, field.field, field.declared, field.observed
            );
        }
        Ok((snapshot, drift))
    }

    /// Delete a machine; deleting one that is already gone succeeds
    pub async fn delete(&self, id: &str) -> Result<()> {
        let key = ResourceKey::from_id(id);
        let _guard = self.locks.acquire(&key).await;
        let _mutation = self.begin(&key, Operation::Delete)?;
        let prev = self.transition(&key, LifecycleState::Deleting);

        match self.client.delete(id).await {
            Ok(()) => {
                info!("Deleted machine {}", id);
            }
            Err(e) if e.is_not_found() => {
                info!("Machine {} already gone", id);
            }
            Err(e) => {
                self.transition(&key, prev);
                return Err(e);
            }
        }

        self.transition(&key, LifecycleState::Absent);
        Ok(())
    }

    /// Drive the provider toward `desired`
    ///
    /// Without a prior machine this creates one. A change to a
    /// force-replace field destroys the prior machine and creates a new one.
    /// Otherwise the machine is read back and mutable fields are taken from
    /// the provider.
    pub async fn apply(&self, desired: &ResourceSpec, prior: Option<&PriorState>) -> Result<ApplyOutcome> {
        desired.validate()?;

        let Some(prior) = prior else {
            let (snapshot, drift) = self.create_with_drift(desired).await?;
            return Ok(ApplyOutcome {
                action: ApplyAction::Created,
                snapshot,
                drift,
            });
        };

        let fields = desired.replacement_fields(&prior.spec);
        if !fields.is_empty() {
            info!("Replacing machine {}: {:?} changed", prior.id, fields);
            self.delete(&prior.id).await?;
            let (snapshot, drift) = self.create_with_drift(desired).await?;
            return Ok(ApplyOutcome {
                action: ApplyAction::Replaced {
                    previous_id: prior.id.clone(),
                    fields,
                },
                snapshot,
                drift,
            });
        }

        match self.read_with_drift(&prior.id, desired).await {
            Ok((snapshot, drift)) => Ok(ApplyOutcome {
                action: ApplyAction::Refreshed,
                snapshot,
                drift,
            }),
            Err(e) if e.is_not_found() => {
                info!("Machine {} vanished, creating it again", prior.id);
                let (snapshot, drift) = self.create_with_drift(desired).await?;
                Ok(ApplyOutcome {
                    action: ApplyAction::Created,
                    snapshot,
                    drift,
                })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Unreachable;

    #[async_trait]
    impl RemoteResourceClient for Unreachable {
        async fn create(&self, spec: &ResourceSpec) -> Result<String> {
            Err(Error::transport(Operation::Create, &spec.hostname, "unreachable"))
        }

        async fn get(&self, id: &str) -> Result<ResourceSnapshot> {
            Err(Error::transport(Operation::Read, id, "unreachable"))
        }

        async fn delete(&self, id: &str) -> Result<()> {
            Err(Error::transport(Operation::Delete, id, "unreachable"))
        }
    }

    fn reconciler() -> LifecycleReconciler {
        LifecycleReconciler::new(
            Arc::new(Unreachable),
            WaitSpec::new("state", "Active", Duration::from_secs(1)),
        )
    }

    #[test]
    fn test_overlapping_mutation_is_a_conflict() {
        let reconciler = reconciler();
        let key = ResourceKey::from_id("r-1");

        let first = reconciler.begin(&key, Operation::Create).unwrap();
        let second = reconciler.begin(&key, Operation::Delete);
        assert!(matches!(
            second,
            Err(Error::Conflict { operation: Operation::Delete, .. })
        ));

        drop(first);
        assert!(reconciler.begin(&key, Operation::Delete).is_ok());
    }

    #[tokio::test]
    async fn test_failed_create_marks_placeholder_failed() {
        let reconciler = reconciler();
        let spec = ResourceSpec::new("h1", "img-a", "p1", "s1");

        let err = reconciler.create(&spec).await.unwrap_err();
        assert!(matches!(err, Error::Transport { operation: Operation::Create, .. }));
        assert_eq!(reconciler.lifecycle(&spec.key()), LifecycleState::Failed);
    }

    #[tokio::test]
    async fn test_failed_delete_restores_state() {
        let reconciler = reconciler();
        let key = ResourceKey::from_id("r-1");

        assert!(reconciler.delete("r-1").await.is_err());
        assert_eq!(reconciler.lifecycle(&key), LifecycleState::Absent);
    }
}
