use std::fmt;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use rules::Destination;

/// Names one Target custom resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetId {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Event-stream phase of one target: pending until the initial snapshot
/// completes, live afterwards, back to pending when the informer set for
/// its rules is rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Pending,
    Live,
}

pub struct TargetRuntime {
    pub destination: Destination,
    stream: RwLock<StreamState>,
}

impl TargetRuntime {
    pub fn stream_state(&self) -> StreamState {
        *self.stream.read().unwrap()
    }
}

/// Runtime registry of active targets, written by the target controller and
/// read by the supervisor and the snapshot manager.
#[derive(Default)]
pub struct TargetRegistry {
    targets: DashMap<TargetId, Arc<TargetRuntime>>,
}

impl TargetRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register or refresh a target. A destination change resets the stream
    /// to pending.
    pub fn register(&self, id: TargetId, destination: Destination) -> Arc<TargetRuntime> {
        if let Some(existing) = self.targets.get(&id)
            && existing.destination == destination
        {
            return existing.clone();
        }
        let runtime = Arc::new(TargetRuntime {
            destination,
            stream: RwLock::new(StreamState::Pending),
        });
        self.targets.insert(id, runtime.clone());
        runtime
    }

    pub fn deregister(&self, id: &TargetId) {
        self.targets.remove(id);
    }

    pub fn get(&self, id: &TargetId) -> Option<Arc<TargetRuntime>> {
        self.targets.get(id).map(|entry| entry.clone())
    }

    pub fn set_stream_live(&self, id: &TargetId) {
        if let Some(runtime) = self.get(id) {
            *runtime.stream.write().unwrap() = StreamState::Live;
        }
    }

    pub fn reset_stream(&self, id: &TargetId) {
        if let Some(runtime) = self.get(id) {
            *runtime.stream.write().unwrap() = StreamState::Pending;
        }
    }

    pub fn all(&self) -> Vec<(TargetId, Arc<TargetRuntime>)> {
        self.targets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn all_destinations(&self) -> Vec<(TargetId, Destination)> {
        self.targets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().destination.clone()))
            .collect()
    }
}
