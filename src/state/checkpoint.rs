//! JSON-file-backed state store.

use super::{Block, MemoryAssignments, MemoryState, NodeMap, StateStore};
use crate::error::{Error, Result};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Checkpoint {
    machine_state: NodeMap,
    entries: MemoryAssignments,
}

/// State store persisted to a JSON checkpoint file.
///
/// The file is restored on creation and rewritten after every mutation, so
/// the on-disk copy always reflects the last acknowledged operation. A
/// write failure is logged and the in-memory state stays authoritative
/// until the next successful write.
#[derive(Debug)]
pub struct CheckpointState {
    inner: MemoryState,
    path: PathBuf,
}

impl CheckpointState {
    /// Open the checkpoint at `path`, restoring its contents when the file
    /// exists. A file that exists but does not parse fails with
    /// [`Error::Checkpoint`] instead of being silently discarded.
    pub fn new<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let mut inner = MemoryState::new();

        match std::fs::read(&path) {
            Ok(raw) => {
                let checkpoint: Checkpoint = serde_json::from_slice(&raw).map_err(|e| {
                    Error::checkpoint(format!("cannot parse {}: {}", path.display(), e))
                })?;
                inner.set_machine_state(checkpoint.machine_state);
                inner.set_memory_assignments(checkpoint.entries);
                debug!("restored state checkpoint from {}", path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no state checkpoint at {}, starting empty", path.display());
            }
            Err(e) => return Err(e.into()),
        }

        Ok(CheckpointState { inner, path })
    }

    fn persist(&self) {
        let checkpoint = Checkpoint {
            machine_state: self.inner.machine_state(),
            entries: self.inner.memory_assignments(),
        };
        let result = serde_json::to_vec(&checkpoint)
            .map_err(|e| Error::checkpoint(e.to_string()))
            .and_then(|raw| std::fs::write(&self.path, raw).map_err(Error::from));
        if let Err(e) = result {
            error!("failed to write state checkpoint {}: {}", self.path.display(), e);
        }
    }
}

impl StateStore for CheckpointState {
    fn machine_state(&self) -> NodeMap {
        self.inner.machine_state()
    }

    fn set_machine_state(&mut self, machine_state: NodeMap) {
        self.inner.set_machine_state(machine_state);
        self.persist();
    }

    fn memory_blocks(&self, pod_uid: &str, container_name: &str) -> Option<Vec<Block>> {
        self.inner.memory_blocks(pod_uid, container_name)
    }

    fn set_memory_blocks(&mut self, pod_uid: &str, container_name: &str, blocks: Vec<Block>) {
        self.inner.set_memory_blocks(pod_uid, container_name, blocks);
        self.persist();
    }

    fn memory_assignments(&self) -> MemoryAssignments {
        self.inner.memory_assignments()
    }

    fn set_memory_assignments(&mut self, assignments: MemoryAssignments) {
        self.inner.set_memory_assignments(assignments);
        self.persist();
    }

    fn delete(&mut self, pod_uid: &str, container_name: &str) {
        self.inner.delete(pod_uid, container_name);
        self.persist();
    }

    fn clear(&mut self) {
        self.inner.clear();
        self.persist();
    }
}
