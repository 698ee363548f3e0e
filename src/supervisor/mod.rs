//! Supervised pool of extraction workers.
//!
//! The supervisor owns the work queue and hands items out one at a time:
//! every message a worker sends (`Ready` on start, `Done` per item) is
//! answered with the next queue entry, and a `Stop` sentinel once the queue
//! has no work left. Workers that go silent for longer than the liveness
//! timeout, or exit unexpectedly, are killed and replaced; their in-flight
//! item is reported as incomplete.

pub mod pool;
pub mod slot;
pub mod spawn;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::extract::{BibRead, FaceRead};

pub use pool::{Disposition, Supervisor, SupervisorConfig, SupervisorReport};
pub use slot::{SlotState, WorkerSlot};
pub use spawn::{ProcessSpawner, ThreadSpawner, WorkerHandle, WorkerSpawner};

/// One photo to extract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub path: PathBuf,
}

/// Supervisor to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum WorkerCommand {
    Process(WorkItem),
    /// Sentinel: finish cleanly.
    Stop,
}

/// Worker to supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Models are loaded; send work.
    Ready,
    Done(WorkResult),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    pub item_id: i64,
    pub slot: usize,
    pub outcome: WorkOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOutcome {
    Extracted {
        bibs: Vec<BibRead>,
        faces: Vec<FaceRead>,
    },
    /// The photo could not be analysed; nothing should be written for it.
    Failed { reason: String },
}

/// What the supervisor receives from a worker's transport.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotMessage {
    Event(WorkerEvent),
    /// The worker is gone: its process exited or its thread returned.
    Exited,
}

/// A [`SlotMessage`] tagged with its sender. `generation` changes on every
/// restart so messages from a replaced worker can be told apart.
#[derive(Debug, Clone)]
pub struct SlotEnvelope {
    pub slot: usize,
    pub generation: u64,
    pub message: SlotMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_wire_format() {
        let cmd = WorkerCommand::Process(WorkItem { id: 7, path: PathBuf::from("/photos/1/raw/a.jpg") });
        let line = serde_json::to_string(&cmd).unwrap();
        assert_eq!(line, r#"{"cmd":"process","id":7,"path":"/photos/1/raw/a.jpg"}"#);
        assert_eq!(serde_json::to_string(&WorkerCommand::Stop).unwrap(), r#"{"cmd":"stop"}"#);

        let done = WorkerEvent::Done(WorkResult {
            item_id: 7,
            slot: 2,
            outcome: WorkOutcome::Failed { reason: "unreadable".to_string() },
        });
        let line = serde_json::to_string(&done).unwrap();
        assert_eq!(serde_json::from_str::<WorkerEvent>(&line).unwrap(), done);
        assert_eq!(serde_json::from_str::<WorkerEvent>(r#"{"event":"ready"}"#).unwrap(), WorkerEvent::Ready);
    }
}
