//! Job event stream.
//!
//! Each job's events are produced by a single worker, so per-job ordering
//! is total: `created → started → progress* → (paused|resumed)* →
//! (completed|failed|canceled)`. Events of different jobs interleave
//! freely. Delivery is a bounded broadcast channel; a subscriber that
//! falls behind loses the oldest events, never the ordering.

use object_storage::ErrorKind;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::job::{JobId, JobKind};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum JobEvent {
    Created {
        id: JobId,
        kind: JobKind,
    },
    Started {
        id: JobId,
    },
    Progress {
        id: JobId,
        bytes_done: u64,
        bytes_total: Option<u64>,
    },
    Paused {
        id: JobId,
    },
    Resumed {
        id: JobId,
    },
    Completed {
        id: JobId,
    },
    Failed {
        id: JobId,
        kind: ErrorKind,
        message: String,
    },
    Canceled {
        id: JobId,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Created { id, .. }
            | JobEvent::Started { id }
            | JobEvent::Progress { id, .. }
            | JobEvent::Paused { id }
            | JobEvent::Resumed { id }
            | JobEvent::Completed { id }
            | JobEvent::Failed { id, .. }
            | JobEvent::Canceled { id } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Completed { .. } | JobEvent::Failed { .. } | JobEvent::Canceled { .. }
        )
    }
}

pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: JobEvent) {
        // No subscribers is fine; the journal is the durable record.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let id = uuid::Uuid::new_v4();

        bus.emit(JobEvent::Created {
            id,
            kind: JobKind::Copy,
        });
        bus.emit(JobEvent::Started { id });
        bus.emit(JobEvent::Progress {
            id,
            bytes_done: 10,
            bytes_total: Some(100),
        });
        bus.emit(JobEvent::Completed { id });

        assert!(matches!(rx.recv().await.unwrap(), JobEvent::Created { .. }));
        assert!(matches!(rx.recv().await.unwrap(), JobEvent::Started { .. }));
        assert!(matches!(rx.recv().await.unwrap(), JobEvent::Progress { .. }));
        let last = rx.recv().await.unwrap();
        assert!(last.is_terminal());
        assert_eq!(last.job_id(), id);
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.emit(JobEvent::Started {
            id: uuid::Uuid::new_v4(),
        });
    }
}
