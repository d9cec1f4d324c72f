//! Job lifecycle events
//!
//! Workers and the scheduler publish on a broadcast channel; any number of
//! subscribers (loggers, tests, websocket bridges) can listen. Slow
//! subscribers miss events rather than slowing workers down.

use serde::Serialize;
use tokio::sync::broadcast;

/// Default capacity of the event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Added {
        queue: String,
        job_id: String,
        name: String,
        delayed: bool,
    },
    Active {
        queue: String,
        job_id: String,
        name: String,
        attempt: u32,
    },
    Completed {
        queue: String,
        job_id: String,
        name: String,
        attempts_made: u32,
        duration_ms: u64,
    },
    Retrying {
        queue: String,
        job_id: String,
        name: String,
        attempts_made: u32,
        delay_ms: u64,
        error: String,
    },
    Failed {
        queue: String,
        job_id: String,
        name: String,
        attempts_made: u32,
        error: String,
    },
    Stalled {
        queue: String,
        job_id: String,
    },
}

impl JobEvent {
    pub fn queue(&self) -> &str {
        match self {
            JobEvent::Added { queue, .. }
            | JobEvent::Active { queue, .. }
            | JobEvent::Completed { queue, .. }
            | JobEvent::Retrying { queue, .. }
            | JobEvent::Failed { queue, .. }
            | JobEvent::Stalled { queue, .. } => queue,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Added { job_id, .. }
            | JobEvent::Active { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Retrying { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Stalled { job_id, .. } => job_id,
        }
    }

    /// Whether the job reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Completed { .. } | JobEvent::Failed { .. })
    }
}

/// Broadcast hub for [`JobEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; having no subscribers is not an error
    pub fn emit(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stalled(id: &str) -> JobEvent {
        JobEvent::Stalled {
            queue: "email".to_string(),
            job_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(stalled("1"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.queue(), "email");
        assert_eq!(event.job_id(), "1");
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        bus.emit(stalled("1"));
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = JobEvent::Failed {
            queue: "payout".to_string(),
            job_id: "42".to_string(),
            name: "process-payout".to_string(),
            attempts_made: 3,
            error: "Job rejected: 400".to_string(),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "failed");
        assert_eq!(value["attempts_made"], 3);
        assert!(event.is_terminal());
    }
}
