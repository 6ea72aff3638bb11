//! Progress reporting, a consumer-defined communication manager.
//!
//! Travels as `extension` messages named `progress`.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sublet::{ChannelLink, CommunicationManager, LinkSlot, Message, ProtocolError};

pub const EXTENSION_NAME: &str = "progress";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub done: u32,
    pub total: u32,
}

#[derive(Default)]
pub struct ProgressManager {
    link: LinkSlot,
    latest: Mutex<Option<Progress>>,
}

impl ProgressManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Worker side.
    pub fn report(&self, done: u32, total: u32) -> Result<(), ProtocolError> {
        let payload = serde_json::json!({ "done": done, "total": total });
        self.link
            .get(EXTENSION_NAME)?
            .send_to_parent(Message::extension(EXTENSION_NAME, payload))
    }

    /// Parent side: the last report received.
    pub fn latest(&self) -> Option<Progress> {
        *self
            .latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn owns(message: &Message) -> bool {
        matches!(message, Message::Extension { name, .. } if name == EXTENSION_NAME)
    }
}

impl CommunicationManager for ProgressManager {
    fn name(&self) -> &'static str {
        EXTENSION_NAME
    }

    fn attach(&self, link: ChannelLink) {
        self.link.set(EXTENSION_NAME, link);
    }

    fn can_handle_from_parent(&self, _message: &Message) -> bool {
        false
    }

    fn can_handle_from_worker(&self, message: &Message) -> bool {
        Self::owns(message)
    }

    fn handle_from_parent(&self, message: Message) -> Result<(), ProtocolError> {
        Err(ProtocolError::UnroutableMessage {
            message_type: message.route_key(),
        })
    }

    fn handle_from_worker(&self, message: Message) -> Result<(), ProtocolError> {
        let Message::Extension { payload, .. } = message else {
            return Err(ProtocolError::UnroutableMessage {
                message_type: message.route_key(),
            });
        };
        match serde_json::from_value::<Progress>(payload) {
            Ok(progress) => {
                tracing::info!(done = progress.done, total = progress.total, "Worker progress");
                *self
                    .latest
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(progress);
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring malformed progress report"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sublet::{Direction, MessageRouter};
    use tokio::sync::mpsc;

    #[test]
    fn report_reaches_parent_manager() {
        let worker = std::sync::Arc::new(ProgressManager::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        worker.attach(ChannelLink::worker(tx));
        worker.report(2, 5).unwrap();

        let parent = std::sync::Arc::new(ProgressManager::new());
        let mut router = MessageRouter::new();
        router.register(parent.clone());
        router
            .dispatch(rx.try_recv().unwrap(), Direction::FromWorker)
            .unwrap();

        assert_eq!(parent.latest(), Some(Progress { done: 2, total: 5 }));
    }

    #[test]
    fn malformed_payload_is_ignored() {
        let parent = ProgressManager::new();
        parent
            .handle_from_worker(Message::extension(EXTENSION_NAME, serde_json::json!("half")))
            .unwrap();
        assert_eq!(parent.latest(), None);
    }

    #[test]
    fn other_extensions_are_not_claimed() {
        let manager = ProgressManager::new();
        assert!(!manager.can_handle_from_worker(&Message::extension(
            "telemetry",
            serde_json::json!(null)
        )));
    }
}
