//! Communication managers and the router that shares one channel among them.
//!
//! A manager owns a disjoint set of message types. The same manager type is
//! constructed independently on both sides of the channel, and both sides must
//! register the same kinds of managers in the same order: which manager handles
//! which type is fixed at construction, not negotiated over the wire.

use std::sync::{Arc, OnceLock};

use crate::bridge::protocol::Message;
use crate::bridge::transport::ChannelLink;
use crate::error::ProtocolError;

/// Where an inbound message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received by the worker.
    FromParent,
    /// Received by the parent.
    FromWorker,
}

pub trait CommunicationManager: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once the channel to the other side exists.
    fn attach(&self, link: ChannelLink);

    /// Must be a pure check and must not panic.
    fn can_handle_from_parent(&self, message: &Message) -> bool;

    /// Must be a pure check and must not panic.
    fn can_handle_from_worker(&self, message: &Message) -> bool;

    /// Must not block: expensive work belongs in the work function.
    fn handle_from_parent(&self, message: Message) -> Result<(), ProtocolError>;

    /// Must not block: expensive work belongs in the work function.
    fn handle_from_worker(&self, message: Message) -> Result<(), ProtocolError>;
}

/// Holds the link a manager receives in [`CommunicationManager::attach`].
#[derive(Default)]
pub struct LinkSlot(OnceLock<ChannelLink>);

impl LinkSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, manager: &'static str, link: ChannelLink) {
        if self.0.set(link).is_err() {
            tracing::warn!(manager, "Communication manager attached twice, keeping first link");
        }
    }

    pub fn get(&self, manager: &'static str) -> Result<&ChannelLink, ProtocolError> {
        self.0.get().ok_or(ProtocolError::NotAttached { manager })
    }
}

/// Ordered capability table: the first manager that claims a message gets it.
#[derive(Clone, Default)]
pub struct MessageRouter {
    managers: Vec<Arc<dyn CommunicationManager>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, manager: Arc<dyn CommunicationManager>) {
        tracing::trace!(
            manager = manager.name(),
            position = self.managers.len(),
            "Registering communication manager"
        );
        self.managers.push(manager);
    }

    pub fn managers(&self) -> impl Iterator<Item = &Arc<dyn CommunicationManager>> {
        self.managers.iter()
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    pub fn attach(&self, link: &ChannelLink) {
        for manager in &self.managers {
            manager.attach(link.clone());
        }
    }

    /// Hand `message` to its owner.
    ///
    /// An unclaimed message is an error, never a silent drop: it means one side
    /// forgot to register a manager, and dropping would lose data quietly.
    pub fn dispatch(&self, message: Message, direction: Direction) -> Result<(), ProtocolError> {
        let owner = self.managers.iter().find(|m| match direction {
            Direction::FromParent => m.can_handle_from_parent(&message),
            Direction::FromWorker => m.can_handle_from_worker(&message),
        });

        let Some(owner) = owner else {
            return Err(ProtocolError::UnroutableMessage {
                message_type: message.route_key(),
            });
        };

        tracing::trace!(
            manager = owner.name(),
            message_type = message.type_tag(),
            ?direction,
            "Dispatching message"
        );
        match direction {
            Direction::FromParent => owner.handle_from_parent(message),
            Direction::FromWorker => owner.handle_from_worker(message),
        }
    }
}
