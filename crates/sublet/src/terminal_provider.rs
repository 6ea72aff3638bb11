//! Terminal relay.
//!
//! The parent registers every terminal a worker may write to and hands out
//! numeric ids. On the worker side a [`SubprocessTerminal`] stands in for each
//! of them and turns writes into `terminal-write` messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use crate::bridge::protocol::{InnerConfiguration, Message, Severity};
use crate::bridge::transport::ChannelLink;
use crate::error::ProtocolError;
use crate::manager::{CommunicationManager, LinkSlot};
use crate::terminal::TerminalSink;

const NAME: &str = "terminal-provider";

pub struct TerminalProviderManager {
    providers: RwLock<HashMap<u32, Arc<dyn TerminalSink>>>,
    next_id: AtomicU32,
    link: LinkSlot,
}

impl Default for TerminalProviderManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalProviderManager {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            link: LinkSlot::new(),
        }
    }

    /// Parent side: make `terminal` addressable from the worker.
    pub fn register_terminal_provider(&self, terminal: Arc<dyn TerminalSink>) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.providers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, terminal);
        tracing::trace!(terminal_provider_id = id, "Registered terminal provider");
        id
    }

    fn provider(&self, id: u32) -> Option<Arc<dyn TerminalSink>> {
        self.providers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .cloned()
    }

    /// Worker side: a terminal that forwards to the parent terminal `id`.
    pub fn subprocess_terminal(
        &self,
        id: u32,
        inner: &InnerConfiguration,
    ) -> Result<SubprocessTerminal, ProtocolError> {
        let link = self.link.get(NAME)?.clone();
        Ok(SubprocessTerminal::new(id, link, inner))
    }
}

impl CommunicationManager for TerminalProviderManager {
    fn name(&self) -> &'static str {
        NAME
    }

    fn attach(&self, link: ChannelLink) {
        self.link.set(NAME, link);
    }

    fn can_handle_from_parent(&self, _message: &Message) -> bool {
        false
    }

    fn can_handle_from_worker(&self, message: &Message) -> bool {
        matches!(message, Message::TerminalWrite { .. })
    }

    fn handle_from_parent(&self, message: Message) -> Result<(), ProtocolError> {
        Err(ProtocolError::UnroutableMessage {
            message_type: message.route_key(),
        })
    }

    fn handle_from_worker(&self, message: Message) -> Result<(), ProtocolError> {
        let Message::TerminalWrite {
            terminal_provider_id,
            data,
            severity,
        } = message
        else {
            return Err(ProtocolError::UnroutableMessage {
                message_type: message.route_key(),
            });
        };
        let terminal = self
            .provider(terminal_provider_id)
            .ok_or(ProtocolError::UnknownTerminalProvider(terminal_provider_id))?;
        terminal.write(&data, severity);
        Ok(())
    }
}

/// Worker-side terminal whose output lands on a parent terminal.
#[derive(Debug, Clone)]
pub struct SubprocessTerminal {
    provider_id: u32,
    link: ChannelLink,
    supports_color: bool,
    eol: String,
}

impl SubprocessTerminal {
    pub fn new(provider_id: u32, link: ChannelLink, inner: &InnerConfiguration) -> Self {
        Self {
            provider_id,
            link,
            supports_color: inner.terminal_supports_color,
            eol: inner.terminal_end_of_line_character.clone(),
        }
    }

    pub fn provider_id(&self) -> u32 {
        self.provider_id
    }

    /// Like [`TerminalSink::write`], but reports a closed channel.
    pub fn try_write(&self, text: &str, severity: Severity) -> Result<(), ProtocolError> {
        self.link.send_to_parent(Message::TerminalWrite {
            terminal_provider_id: self.provider_id,
            data: text.to_string(),
            severity,
        })
    }
}

impl TerminalSink for SubprocessTerminal {
    fn write(&self, text: &str, severity: Severity) {
        // Fails only once the exit message has gone out.
        let _ = self.try_write(text, severity);
    }

    fn supports_color(&self) -> bool {
        self.supports_color
    }

    fn eol(&self) -> &str {
        &self.eol
    }
}
