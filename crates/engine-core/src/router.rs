//! Host router - dispatches content messages to the port registry

use midibridge_platform::{MidiBackend, MutexExt};
use midibridge_protocol::{decode, ContentMessage};

use crate::{HostToContent, PayloadReceiver, SharedRegistry, TransportError};

/// Target used for diagnostics forwarded by the script context
pub const CONTENT_LOG_TARGET: &str = "midibridge::content";

/// Routes everything the script context posts to the host
pub struct HostRouter<B, S> {
    registry: SharedRegistry<B, S>,
}

impl<B: MidiBackend, S: HostToContent> HostRouter<B, S> {
    pub fn new(registry: SharedRegistry<B, S>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> SharedRegistry<B, S> {
        self.registry.clone()
    }

    /// Decode and dispatch one payload; malformed payloads are logged and dropped
    pub fn handle_payload(&self, payload: &str) {
        match decode::<ContentMessage>(payload) {
            Ok(message) => self.handle_message(message),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed content message");
                tracing::trace!(payload, "Malformed payload");
            }
        }
    }

    /// Dispatch one decoded content message
    pub fn handle_message(&self, message: ContentMessage) {
        match message {
            ContentMessage::Connect => {
                tracing::info!("Got connect message");
                self.registry.lock_or_recover().on_connect_requested();
            }
            ContentMessage::MidiOutput { port_id, data } => {
                tracing::debug!(port_id = %port_id, len = data.len(), "midioutput");
                self.registry.lock_or_recover().on_outbound_send(&port_id, &data);
            }
            ContentMessage::Log { value } => {
                tracing::info!(target: CONTENT_LOG_TARGET, "{value}");
            }
        }
    }

    /// Dispatch every payload currently queued. Returns how many were handled.
    pub fn pump(&self, receiver: &impl PayloadReceiver) -> Result<usize, TransportError> {
        let mut count = 0;
        while let Some(payload) = receiver.try_recv()? {
            self.handle_payload(&payload);
            count += 1;
        }
        Ok(count)
    }

    /// Dispatch payloads until the script context goes away
    pub fn run(&self, receiver: &impl PayloadReceiver) {
        loop {
            match receiver.recv() {
                Ok(payload) => self.handle_payload(&payload),
                Err(TransportError::Disconnected) => {
                    tracing::info!("Script context disconnected");
                    break;
                }
                Err(e) => tracing::warn!(error = %e, "Receive failed"),
            }
        }
    }
}
