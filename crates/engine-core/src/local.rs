//! Both bridge halves wired together on one thread

use std::time::{SystemTime, UNIX_EPOCH};

use midibridge_platform::{MidiBackend, MutexExt};
use midibridge_policy::Policy;
use midibridge_protocol::PortId;

use crate::{
    new_shared_registry, ContentEngine, ContentReceiver, HostReceiver, HostRouter, HostSender,
    InMemoryChannel, SharedRegistry, TransportError,
};

/// Native registry, host router and content engine over an in-memory channel
///
/// Nothing moves between the two halves until [`LocalBridge::settle`] runs.
pub struct LocalBridge<B> {
    router: HostRouter<B, HostSender>,
    host_rx: HostReceiver,
    engine: ContentEngine,
    content_rx: ContentReceiver,
}

impl<B: MidiBackend> LocalBridge<B> {
    pub fn new(backend: B, policy: Policy) -> Self {
        let (host, content) = InMemoryChannel::new();
        let (host_tx, host_rx) = host.split();
        let (content_tx, content_rx) = content.split();

        Self {
            router: HostRouter::new(new_shared_registry(backend, host_tx)),
            host_rx,
            engine: ContentEngine::new(content_tx, policy),
            content_rx,
        }
    }

    pub fn engine(&self) -> &ContentEngine {
        &self.engine
    }

    pub fn registry(&self) -> SharedRegistry<B, HostSender> {
        self.router.registry()
    }

    /// Deliver queued payloads in both directions until neither side has
    /// anything left. Returns how many payloads moved.
    pub fn settle(&self) -> Result<usize, TransportError> {
        let mut total = 0;
        loop {
            let moved = self.router.pump(&self.host_rx)? + self.engine.pump(&self.content_rx)?;
            if moved == 0 {
                return Ok(total);
            }
            total += moved;
        }
    }

    /// Pick up device changes, then settle
    pub fn poll(&self) -> Result<usize, TransportError> {
        let changed = self.registry().lock_or_recover().refresh();
        if changed > 0 {
            tracing::debug!(changed, "Hot-plug changes queued");
        }
        self.settle()
    }

    /// Hand the host a message as if it arrived on a native source
    pub fn inject(&self, port_id: &PortId, data: Vec<u8>) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();
        self.registry()
            .lock_or_recover()
            .on_native_inbound(port_id, data, timestamp);
    }
}
