//! Message channel between the host and the script context
//!
//! Each direction carries encoded payloads and preserves send order. There is
//! no acknowledgment and no ordering between the two directions.

use std::sync::mpsc::{self, Receiver, Sender};

use midibridge_protocol::{encode, CodecError, ContentMessage, HostMessage};

/// Trait for posting messages from the host into the script context
pub trait HostToContent: Send {
    fn send(&self, message: &HostMessage) -> Result<(), TransportError>;
}

/// Trait for posting messages from the script context to the host
pub trait ContentToHost {
    fn send(&self, message: &ContentMessage) -> Result<(), TransportError>;
}

/// Trait for receiving encoded payloads on either side
pub trait PayloadReceiver {
    fn recv(&self) -> Result<String, TransportError>;
    fn try_recv(&self) -> Result<Option<String>, TransportError>;
}

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Channel disconnected")]
    Disconnected,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// In-memory channel using std channels
pub struct InMemoryChannel;

impl InMemoryChannel {
    /// Create a new channel
    ///
    /// Returns (host_side, content_side) endpoints
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (HostEndpoint, ContentEndpoint) {
        let (to_content_tx, to_content_rx) = mpsc::channel();
        let (to_host_tx, to_host_rx) = mpsc::channel();

        let host = HostEndpoint {
            outbound: to_content_tx,
            inbound: to_host_rx,
        };

        let content = ContentEndpoint {
            outbound: to_host_tx,
            inbound: to_content_rx,
        };

        (host, content)
    }
}

fn send_to(tx: &Sender<String>, payload: String) -> Result<(), TransportError> {
    tx.send(payload).map_err(|_| TransportError::Disconnected)
}

fn recv_from(rx: &Receiver<String>) -> Result<String, TransportError> {
    rx.recv().map_err(|_| TransportError::Disconnected)
}

fn try_recv_from(rx: &Receiver<String>) -> Result<Option<String>, TransportError> {
    match rx.try_recv() {
        Ok(payload) => Ok(Some(payload)),
        Err(mpsc::TryRecvError::Empty) => Ok(None),
        Err(mpsc::TryRecvError::Disconnected) => Err(TransportError::Disconnected),
    }
}

/// Host-side channel endpoint
pub struct HostEndpoint {
    outbound: Sender<String>,
    inbound: Receiver<String>,
}

impl HostEndpoint {
    /// Split into the sending half (owned by the port registry) and the
    /// receiving half (drained by the host router)
    pub fn split(self) -> (HostSender, HostReceiver) {
        (
            HostSender {
                outbound: self.outbound,
            },
            HostReceiver {
                inbound: self.inbound,
            },
        )
    }
}

impl HostToContent for HostEndpoint {
    fn send(&self, message: &HostMessage) -> Result<(), TransportError> {
        send_to(&self.outbound, encode(message)?)
    }
}

impl PayloadReceiver for HostEndpoint {
    fn recv(&self) -> Result<String, TransportError> {
        recv_from(&self.inbound)
    }

    fn try_recv(&self) -> Result<Option<String>, TransportError> {
        try_recv_from(&self.inbound)
    }
}

/// Sending half of the host endpoint
#[derive(Clone)]
pub struct HostSender {
    outbound: Sender<String>,
}

impl HostToContent for HostSender {
    fn send(&self, message: &HostMessage) -> Result<(), TransportError> {
        send_to(&self.outbound, encode(message)?)
    }
}

/// Receiving half of the host endpoint
pub struct HostReceiver {
    inbound: Receiver<String>,
}

impl PayloadReceiver for HostReceiver {
    fn recv(&self) -> Result<String, TransportError> {
        recv_from(&self.inbound)
    }

    fn try_recv(&self) -> Result<Option<String>, TransportError> {
        try_recv_from(&self.inbound)
    }
}

/// Content-side channel endpoint
pub struct ContentEndpoint {
    outbound: Sender<String>,
    inbound: Receiver<String>,
}

impl ContentEndpoint {
    /// Split into the sending half (owned by the content engine) and the
    /// receiving half (drained by whoever drives the script context)
    pub fn split(self) -> (ContentSender, ContentReceiver) {
        (
            ContentSender {
                outbound: self.outbound,
            },
            ContentReceiver {
                inbound: self.inbound,
            },
        )
    }
}

impl ContentToHost for ContentEndpoint {
    fn send(&self, message: &ContentMessage) -> Result<(), TransportError> {
        send_to(&self.outbound, encode(message)?)
    }
}

impl PayloadReceiver for ContentEndpoint {
    fn recv(&self) -> Result<String, TransportError> {
        recv_from(&self.inbound)
    }

    fn try_recv(&self) -> Result<Option<String>, TransportError> {
        try_recv_from(&self.inbound)
    }
}

/// Sending half of the content endpoint
#[derive(Clone)]
pub struct ContentSender {
    outbound: Sender<String>,
}

impl ContentToHost for ContentSender {
    fn send(&self, message: &ContentMessage) -> Result<(), TransportError> {
        send_to(&self.outbound, encode(message)?)
    }
}

/// Receiving half of the content endpoint
pub struct ContentReceiver {
    inbound: Receiver<String>,
}

impl PayloadReceiver for ContentReceiver {
    fn recv(&self) -> Result<String, TransportError> {
        recv_from(&self.inbound)
    }

    fn try_recv(&self) -> Result<Option<String>, TransportError> {
        try_recv_from(&self.inbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use midibridge_protocol::{decode, PortDescriptor, PortId, PortType};

    #[test]
    fn roundtrip_both_directions() {
        let (host, content) = InMemoryChannel::new();

        content.send(&ContentMessage::Connect).unwrap();
        let payload = host.recv().unwrap();
        assert_eq!(decode::<ContentMessage>(&payload).unwrap(), ContentMessage::Connect);

        let msg = HostMessage::state_change(PortDescriptor::connected("3", PortType::Input));
        host.send(&msg).unwrap();
        let payload = content.recv().unwrap();
        assert_eq!(decode::<HostMessage>(&payload).unwrap(), msg);
    }

    #[test]
    fn preserves_order_per_direction() {
        let (host, content) = InMemoryChannel::new();
        let (sender, _receiver) = host.split();

        for n in 0..5u8 {
            sender
                .send(&HostMessage::MidiMessage {
                    port_id: PortId::from("1"),
                    data: vec![0x90, n, 1],
                })
                .unwrap();
        }

        for n in 0..5u8 {
            let msg: HostMessage = decode(&content.recv().unwrap()).unwrap();
            match msg {
                HostMessage::MidiMessage { data, .. } => assert_eq!(data[1], n),
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert!(content.try_recv().unwrap().is_none());
    }

    #[test]
    fn dropped_peer_disconnects() {
        let (host, content) = InMemoryChannel::new();
        drop(content);
        assert!(matches!(
            host.send(&HostMessage::state_change(PortDescriptor::connected(
                "1",
                PortType::Output
            ))),
            Err(TransportError::Disconnected)
        ));
        assert!(matches!(host.try_recv(), Err(TransportError::Disconnected)));
    }
}
