//! Host API bindings for JavaScript
//!
//! Scripts never hold engine objects. Access handles live in a table keyed by
//! access id, and observer callbacks are queued as events that the script
//! collects with `midi.poll`.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use midibridge_engine::{AccessOptions, ContentEngine, MidiAccess, MidiInput};
use midibridge_protocol::{PortDescriptor, PortId, PortType};
use serde::Serialize;

/// Observer callback queued for the script
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ScriptEvent {
    #[serde(rename = "statechange")]
    StateChange { port: PortDescriptor },
    #[serde(rename = "midimessage")]
    MidiMessage {
        #[serde(rename = "portID")]
        port_id: PortId,
        #[serde(rename = "receivedTime")]
        received_time: f64,
        data: Vec<u8>,
    },
}

type EventQueue = Rc<RefCell<VecDeque<ScriptEvent>>>;

struct ScriptAccess {
    access: MidiAccess,
    events: EventQueue,
}

/// State shared by every binding during one script run
pub struct ScriptBridge {
    engine: ContentEngine,
    accesses: RefCell<BTreeMap<u64, ScriptAccess>>,
    pump: RefCell<Box<dyn FnMut()>>,
    output: RefCell<String>,
}

impl ScriptBridge {
    /// `pump` lets pending traffic through in both directions; it runs on
    /// `time.sleep` and `midi.poll`
    pub fn new(engine: ContentEngine, pump: impl FnMut() + 'static) -> Self {
        Self {
            engine,
            accesses: RefCell::new(BTreeMap::new()),
            pump: RefCell::new(Box::new(pump)),
            output: RefCell::new(String::new()),
        }
    }

    pub fn engine(&self) -> &ContentEngine {
        &self.engine
    }

    pub fn pump(&self) {
        match self.pump.try_borrow_mut() {
            Ok(mut pump) => pump(),
            Err(_) => tracing::debug!("Pump already running"),
        }
    }

    /// Append a line to the script output and forward it to the host
    pub fn print(&self, text: &str) {
        {
            let mut out = self.output.borrow_mut();
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(text);
        }
        self.engine.log(text);
    }

    pub fn output(&self) -> String {
        self.output.borrow().clone()
    }

    pub fn access_count(&self) -> usize {
        self.accesses.borrow().len()
    }

    /// Returns the new handle's id, or `None` when the request is denied
    pub fn request_access(&self, sysex: bool) -> Option<u64> {
        let access = match self.engine.grant_access(AccessOptions { sysex }) {
            Ok(access) => access,
            Err(e) => {
                self.print(&format!("requestAccess failed: {e}"));
                return None;
            }
        };

        let events = EventQueue::default();
        watch(&access, &events);

        let id = access.id().0;
        self.accesses
            .borrow_mut()
            .insert(id, ScriptAccess { access, events });
        Some(id)
    }

    /// JSON array of the handle's port copies of one kind, in id order
    pub fn ports(&self, access_id: u64, kind: &str) -> Option<String> {
        let role = parse_port_kind(kind)?;
        let accesses = self.accesses.borrow();
        let access = &accesses.get(&access_id)?.access;

        let ports: Vec<PortDescriptor> = match role {
            PortType::Input => access.inputs().iter().map(|p| p.descriptor()).collect(),
            PortType::Output => access.outputs().iter().map(|p| p.descriptor()).collect(),
        };
        serde_json::to_string(&ports).ok()
    }

    /// Send through the handle's copy of an output port
    pub fn send(&self, access_id: u64, port_id: &str, bytes: &[i32]) -> bool {
        let Some(data) = to_bytes(bytes) else {
            self.print("send failed: bytes must be integers from 0 to 255");
            return false;
        };

        let output = self
            .accesses
            .borrow()
            .get(&access_id)
            .and_then(|entry| entry.access.output(&PortId::from(port_id)));
        let Some(output) = output else {
            tracing::debug!(access_id, port_id, "Send to a port this handle does not have");
            return false;
        };

        match output.send(&data) {
            Ok(()) => true,
            Err(e) => {
                self.print(&format!("send failed: {e}"));
                false
            }
        }
    }

    /// Pump, then hand over every event queued for the handle as a JSON array
    pub fn poll(&self, access_id: u64) -> Option<String> {
        self.pump();

        let queue = self.accesses.borrow().get(&access_id)?.events.clone();
        let events: Vec<ScriptEvent> = queue.borrow_mut().drain(..).collect();
        serde_json::to_string(&events).ok()
    }
}

/// Queue the handle's callbacks, including message callbacks for inputs that
/// appear later
fn watch(access: &MidiAccess, events: &EventQueue) {
    for input in access.inputs() {
        listen(&input, events.clone());
    }

    let handle = access.downgrade();
    let queue = events.clone();
    access.set_on_state_change(move |event| {
        let port = event.port.descriptor();
        if port.port_type == PortType::Input {
            if let Some(input) = handle.upgrade().and_then(|a| a.input(&port.id)) {
                listen(&input, queue.clone());
            }
        }
        queue.borrow_mut().push_back(ScriptEvent::StateChange { port });
    });
}

fn listen(input: &MidiInput, events: EventQueue) {
    let port_id = input.id();
    input.set_on_midi_message(move |event| {
        events.borrow_mut().push_back(ScriptEvent::MidiMessage {
            port_id: port_id.clone(),
            received_time: event.received_time,
            data: event.data.clone(),
        });
    });
}

/// Parse a port kind string from JavaScript
pub fn parse_port_kind(kind: &str) -> Option<PortType> {
    match kind.to_lowercase().as_str() {
        "input" | "inputs" | "in" => Some(PortType::Input),
        "output" | "outputs" | "out" => Some(PortType::Output),
        _ => None,
    }
}

/// Convert script numbers to message bytes; any value outside 0-255 rejects
/// the whole message
pub fn to_bytes(values: &[i32]) -> Option<Vec<u8>> {
    values.iter().map(|v| u8::try_from(*v).ok()).collect()
}

/// TypeScript definition for the host API
pub const TYPESCRIPT_DEFINITIONS: &str = r#"
/**
 * Midibridge Host API
 *
 * This API is available to scripts running in the Midibridge sandbox.
 */

interface PortDescriptor {
    id: string;
    manufacturer: string | null;
    name: string | null;
    type: "input" | "output";
    version: string;
    state: "connected" | "disconnected";
    connection: "open" | "closed" | "pending";
}

type BridgeEvent =
    | { type: "statechange"; port: PortDescriptor }
    | { type: "midimessage"; portID: string; receivedTime: number; data: number[] };

declare namespace midi {
    /**
     * Create a new access handle. Ports arrive after the first round trip
     * to the host, so poll or sleep before reading them.
     * @param sysex Ask for permission to send system-exclusive messages
     * @returns The handle id, or null if the request was denied
     */
    function requestAccess(sysex?: boolean): number | null;

    /**
     * List the handle's own port copies.
     * @param access Handle id
     * @param kind "input" or "output"
     * @returns JSON encoded PortDescriptor[], or null for an unknown handle or kind
     */
    function ports(access: number, kind: string): string | null;

    /**
     * Send bytes through the handle's copy of an output port.
     * @param access Handle id
     * @param portId Output port id
     * @param bytes Integers from 0 to 255
     * @returns true if the message was handed to the host
     */
    function send(access: number, portId: string, bytes: number[]): boolean;

    /**
     * Deliver pending traffic, then take the handle's queued events.
     * @param access Handle id
     * @returns JSON encoded BridgeEvent[], or null for an unknown handle
     */
    function poll(access: number): string | null;
}

declare namespace time {
    /**
     * Sleep for a duration, then deliver pending traffic.
     * @param ms Duration in milliseconds (capped by the host)
     */
    function sleep(ms: number): void;

    /**
     * Milliseconds since the bridge started; the clock used for receivedTime.
     */
    function now(): number;
}

declare namespace console {
    /**
     * Log a message to the script output and the host log.
     */
    function log(...args: any[]): void;
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use midibridge_engine::{ContentEndpoint, InMemoryChannel, LocalBridge, PayloadReceiver};
    use midibridge_platform::{EndpointSpec, MemoryBackend};
    use midibridge_policy::Policy;
    use midibridge_protocol::{decode, ContentMessage};

    fn local_bridge() -> (MemoryBackend, Rc<LocalBridge<MemoryBackend>>, ScriptBridge) {
        let backend = MemoryBackend::new();
        backend.plug(
            "Synth",
            vec![EndpointSpec::named("Synth In").with_id(1)],
            vec![EndpointSpec::named("Synth Out").with_id(2)],
        );
        let local = Rc::new(LocalBridge::new(backend.clone(), Policy::default()));
        let pump = local.clone();
        let bridge = ScriptBridge::new(local.engine().clone(), move || {
            pump.poll().unwrap();
        });
        (backend, local, bridge)
    }

    #[test]
    fn test_parse_port_kind() {
        assert_eq!(parse_port_kind("input"), Some(PortType::Input));
        assert_eq!(parse_port_kind("Outputs"), Some(PortType::Output));
        assert_eq!(parse_port_kind("sideways"), None);
    }

    #[test]
    fn test_to_bytes() {
        assert_eq!(to_bytes(&[0x90, 60, 127]), Some(vec![0x90, 60, 127]));
        assert_eq!(to_bytes(&[]), Some(vec![]));
        assert_eq!(to_bytes(&[0x90, 256]), None);
        assert_eq!(to_bytes(&[-1]), None);
    }

    #[test]
    fn event_json_shape() {
        let event = ScriptEvent::MidiMessage {
            port_id: PortId::from("1"),
            received_time: 1.5,
            data: vec![0x90, 60, 1],
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "midimessage");
        assert_eq!(json["portID"], "1");
        assert_eq!(json["receivedTime"], 1.5);
    }

    #[test]
    fn poll_collects_arrivals_and_messages() {
        let (_backend, local, bridge) = local_bridge();
        let id = bridge.request_access(false).unwrap();

        let events: Vec<serde_json::Value> =
            serde_json::from_str(&bridge.poll(id).unwrap()).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e["type"] == "statechange"));

        // The input arrived after the handle was created and must still be heard
        local.inject(&PortId::from("1"), vec![0x90, 60, 100]);
        let events: Vec<serde_json::Value> =
            serde_json::from_str(&bridge.poll(id).unwrap()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "midimessage");
        assert_eq!(events[0]["data"], serde_json::json!([0x90, 60, 100]));

        assert_eq!(bridge.poll(id).unwrap(), "[]");
        assert!(bridge.poll(id + 1).is_none());
    }

    #[test]
    fn send_reaches_backend() {
        let (backend, _local, bridge) = local_bridge();
        let id = bridge.request_access(false).unwrap();
        bridge.pump();

        let outputs: Vec<PortDescriptor> =
            serde_json::from_str(&bridge.ports(id, "output").unwrap()).unwrap();
        assert_eq!(outputs.len(), 1);

        assert!(bridge.send(id, "2", &[0xB0, 7, 100]));
        assert!(!bridge.send(id, "2", &[0xB0, 7, 300]));
        assert!(!bridge.send(id, "1", &[0xB0, 7, 100]));
        bridge.pump();

        let sent = backend.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data, vec![0xB0, 7, 100]);
    }

    #[test]
    fn print_forwards_to_host() {
        let (host, content): (_, ContentEndpoint) = InMemoryChannel::new();
        let engine = ContentEngine::new(content, Policy::default());
        let bridge = ScriptBridge::new(engine, || {});

        bridge.print("hello");
        bridge.print("world");
        assert_eq!(bridge.output(), "hello\nworld");

        let msg: ContentMessage = decode(&host.try_recv().unwrap().unwrap()).unwrap();
        assert_eq!(msg, ContentMessage::log("hello"));
    }

    #[test]
    fn denied_access_is_reported() {
        let (_host, content): (_, ContentEndpoint) = InMemoryChannel::new();
        let bridge = ScriptBridge::new(ContentEngine::new(content, Policy::default()), || {});

        assert!(bridge.request_access(true).is_none());
        assert_eq!(bridge.access_count(), 0);
        assert!(bridge.output().starts_with("requestAccess failed"));
    }

    #[test]
    fn definitions_cover_every_binding() {
        for name in [
            "function requestAccess(",
            "function ports(",
            "function send(",
            "function poll(",
            "function sleep(",
            "function now(",
            "function log(",
        ] {
            assert!(TYPESCRIPT_DEFINITIONS.contains(name), "missing {name}");
        }
    }
}
