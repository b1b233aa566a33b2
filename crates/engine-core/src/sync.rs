//! Content-side synchronization engine
//!
//! Owns the canonical port map of one script context and replicates every
//! host update into each live access handle's own copies.
//!
//! Per port id the content side knows two states: unknown (no entry) and
//! known. The first `statechange` for an id creates it, as a new port, in the
//! canonical map and in every handle. Later ones mutate it in place. A port is
//! never removed; disconnection is only a property change.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::{Rc, Weak};
use std::time::Instant;

use midibridge_policy::{Policy, PolicyDecision};
use midibridge_protocol::{
    decode, AccessId, ContentMessage, HostMessage, PortDescriptor, PortId, PortType,
};

use crate::access::{AccessShared, HandleContext};
use crate::{
    AccessError, AccessOptions, ConnectionEvent, ContentToHost, MessageEvent, MidiAccess,
    PayloadReceiver, TransportError,
};

/// Source of truth for port state inside the script context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalPortMap {
    inputs: BTreeMap<PortId, PortDescriptor>,
    outputs: BTreeMap<PortId, PortDescriptor>,
}

impl CanonicalPortMap {
    pub fn inputs(&self) -> impl Iterator<Item = &PortDescriptor> {
        self.inputs.values()
    }

    pub fn outputs(&self) -> impl Iterator<Item = &PortDescriptor> {
        self.outputs.values()
    }

    pub fn get(&self, role: PortType, id: &PortId) -> Option<&PortDescriptor> {
        self.map(role).get(id)
    }

    pub fn len(&self) -> usize {
        self.inputs.len() + self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn map(&self, role: PortType) -> &BTreeMap<PortId, PortDescriptor> {
        match role {
            PortType::Input => &self.inputs,
            PortType::Output => &self.outputs,
        }
    }

    fn map_mut(&mut self, role: PortType) -> &mut BTreeMap<PortId, PortDescriptor> {
        match role {
            PortType::Input => &mut self.inputs,
            PortType::Output => &mut self.outputs,
        }
    }
}

/// Outcome of merging a `statechange` into the canonical map
enum Merge {
    New,
    Updated { state_changed: bool },
}

struct EngineState {
    canonical: RefCell<CanonicalPortMap>,
    handles: RefCell<Vec<Weak<AccessShared>>>,
    channel: Rc<dyn ContentToHost>,
    policy: Rc<Policy>,
    next_access_id: Cell<u64>,
    connect_sent: Cell<bool>,
    /// Messages that arrived while another one was being dispatched
    pending: RefCell<VecDeque<HostMessage>>,
    dispatching: Cell<bool>,
    epoch: Instant,
}

/// One engine per script context; clones share it
#[derive(Clone)]
pub struct ContentEngine {
    state: Rc<EngineState>,
}

impl ContentEngine {
    pub fn new(channel: impl ContentToHost + 'static, policy: Policy) -> Self {
        Self {
            state: Rc::new(EngineState {
                canonical: RefCell::new(CanonicalPortMap::default()),
                handles: RefCell::new(Vec::new()),
                channel: Rc::new(channel),
                policy: Rc::new(policy),
                next_access_id: Cell::new(0),
                connect_sent: Cell::new(false),
                pending: RefCell::new(VecDeque::new()),
                dispatching: Cell::new(false),
                epoch: Instant::now(),
            }),
        }
    }

    /// Create a new access handle
    ///
    /// The handle starts with copies of every port known right now. The first
    /// handle ever created asks the host to enumerate; the ports then arrive
    /// through later `statechange` messages.
    pub async fn request_access(&self, options: AccessOptions) -> Result<MidiAccess, AccessError> {
        self.grant_access(options)
    }

    /// Synchronous core of [`ContentEngine::request_access`], for callers
    /// that are not running an executor
    pub fn grant_access(&self, options: AccessOptions) -> Result<MidiAccess, AccessError> {
        if let PolicyDecision::Deny(reason) = self.state.policy.check_access(options.sysex) {
            tracing::warn!(code = %reason.code, "Access request denied");
            return Err(AccessError::PolicyDenied(reason));
        }

        let access_id = AccessId(self.state.next_access_id.get());
        self.state.next_access_id.set(access_id.0 + 1);

        let context = Rc::new(HandleContext {
            access_id,
            sysex_enabled: options.sysex,
            policy: self.state.policy.clone(),
            channel: self.state.channel.clone(),
        });

        let shared = {
            let canonical = self.state.canonical.borrow();
            Rc::new(AccessShared::new(
                context,
                canonical.inputs.values().cloned(),
                canonical.outputs.values().cloned(),
            ))
        };
        self.state.handles.borrow_mut().push(Rc::downgrade(&shared));
        tracing::info!(%access_id, sysex = options.sysex, "Created access handle");

        if !self.state.connect_sent.get() {
            match self.state.channel.send(&ContentMessage::Connect) {
                Ok(()) => self.state.connect_sent.set(true),
                Err(e) => tracing::warn!(error = %e, "Failed to request port enumeration"),
            }
        }

        Ok(MidiAccess { shared })
    }

    /// Decode and apply one payload from the host
    ///
    /// Malformed payloads are dropped and reported back as a `log` message;
    /// they never touch port state.
    pub fn receive(&self, payload: &str) {
        match decode::<HostMessage>(payload) {
            Ok(message) => self.apply(message),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed host message");
                tracing::trace!(payload, "Malformed payload");
                self.log(format!("receiveMessage error: {e}"));
            }
        }
    }

    /// Drain every payload currently queued on the channel
    ///
    /// Returns how many payloads were processed.
    pub fn pump(&self, receiver: &impl PayloadReceiver) -> Result<usize, TransportError> {
        let mut count = 0;
        while let Some(payload) = receiver.try_recv()? {
            self.receive(&payload);
            count += 1;
        }
        Ok(count)
    }

    /// Apply one decoded host message
    ///
    /// A message that arrives while another is being dispatched (for example
    /// from inside an observer) is queued and applied after it, so fan-outs
    /// never interleave.
    pub fn apply(&self, message: HostMessage) {
        self.state.pending.borrow_mut().push_back(message);
        if self.state.dispatching.replace(true) {
            return;
        }

        loop {
            let next = self.state.pending.borrow_mut().pop_front();
            let Some(message) = next else {
                break;
            };
            match message {
                HostMessage::StateChange { properties } => self.on_state_change(properties),
                HostMessage::MidiMessage { port_id, data } => self.on_midi_message(port_id, data),
            }
        }

        self.state.dispatching.set(false);
    }

    /// Forward diagnostic text to the host
    pub fn log(&self, value: impl Into<String>) {
        if let Err(e) = self.state.channel.send(&ContentMessage::log(value)) {
            tracing::debug!(error = %e, "Failed to forward log message");
        }
    }

    /// Snapshot of the canonical map
    pub fn canonical(&self) -> CanonicalPortMap {
        self.state.canonical.borrow().clone()
    }

    /// Number of handles still referenced by the script
    pub fn live_access_count(&self) -> usize {
        self.live_handles().len()
    }

    /// Milliseconds since this engine was created
    pub fn now(&self) -> f64 {
        self.state.epoch.elapsed().as_secs_f64() * 1000.0
    }

    fn live_handles(&self) -> Vec<Rc<AccessShared>> {
        let mut handles = self.state.handles.borrow_mut();
        handles.retain(|handle| handle.strong_count() > 0);
        handles.iter().filter_map(Weak::upgrade).collect()
    }

    fn merge(&self, properties: &PortDescriptor) -> Merge {
        let mut canonical = self.state.canonical.borrow_mut();
        let map = canonical.map_mut(properties.port_type);
        match map.get_mut(&properties.id) {
            None => {
                map.insert(properties.id.clone(), properties.clone());
                Merge::New
            }
            Some(existing) => {
                let state_changed = existing.state_differs(properties);
                *existing = properties.clone();
                Merge::Updated { state_changed }
            }
        }
    }

    fn on_state_change(&self, properties: PortDescriptor) {
        let merge = self.merge(&properties);
        let handles = self.live_handles();

        match merge {
            Merge::New => {
                tracing::info!(
                    port_id = %properties.id,
                    role = properties.port_type.as_str(),
                    handles = handles.len(),
                    "Created new port"
                );
                for handle in &handles {
                    let port = handle.insert_copy(&properties);
                    handle.notify_state_change(&ConnectionEvent { port });
                }
            }
            Merge::Updated { state_changed } => {
                tracing::debug!(
                    port_id = %properties.id,
                    state_changed,
                    "Updated port"
                );
                for handle in &handles {
                    match handle.port(properties.port_type, &properties.id) {
                        Some(port) => {
                            port.apply(&properties);
                            if state_changed {
                                let event = ConnectionEvent { port: port.clone() };
                                port.notify_state_change(&event);
                                handle.notify_state_change(&event);
                            }
                        }
                        None => {
                            let port = handle.insert_copy(&properties);
                            handle.notify_state_change(&ConnectionEvent { port });
                        }
                    }
                }
            }
        }
    }

    fn on_midi_message(&self, port_id: PortId, data: Vec<u8>) {
        let event = MessageEvent {
            received_time: self.now(),
            data,
        };

        let mut delivered = 0;
        for handle in self.live_handles() {
            if let Some(input) = handle.input(&port_id) {
                if input.notify_midi_message(&event) {
                    delivered += 1;
                }
            }
        }
        tracing::debug!(port_id = %port_id, delivered, "Routed inbound message");
    }
}
