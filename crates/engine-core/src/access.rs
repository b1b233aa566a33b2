//! Script-facing access handles and ports
//!
//! Every access handle owns its own copy of each port. Two handles that see
//! the "same" port hold two independent cells, so observers registered
//! through one handle never affect the other.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Deref;
use std::rc::{Rc, Weak};

use midibridge_policy::{Policy, PolicyDecision};
use midibridge_protocol::{
    AccessId, ConnectionState, ContentMessage, PolicyDenialReason, PortDescriptor, PortId,
    PortState, PortType,
};

use crate::ContentToHost;

/// Boxed observer callback
pub type Observer<E> = Box<dyn FnMut(&E)>;

/// Options for an access request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessOptions {
    /// Ask for permission to send system-exclusive messages
    pub sysex: bool,
}

/// Errors surfaced to scripts
#[derive(Debug, Clone, thiserror::Error)]
pub enum AccessError {
    #[error("Denied by policy: {0}")]
    PolicyDenied(PolicyDenialReason),
}

/// A port's state changed, or a port appeared
#[derive(Clone)]
pub struct ConnectionEvent {
    /// The copy of the port owned by the handle receiving the event
    pub port: MidiPort,
}

/// Bytes received on an input port
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    /// Milliseconds since the content engine started, monotonic
    pub received_time: f64,
    pub data: Vec<u8>,
}

/// Per-handle context shared by all of its ports
pub(crate) struct HandleContext {
    pub(crate) access_id: AccessId,
    pub(crate) sysex_enabled: bool,
    pub(crate) policy: Rc<Policy>,
    pub(crate) channel: Rc<dyn ContentToHost>,
}

/// Observer storage that survives its observer replacing or clearing it
/// mid-call
struct ObserverSlot<E> {
    observer: Option<Observer<E>>,
    /// Bumped on every `set`
    generation: u64,
}

impl<E> Default for ObserverSlot<E> {
    fn default() -> Self {
        Self {
            observer: None,
            generation: 0,
        }
    }
}

impl<E> ObserverSlot<E> {
    fn set(&mut self, observer: Option<Observer<E>>) {
        self.observer = observer;
        self.generation += 1;
    }

    fn take(&mut self) -> Option<(Observer<E>, u64)> {
        let generation = self.generation;
        self.observer.take().map(|observer| (observer, generation))
    }

    /// Put a taken observer back unless the slot was set while it ran
    fn restore(&mut self, observer: Observer<E>, generation: u64) {
        if self.generation == generation {
            self.observer = Some(observer);
        }
    }
}

struct PortCell {
    descriptor: PortDescriptor,
    on_state_change: ObserverSlot<ConnectionEvent>,
    on_midi_message: ObserverSlot<MessageEvent>,
}

/// One handle's copy of a port
#[derive(Clone)]
pub struct MidiPort {
    cell: Rc<RefCell<PortCell>>,
    context: Rc<HandleContext>,
}

impl MidiPort {
    pub(crate) fn new(descriptor: PortDescriptor, context: Rc<HandleContext>) -> Self {
        Self {
            cell: Rc::new(RefCell::new(PortCell {
                descriptor,
                on_state_change: ObserverSlot::default(),
                on_midi_message: ObserverSlot::default(),
            })),
            context,
        }
    }

    pub fn id(&self) -> PortId {
        self.cell.borrow().descriptor.id.clone()
    }

    pub fn name(&self) -> Option<String> {
        self.cell.borrow().descriptor.name.clone()
    }

    pub fn manufacturer(&self) -> Option<String> {
        self.cell.borrow().descriptor.manufacturer.clone()
    }

    pub fn version(&self) -> String {
        self.cell.borrow().descriptor.version.clone()
    }

    pub fn port_type(&self) -> PortType {
        self.cell.borrow().descriptor.port_type
    }

    pub fn state(&self) -> PortState {
        self.cell.borrow().descriptor.state
    }

    pub fn connection(&self) -> ConnectionState {
        self.cell.borrow().descriptor.connection
    }

    /// Snapshot of every property
    pub fn descriptor(&self) -> PortDescriptor {
        self.cell.borrow().descriptor.clone()
    }

    /// Handle this copy belongs to
    pub fn access_id(&self) -> AccessId {
        self.context.access_id
    }

    /// True when both values refer to the same copy
    pub fn same_copy(&self, other: &MidiPort) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }

    pub fn set_on_state_change(&self, observer: impl FnMut(&ConnectionEvent) + 'static) {
        self.cell.borrow_mut().on_state_change.set(Some(Box::new(observer)));
    }

    pub fn clear_on_state_change(&self) {
        self.cell.borrow_mut().on_state_change.set(None);
    }

    /// Resolves immediately; native open state is not modeled
    pub async fn open(&self) -> MidiPort {
        self.clone()
    }

    /// Resolves immediately; native close state is not modeled
    pub async fn close(&self) -> MidiPort {
        self.clone()
    }

    /// Overwrite every property
    pub(crate) fn apply(&self, properties: &PortDescriptor) {
        self.cell.borrow_mut().descriptor = properties.clone();
    }

    #[cfg(test)]
    pub(crate) fn descriptor_mut(&self) -> std::cell::RefMut<'_, PortDescriptor> {
        std::cell::RefMut::map(self.cell.borrow_mut(), |cell| &mut cell.descriptor)
    }

    pub(crate) fn notify_state_change(&self, event: &ConnectionEvent) {
        // The observer is taken out while it runs so it may touch this port.
        let taken = self.cell.borrow_mut().on_state_change.take();
        if let Some((mut observer, generation)) = taken {
            observer(event);
            self.cell
                .borrow_mut()
                .on_state_change
                .restore(observer, generation);
        }
    }

    pub(crate) fn notify_midi_message(&self, event: &MessageEvent) -> bool {
        let taken = self.cell.borrow_mut().on_midi_message.take();
        let Some((mut observer, generation)) = taken else {
            return false;
        };
        observer(event);
        self.cell
            .borrow_mut()
            .on_midi_message
            .restore(observer, generation);
        true
    }
}

impl std::fmt::Debug for MidiPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidiPort")
            .field("access", &self.context.access_id)
            .field("descriptor", &self.cell.borrow().descriptor)
            .finish()
    }
}

/// Input port copy
#[derive(Debug, Clone)]
pub struct MidiInput(MidiPort);

impl MidiInput {
    pub(crate) fn new(port: MidiPort) -> Self {
        Self(port)
    }

    pub fn set_on_midi_message(&self, observer: impl FnMut(&MessageEvent) + 'static) {
        self.0.cell.borrow_mut().on_midi_message.set(Some(Box::new(observer)));
    }

    pub fn clear_on_midi_message(&self) {
        self.0.cell.borrow_mut().on_midi_message.set(None);
    }

    pub fn port(&self) -> &MidiPort {
        &self.0
    }
}

impl Deref for MidiInput {
    type Target = MidiPort;

    fn deref(&self) -> &MidiPort {
        &self.0
    }
}

/// Output port copy
#[derive(Debug, Clone)]
pub struct MidiOutput(MidiPort);

impl MidiOutput {
    pub(crate) fn new(port: MidiPort) -> Self {
        Self(port)
    }

    /// Queue bytes for the native destination
    ///
    /// Returns once the message is handed to the channel; there is no native
    /// confirmation. A send to a port the host no longer knows is dropped by
    /// the host without an error here.
    pub fn send(&self, data: &[u8]) -> Result<(), AccessError> {
        let context = &self.0.context;
        if let PolicyDecision::Deny(reason) = context.policy.check_send(context.sysex_enabled, data) {
            tracing::warn!(
                access_id = %context.access_id,
                code = %reason.code,
                "Send denied by policy"
            );
            return Err(AccessError::PolicyDenied(reason));
        }

        let port_id = self.0.id();
        let message = ContentMessage::MidiOutput {
            port_id: port_id.clone(),
            data: data.to_vec(),
        };
        if let Err(e) = context.channel.send(&message) {
            tracing::warn!(port_id = %port_id, error = %e, "Failed to post outbound message");
        }
        Ok(())
    }

    /// Pending-queue clearing is not modeled
    pub fn clear(&self) {}

    pub fn port(&self) -> &MidiPort {
        &self.0
    }
}

impl Deref for MidiOutput {
    type Target = MidiPort;

    fn deref(&self) -> &MidiPort {
        &self.0
    }
}

/// State of one access handle; the content engine keeps a weak reference
pub(crate) struct AccessShared {
    pub(crate) context: Rc<HandleContext>,
    inputs: RefCell<BTreeMap<PortId, MidiInput>>,
    outputs: RefCell<BTreeMap<PortId, MidiOutput>>,
    on_state_change: RefCell<ObserverSlot<ConnectionEvent>>,
}

impl AccessShared {
    pub(crate) fn new(
        context: Rc<HandleContext>,
        inputs: impl IntoIterator<Item = PortDescriptor>,
        outputs: impl IntoIterator<Item = PortDescriptor>,
    ) -> Self {
        let shared = Self {
            context,
            inputs: RefCell::new(BTreeMap::new()),
            outputs: RefCell::new(BTreeMap::new()),
            on_state_change: RefCell::new(ObserverSlot::default()),
        };
        for descriptor in inputs.into_iter().chain(outputs) {
            shared.insert_copy(&descriptor);
        }
        shared
    }

    /// Create this handle's own copy of a port
    pub(crate) fn insert_copy(&self, properties: &PortDescriptor) -> MidiPort {
        let port = MidiPort::new(properties.clone(), self.context.clone());
        let id = properties.id.clone();
        match properties.port_type {
            PortType::Input => {
                self.inputs
                    .borrow_mut()
                    .insert(id, MidiInput::new(port.clone()));
            }
            PortType::Output => {
                self.outputs
                    .borrow_mut()
                    .insert(id, MidiOutput::new(port.clone()));
            }
        }
        port
    }

    pub(crate) fn port(&self, role: PortType, id: &PortId) -> Option<MidiPort> {
        match role {
            PortType::Input => self.input(id).map(|input| input.0),
            PortType::Output => self.outputs.borrow().get(id).map(|output| output.0.clone()),
        }
    }

    pub(crate) fn input(&self, id: &PortId) -> Option<MidiInput> {
        self.inputs.borrow().get(id).cloned()
    }

    pub(crate) fn notify_state_change(&self, event: &ConnectionEvent) {
        let taken = self.on_state_change.borrow_mut().take();
        if let Some((mut observer, generation)) = taken {
            observer(event);
            self.on_state_change
                .borrow_mut()
                .restore(observer, generation);
        }
    }
}

/// One script-side access handle
///
/// Clones share the handle. The handle lives until the last clone is dropped;
/// the content engine stops updating it from then on.
#[derive(Clone)]
pub struct MidiAccess {
    pub(crate) shared: Rc<AccessShared>,
}

impl MidiAccess {
    pub fn id(&self) -> AccessId {
        self.shared.context.access_id
    }

    pub fn sysex_enabled(&self) -> bool {
        self.shared.context.sysex_enabled
    }

    /// Input port copies in id order
    pub fn inputs(&self) -> Vec<MidiInput> {
        self.shared.inputs.borrow().values().cloned().collect()
    }

    /// Output port copies in id order
    pub fn outputs(&self) -> Vec<MidiOutput> {
        self.shared.outputs.borrow().values().cloned().collect()
    }

    pub fn input(&self, id: &PortId) -> Option<MidiInput> {
        self.shared.input(id)
    }

    pub fn output(&self, id: &PortId) -> Option<MidiOutput> {
        self.shared.outputs.borrow().get(id).cloned()
    }

    /// Observe port arrivals and state changes on this handle
    pub fn set_on_state_change(&self, observer: impl FnMut(&ConnectionEvent) + 'static) {
        self.shared
            .on_state_change
            .borrow_mut()
            .set(Some(Box::new(observer)));
    }

    pub fn clear_on_state_change(&self) {
        self.shared.on_state_change.borrow_mut().set(None);
    }

    /// Reference that does not keep the handle alive
    pub fn downgrade(&self) -> WeakMidiAccess {
        WeakMidiAccess {
            shared: Rc::downgrade(&self.shared),
        }
    }
}

/// Non-owning reference to an access handle, for observers that need to
/// reach back into their own handle
#[derive(Clone)]
pub struct WeakMidiAccess {
    shared: Weak<AccessShared>,
}

impl WeakMidiAccess {
    pub fn upgrade(&self) -> Option<MidiAccess> {
        self.shared.upgrade().map(|shared| MidiAccess { shared })
    }
}

impl std::fmt::Debug for MidiAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidiAccess")
            .field("id", &self.id())
            .field("inputs", &self.shared.inputs.borrow().len())
            .field("outputs", &self.shared.outputs.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContentEndpoint, InMemoryChannel, PayloadReceiver};
    use midibridge_protocol::decode;

    fn context(sysex: bool) -> (Rc<HandleContext>, crate::HostEndpoint) {
        let (host, content): (_, ContentEndpoint) = InMemoryChannel::new();
        let context = Rc::new(HandleContext {
            access_id: AccessId(0),
            sysex_enabled: sysex,
            policy: Rc::new(Policy::permissive()),
            channel: Rc::new(content),
        });
        (context, host)
    }

    #[test]
    fn send_posts_midioutput() {
        let (context, host) = context(false);
        let shared = AccessShared::new(
            context,
            vec![],
            vec![PortDescriptor::connected("8", PortType::Output)],
        );
        let access = MidiAccess {
            shared: Rc::new(shared),
        };

        let output = access.output(&PortId::from("8")).unwrap();
        output.send(&[0x90, 60, 127]).unwrap();
        output.clear();

        let msg: ContentMessage = decode(&host.try_recv().unwrap().unwrap()).unwrap();
        assert_eq!(
            msg,
            ContentMessage::MidiOutput {
                port_id: PortId::from("8"),
                data: vec![0x90, 60, 127],
            }
        );
    }

    #[test]
    fn weak_handle_does_not_keep_access_alive() {
        let (context, _host) = context(false);
        let access = MidiAccess {
            shared: Rc::new(AccessShared::new(context, vec![], vec![])),
        };
        let weak = access.downgrade();
        assert_eq!(weak.upgrade().map(|a| a.id()), Some(AccessId(0)));

        drop(access);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn sysex_send_needs_sysex_access() {
        let (context, host) = context(false);
        let shared = AccessShared::new(
            context,
            vec![],
            vec![PortDescriptor::connected("8", PortType::Output)],
        );
        let access = MidiAccess {
            shared: Rc::new(shared),
        };

        let output = access.output(&PortId::from("8")).unwrap();
        let result = output.send(&[0xF0, 0x7E, 0xF7]);
        assert!(matches!(result, Err(AccessError::PolicyDenied(_))));
        assert!(host.try_recv().unwrap().is_none());
    }

    #[test]
    fn observer_can_replace_itself() {
        let (context, _host) = context(false);
        let port = MidiPort::new(PortDescriptor::connected("1", PortType::Input), context);
        let calls = Rc::new(RefCell::new(Vec::new()));

        let inner_calls = calls.clone();
        let inner_port = port.clone();
        port.set_on_state_change(move |_| {
            inner_calls.borrow_mut().push("first");
            let calls = inner_calls.clone();
            inner_port.set_on_state_change(move |_| calls.borrow_mut().push("second"));
        });

        let event = ConnectionEvent { port: port.clone() };
        port.notify_state_change(&event);
        port.notify_state_change(&event);
        assert_eq!(*calls.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn observer_can_clear_itself() {
        let (context, _host) = context(false);
        let port = MidiPort::new(PortDescriptor::connected("1", PortType::Input), context);
        let calls = Rc::new(RefCell::new(0));

        let inner_calls = calls.clone();
        let inner_port = port.clone();
        port.set_on_state_change(move |_| {
            *inner_calls.borrow_mut() += 1;
            inner_port.clear_on_state_change();
        });

        let event = ConnectionEvent { port: port.clone() };
        port.notify_state_change(&event);
        port.notify_state_change(&event);
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn message_observer_can_clear_itself() {
        let (context, _host) = context(false);
        let input = MidiInput::new(MidiPort::new(
            PortDescriptor::connected("1", PortType::Input),
            context,
        ));
        let calls = Rc::new(RefCell::new(0));

        let inner_calls = calls.clone();
        let inner_input = input.clone();
        input.set_on_midi_message(move |_| {
            *inner_calls.borrow_mut() += 1;
            inner_input.clear_on_midi_message();
        });

        let event = MessageEvent {
            received_time: 0.0,
            data: vec![0x90, 60, 100],
        };
        assert!(input.notify_midi_message(&event));
        assert!(!input.notify_midi_message(&event));
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn access_observer_can_clear_itself() {
        let (context, _host) = context(false);
        let access = MidiAccess {
            shared: Rc::new(AccessShared::new(
                context,
                vec![PortDescriptor::connected("1", PortType::Input)],
                vec![],
            )),
        };
        let calls = Rc::new(RefCell::new(0));

        let inner_calls = calls.clone();
        let weak = access.downgrade();
        access.set_on_state_change(move |_| {
            *inner_calls.borrow_mut() += 1;
            if let Some(access) = weak.upgrade() {
                access.clear_on_state_change();
            }
        });

        let port = access.input(&PortId::from("1")).unwrap();
        let event = ConnectionEvent { port: port.port().clone() };
        access.shared.notify_state_change(&event);
        access.shared.notify_state_change(&event);
        assert_eq!(*calls.borrow(), 1);
    }

    #[tokio::test]
    async fn open_and_close_resolve_to_same_copy() {
        let (context, _host) = context(false);
        let port = MidiPort::new(PortDescriptor::connected("1", PortType::Input), context);
        assert!(port.open().await.same_copy(&port));
        assert!(port.close().await.same_copy(&port));
        assert_eq!(port.connection(), ConnectionState::Open);
    }
}
