//! Native port registry
//!
//! The single producer of ground truth about native ports. Translates device
//! enumeration, hot-plug and inbound traffic into host messages, and routes
//! outbound writes back to the native destination.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use midibridge_platform::{EndpointRef, MidiBackend, PlatformError, Property};
use midibridge_protocol::{HostMessage, PortDescriptor, PortId, PortType};

use crate::HostToContent;

/// A port produced by one enumeration pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumeratedPort {
    pub descriptor: PortDescriptor,
    pub endpoint: EndpointRef,
}

impl EnumeratedPort {
    pub fn role(&self) -> PortType {
        self.descriptor.port_type
    }
}

/// One pass over the device list
#[derive(Debug, Default)]
struct Scan {
    ports: Vec<EnumeratedPort>,
    /// Endpoints still listed whose properties could not be read
    unreadable: BTreeSet<EndpointRef>,
}

/// Last reported state of a port, plus its endpoint while present
#[derive(Debug, Clone)]
struct KnownPort {
    descriptor: PortDescriptor,
    endpoint: Option<EndpointRef>,
}

/// Registry of every port observed during this process lifetime
pub struct PortRegistry<B, S> {
    backend: B,
    sender: S,
    /// Ports are never removed; vanished ports stay as disconnected
    known: BTreeMap<PortId, KnownPort>,
    /// Set once the script context has asked for the port list
    connected: bool,
}

impl<B: MidiBackend, S: HostToContent> PortRegistry<B, S> {
    pub fn new(backend: B, sender: S) -> Self {
        Self {
            backend,
            sender,
            known: BTreeMap::new(),
            connected: false,
        }
    }

    /// Whether the script context has sent `connect`
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Query the native device list once
    ///
    /// Yields one port per device source (input) and destination (output).
    /// A port whose properties cannot be read is skipped; the rest of the
    /// enumeration continues.
    pub fn enumerate(&self) -> Result<Vec<EnumeratedPort>, PlatformError> {
        Ok(self.scan()?.ports)
    }

    fn scan(&self) -> Result<Scan, PlatformError> {
        let devices = self.backend.devices()?;
        let mut scan = Scan::default();

        for device in &devices {
            let roles = device
                .destinations
                .iter()
                .map(|e| (*e, PortType::Output))
                .chain(device.sources.iter().map(|e| (*e, PortType::Input)));

            for (endpoint, role) in roles {
                match self.describe(endpoint, role) {
                    Ok(descriptor) => scan.ports.push(EnumeratedPort {
                        descriptor,
                        endpoint,
                    }),
                    Err(e) => {
                        tracing::warn!(
                            device = %device.name,
                            %endpoint,
                            error = %e,
                            "Skipping port whose properties could not be read"
                        );
                        scan.unreadable.insert(endpoint);
                    }
                }
            }
        }

        Ok(scan)
    }

    fn describe(&self, endpoint: EndpointRef, role: PortType) -> Result<PortDescriptor, PlatformError> {
        let id = self.backend.unique_id(endpoint)?;
        let manufacturer = self.backend.string_property(endpoint, Property::Manufacturer)?;
        let name = self.backend.string_property(endpoint, Property::Name)?;

        Ok(PortDescriptor {
            manufacturer,
            name,
            ..PortDescriptor::connected(id.to_string(), role)
        })
    }

    /// Handle a `connect` request from the script context
    ///
    /// Re-enumerates and reports every port, changed or not, including ports
    /// that were seen earlier and have since vanished. Returns the number of
    /// state changes emitted.
    pub fn on_connect_requested(&mut self) -> usize {
        self.connected = true;
        let Some(scan) = self.scan_logged() else {
            return 0;
        };

        let present = scan.ports.len();
        let unreadable = self.absorb(scan);
        let reports: Vec<PortDescriptor> = self
            .known
            .iter()
            .filter(|(id, _)| !unreadable.contains(*id))
            .map(|(_, port)| port.descriptor.clone())
            .collect();

        tracing::info!(
            present,
            total = reports.len(),
            "Reporting all ports to script context"
        );
        self.emit_all(reports)
    }

    /// Re-enumerate and report only what changed since the last report
    ///
    /// New ports, ports whose properties differ, and ports that vanished are
    /// reported. Returns the number of state changes emitted. Nothing is
    /// reported before the script context has connected.
    pub fn refresh(&mut self) -> usize {
        if !self.connected {
            tracing::debug!("Skipping refresh before connect");
            return 0;
        }
        let Some(scan) = self.scan_logged() else {
            return 0;
        };

        let before: BTreeMap<PortId, PortDescriptor> = self
            .known
            .iter()
            .map(|(id, port)| (id.clone(), port.descriptor.clone()))
            .collect();
        self.absorb(scan);

        let reports: Vec<PortDescriptor> = self
            .known
            .iter()
            .filter(|(id, port)| before.get(*id) != Some(&port.descriptor))
            .map(|(_, port)| port.descriptor.clone())
            .collect();

        if !reports.is_empty() {
            tracing::info!(changed = reports.len(), "Port changes detected");
        }
        self.emit_all(reports)
    }

    fn scan_logged(&self) -> Option<Scan> {
        match self.scan() {
            Ok(scan) => Some(scan),
            Err(e) => {
                tracing::warn!(error = %e, "Device enumeration failed");
                None
            }
        }
    }

    /// Merge a scan into the known set. Ports whose endpoint left the device
    /// list become disconnected; ports that could not be read keep their last
    /// state. Returns the ids of known ports that could not be read.
    fn absorb(&mut self, scan: Scan) -> BTreeSet<PortId> {
        let mut seen = BTreeSet::new();

        for port in scan.ports {
            let id = port.descriptor.id.clone();
            if !self.known.contains_key(&id) {
                tracing::info!(port_id = %id, role = port.role().as_str(), "Discovered port");
            }
            seen.insert(id.clone());
            self.known.insert(
                id,
                KnownPort {
                    descriptor: port.descriptor,
                    endpoint: Some(port.endpoint),
                },
            );
        }

        let mut unreadable = BTreeSet::new();
        for (id, port) in self.known.iter_mut() {
            let Some(endpoint) = port.endpoint else {
                continue;
            };
            if seen.contains(id) {
                continue;
            }
            if scan.unreadable.contains(&endpoint) {
                tracing::debug!(port_id = %id, "Holding last state of unreadable port");
                unreadable.insert(id.clone());
            } else {
                tracing::info!(port_id = %id, "Port vanished");
                port.endpoint = None;
                port.descriptor = port.descriptor.disconnected();
            }
        }

        unreadable
    }

    fn emit_all(&self, reports: Vec<PortDescriptor>) -> usize {
        let mut emitted = 0;
        for descriptor in reports {
            let port_id = descriptor.id.clone();
            match self.sender.send(&HostMessage::state_change(descriptor)) {
                Ok(()) => emitted += 1,
                Err(e) => {
                    tracing::warn!(port_id = %port_id, error = %e, "Failed to report port state");
                }
            }
        }
        emitted
    }

    /// Forward one message received on a native source
    ///
    /// Every native message becomes exactly one `midimessage`, in arrival order.
    pub fn on_native_inbound(&self, port_id: &PortId, data: Vec<u8>, timestamp: u64) {
        tracing::trace!(port_id = %port_id, len = data.len(), timestamp, "Inbound message");
        let message = HostMessage::MidiMessage {
            port_id: port_id.clone(),
            data,
        };
        if let Err(e) = self.sender.send(&message) {
            tracing::warn!(port_id = %port_id, error = %e, "Failed to forward inbound message");
        }
    }

    /// Write bytes requested by the script context to a native destination
    ///
    /// Unknown, vanished, or non-output ports are dropped without a report.
    pub fn on_outbound_send(&self, port_id: &PortId, data: &[u8]) {
        let endpoint = self
            .known
            .get(port_id)
            .filter(|port| port.descriptor.port_type == PortType::Output)
            .and_then(|port| port.endpoint);

        let Some(endpoint) = endpoint else {
            tracing::debug!(port_id = %port_id, "Dropping send to unknown output port");
            return;
        };

        if let Err(e) = self.backend.send(endpoint, data) {
            tracing::warn!(port_id = %port_id, error = %e, "Native write failed");
        }
    }

    /// Last reported descriptor of every port ever seen, in id order
    pub fn ports(&self) -> Vec<PortDescriptor> {
        self.known
            .values()
            .map(|port| port.descriptor.clone())
            .collect()
    }
}

/// Thread-safe registry wrapper; serializes emissions from native threads
pub type SharedRegistry<B, S> = Arc<Mutex<PortRegistry<B, S>>>;

pub fn new_shared_registry<B: MidiBackend, S: HostToContent>(
    backend: B,
    sender: S,
) -> SharedRegistry<B, S> {
    Arc::new(Mutex::new(PortRegistry::new(backend, sender)))
}
