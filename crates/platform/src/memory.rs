//! In-memory MIDI backend
//!
//! Devices are plugged and unplugged programmatically. Used by the CLI to
//! serve devices from configuration and by tests to script hot-plug and
//! query-failure scenarios. Clones share the same device set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::{EndpointRef, MidiBackend, MutexExt, NativeDevice, PlatformError, Property};

/// First unique id handed out to endpoints that do not ask for one
pub const FIRST_UNIQUE_ID: i32 = 1000;

/// Properties of an endpoint to create
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSpec {
    pub unique_id: Option<i32>,
    pub name: Option<String>,
    pub manufacturer: Option<String>,
}

impl EndpointSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, unique_id: i32) -> Self {
        self.unique_id = Some(unique_id);
        self
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }
}

/// Endpoints created for a plugged device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluggedDevice {
    pub sources: Vec<EndpointRef>,
    pub destinations: Vec<EndpointRef>,
}

/// A message written to a destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub unique_id: i32,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct Endpoint {
    unique_id: i32,
    name: Option<String>,
    manufacturer: Option<String>,
    /// Property queries fail while set
    broken: bool,
}

#[derive(Debug, Default)]
struct Inner {
    next_ref: u32,
    next_unique_id: i32,
    devices: Vec<NativeDevice>,
    endpoints: HashMap<EndpointRef, Endpoint>,
    sent: Vec<SentMessage>,
    device_list_failure: Option<String>,
}

impl Inner {
    fn create_endpoint(&mut self, spec: EndpointSpec) -> EndpointRef {
        let endpoint = EndpointRef(self.next_ref);
        self.next_ref += 1;
        let unique_id = match spec.unique_id {
            Some(id) => id,
            None => self.next_free_id(),
        };
        self.endpoints.insert(
            endpoint,
            Endpoint {
                unique_id,
                name: spec.name,
                manufacturer: spec.manufacturer,
                broken: false,
            },
        );
        endpoint
    }

    /// Skips ids already held by a plugged endpoint
    fn next_free_id(&mut self) -> i32 {
        loop {
            let id = FIRST_UNIQUE_ID + self.next_unique_id;
            self.next_unique_id += 1;
            if !self.endpoints.values().any(|e| e.unique_id == id) {
                return id;
            }
        }
    }

    fn endpoint_mut(&mut self, unique_id: i32) -> Option<&mut Endpoint> {
        self.endpoints
            .values_mut()
            .find(|e| e.unique_id == unique_id)
    }
}

/// Shared in-memory device set
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in a device with the given sources (inputs) and destinations (outputs)
    pub fn plug(
        &self,
        name: impl Into<String>,
        sources: Vec<EndpointSpec>,
        destinations: Vec<EndpointSpec>,
    ) -> PluggedDevice {
        let mut inner = self.inner.lock_or_recover();
        let sources: Vec<_> = sources
            .into_iter()
            .map(|spec| inner.create_endpoint(spec))
            .collect();
        let destinations: Vec<_> = destinations
            .into_iter()
            .map(|spec| inner.create_endpoint(spec))
            .collect();
        inner.devices.push(NativeDevice {
            name: name.into(),
            sources: sources.clone(),
            destinations: destinations.clone(),
        });
        PluggedDevice {
            sources,
            destinations,
        }
    }

    /// Remove a device and all of its endpoints. Returns false if no device
    /// had that name.
    pub fn unplug(&self, name: &str) -> bool {
        let mut inner = self.inner.lock_or_recover();
        let Some(pos) = inner.devices.iter().position(|d| d.name == name) else {
            return false;
        };
        let device = inner.devices.remove(pos);
        for endpoint in device.sources.iter().chain(device.destinations.iter()) {
            inner.endpoints.remove(endpoint);
        }
        true
    }

    /// Change the display name of an endpoint
    pub fn rename(&self, unique_id: i32, name: impl Into<String>) -> bool {
        let mut inner = self.inner.lock_or_recover();
        match inner.endpoint_mut(unique_id) {
            Some(endpoint) => {
                endpoint.name = Some(name.into());
                true
            }
            None => false,
        }
    }

    /// Make property queries on an endpoint fail (or succeed again)
    pub fn set_broken(&self, unique_id: i32, broken: bool) -> bool {
        let mut inner = self.inner.lock_or_recover();
        match inner.endpoint_mut(unique_id) {
            Some(endpoint) => {
                endpoint.broken = broken;
                true
            }
            None => false,
        }
    }

    /// Make the device list query itself fail
    pub fn fail_device_list(&self, reason: Option<String>) {
        self.inner.lock_or_recover().device_list_failure = reason;
    }

    /// Messages written so far, oldest first
    pub fn sent(&self) -> Vec<SentMessage> {
        self.inner.lock_or_recover().sent.clone()
    }
}

impl MidiBackend for MemoryBackend {
    fn devices(&self) -> Result<Vec<NativeDevice>, PlatformError> {
        let inner = self.inner.lock_or_recover();
        if let Some(reason) = &inner.device_list_failure {
            return Err(PlatformError::DeviceListUnavailable(reason.clone()));
        }
        Ok(inner.devices.clone())
    }

    fn unique_id(&self, endpoint: EndpointRef) -> Result<i32, PlatformError> {
        let inner = self.inner.lock_or_recover();
        let entry = inner
            .endpoints
            .get(&endpoint)
            .ok_or(PlatformError::EndpointNotFound(endpoint))?;
        if entry.broken {
            return Err(PlatformError::PropertyUnavailable {
                endpoint,
                property: Property::UniqueId,
            });
        }
        Ok(entry.unique_id)
    }

    fn string_property(
        &self,
        endpoint: EndpointRef,
        property: Property,
    ) -> Result<Option<String>, PlatformError> {
        let inner = self.inner.lock_or_recover();
        let entry = inner
            .endpoints
            .get(&endpoint)
            .ok_or(PlatformError::EndpointNotFound(endpoint))?;
        if entry.broken {
            return Err(PlatformError::PropertyUnavailable { endpoint, property });
        }
        match property {
            Property::Name => Ok(entry.name.clone()),
            Property::Manufacturer => Ok(entry.manufacturer.clone()),
            Property::UniqueId => Ok(Some(entry.unique_id.to_string())),
        }
    }

    fn send(&self, endpoint: EndpointRef, data: &[u8]) -> Result<(), PlatformError> {
        let mut inner = self.inner.lock_or_recover();
        let unique_id = inner
            .endpoints
            .get(&endpoint)
            .map(|e| e.unique_id)
            .ok_or(PlatformError::EndpointNotFound(endpoint))?;
        let is_destination = inner
            .devices
            .iter()
            .any(|d| d.destinations.contains(&endpoint));
        if !is_destination {
            return Err(PlatformError::WriteFailed {
                endpoint,
                reason: "endpoint is not a destination".into(),
            });
        }
        inner.sent.push(SentMessage {
            unique_id,
            data: data.to_vec(),
        });
        Ok(())
    }
}
