//! Platform trait definitions

use crate::PlatformError;

/// Opaque handle to one native endpoint (a source or a destination)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointRef(pub u32);

impl std::fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Scalar properties an endpoint can be queried for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    UniqueId,
    Name,
    Manufacturer,
}

/// One native device and its endpoints
///
/// Sources deliver messages to us (they become input ports), destinations
/// accept messages from us (they become output ports).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeDevice {
    pub name: String,
    pub sources: Vec<EndpointRef>,
    pub destinations: Vec<EndpointRef>,
}

/// Access to the native MIDI subsystem
pub trait MidiBackend: Send {
    /// Enumerate every device currently known to the system
    fn devices(&self) -> Result<Vec<NativeDevice>, PlatformError>;

    /// Process-unique identifier of an endpoint
    fn unique_id(&self, endpoint: EndpointRef) -> Result<i32, PlatformError>;

    /// String property lookup; `Ok(None)` when the endpoint has no value
    fn string_property(
        &self,
        endpoint: EndpointRef,
        property: Property,
    ) -> Result<Option<String>, PlatformError>;

    /// Write one message to a destination endpoint
    fn send(&self, endpoint: EndpointRef, data: &[u8]) -> Result<(), PlatformError>;
}

impl<B: MidiBackend + ?Sized> MidiBackend for Box<B> {
    fn devices(&self) -> Result<Vec<NativeDevice>, PlatformError> {
        (**self).devices()
    }

    fn unique_id(&self, endpoint: EndpointRef) -> Result<i32, PlatformError> {
        (**self).unique_id(endpoint)
    }

    fn string_property(
        &self,
        endpoint: EndpointRef,
        property: Property,
    ) -> Result<Option<String>, PlatformError> {
        (**self).string_property(endpoint, property)
    }

    fn send(&self, endpoint: EndpointRef, data: &[u8]) -> Result<(), PlatformError> {
        (**self).send(endpoint, data)
    }
}
