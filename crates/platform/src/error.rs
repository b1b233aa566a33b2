//! Platform error types

use thiserror::Error;

use crate::{EndpointRef, Property};

/// Errors that can occur while talking to the native MIDI subsystem
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Device list unavailable: {0}")]
    DeviceListUnavailable(String),

    #[error("Endpoint {0} not found")]
    EndpointNotFound(EndpointRef),

    #[error("Property {property:?} unavailable on endpoint {endpoint}")]
    PropertyUnavailable {
        endpoint: EndpointRef,
        property: Property,
    },

    #[error("Write to endpoint {endpoint} failed: {reason}")]
    WriteFailed { endpoint: EndpointRef, reason: String },
}
