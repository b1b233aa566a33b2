//! Host messages (host → content)

use serde::{Deserialize, Serialize};

use crate::{PortDescriptor, PortId, WireMessage};

/// All messages the host can inject into the script context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HostMessage {
    /// Current properties of one port
    #[serde(rename = "statechange")]
    StateChange { properties: PortDescriptor },

    /// Bytes received on a native input port
    #[serde(rename = "midimessage")]
    MidiMessage {
        #[serde(rename = "portID")]
        port_id: PortId,
        data: Vec<u8>,
    },
}

impl HostMessage {
    #[must_use]
    pub fn state_change(properties: PortDescriptor) -> Self {
        Self::StateChange { properties }
    }
}

impl WireMessage for HostMessage {
    fn kind(&self) -> &'static str {
        match self {
            Self::StateChange { .. } => "statechange",
            Self::MidiMessage { .. } => "midimessage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PortType;

    #[test]
    fn statechange_nests_properties() {
        let desc = PortDescriptor::connected("5", PortType::Output).with_manufacturer("Acme");
        let json = serde_json::to_value(HostMessage::state_change(desc)).unwrap();
        assert_eq!(json["type"], "statechange");
        assert_eq!(json["properties"]["id"], "5");
        assert_eq!(json["properties"]["manufacturer"], "Acme");
        assert_eq!(json["properties"]["type"], "output");
    }
}
