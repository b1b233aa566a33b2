//! Content messages (content → host)

use serde::{Deserialize, Serialize};

use crate::{PortId, WireMessage};

/// All messages the script context can post to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentMessage {
    /// Enumerate and report every port
    Connect,

    /// Bytes to write to a native output port
    #[serde(rename = "midioutput")]
    MidiOutput {
        #[serde(rename = "portID")]
        port_id: PortId,
        data: Vec<u8>,
    },

    /// Diagnostic text, no effect on synchronization state
    Log { value: String },
}

impl ContentMessage {
    #[must_use]
    pub fn log(value: impl Into<String>) -> Self {
        Self::Log {
            value: value.into(),
        }
    }
}

impl WireMessage for ContentMessage {
    fn kind(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::MidiOutput { .. } => "midioutput",
            Self::Log { .. } => "log",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_has_no_fields() {
        let json = serde_json::to_string(&ContentMessage::Connect).unwrap();
        assert_eq!(json, r#"{"type":"connect"}"#);
    }

    #[test]
    fn midioutput_uses_port_id_casing() {
        let msg = ContentMessage::MidiOutput {
            port_id: PortId::from("99"),
            data: vec![0x90, 60, 127],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "midioutput");
        assert_eq!(json["portID"], "99");
        assert_eq!(json["data"], serde_json::json!([144, 60, 127]));
    }
}
