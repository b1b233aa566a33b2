//! Midibridge Policy Engine
//!
//! Gates what an untrusted script may do through its access handles.
//!
//! Default posture: system-exclusive messages are denied unless the host
//! allows them and the script asked for them when requesting access.

use midibridge_protocol::PolicyDenialReason;

/// Status byte that opens a system-exclusive message
pub const SYSEX_START: u8 = 0xF0;

/// Default upper bound on a single outbound message
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 64 * 1024;

/// Policy decision result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(PolicyDenialReason),
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Policy engine configuration
#[derive(Debug, Clone)]
pub struct Policy {
    /// Whether sysex access may be granted at all
    allow_sysex: bool,
    /// Largest message a script may send
    max_message_len: usize,
}

impl Policy {
    pub fn new() -> Self {
        Self {
            allow_sysex: false,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }

    /// Create a policy that grants sysex to scripts that ask for it
    pub fn permissive() -> Self {
        Self {
            allow_sysex: true,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }

    pub fn set_allow_sysex(&mut self, allow: bool) {
        self.allow_sysex = allow;
    }

    pub fn set_max_message_len(&mut self, len: usize) {
        self.max_message_len = len;
    }

    pub fn allows_sysex(&self) -> bool {
        self.allow_sysex
    }

    /// Check an access request
    pub fn check_access(&self, sysex_requested: bool) -> PolicyDecision {
        if sysex_requested && !self.allow_sysex {
            return PolicyDecision::Deny(PolicyDenialReason {
                code: "sysex_denied".into(),
                message: "System-exclusive access is disabled by the host".into(),
                suggestion: Some("Request access without sysex".into()),
            });
        }
        PolicyDecision::Allow
    }

    /// Check an outbound message sent through a handle
    pub fn check_send(&self, sysex_granted: bool, data: &[u8]) -> PolicyDecision {
        if data.is_empty() {
            return PolicyDecision::Deny(PolicyDenialReason {
                code: "empty_message".into(),
                message: "Cannot send an empty message".into(),
                suggestion: None,
            });
        }

        if data.len() > self.max_message_len {
            return PolicyDecision::Deny(PolicyDenialReason {
                code: "message_too_large".into(),
                message: format!(
                    "Message of {} bytes exceeds the {} byte limit",
                    data.len(),
                    self.max_message_len
                ),
                suggestion: Some("Split the message into smaller chunks".into()),
            });
        }

        if !sysex_granted && data.contains(&SYSEX_START) {
            tracing::debug!(len = data.len(), "Sysex send without sysex access");
            return PolicyDecision::Deny(PolicyDenialReason {
                code: "sysex_not_granted".into(),
                message: "System-exclusive messages require sysex access".into(),
                suggestion: Some("Request access with sysex enabled".into()),
            });
        }

        PolicyDecision::Allow
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysex_access_requires_permission() {
        let policy = Policy::default();
        assert!(policy.check_access(false).is_allowed());

        match policy.check_access(true) {
            PolicyDecision::Deny(reason) => assert_eq!(reason.code, "sysex_denied"),
            PolicyDecision::Allow => panic!("Should deny sysex access"),
        }

        assert!(Policy::permissive().check_access(true).is_allowed());
    }

    #[test]
    fn sysex_send_requires_grant() {
        let policy = Policy::permissive();
        let sysex = [SYSEX_START, 0x7E, 0x7F, 0x06, 0x01, 0xF7];

        match policy.check_send(false, &sysex) {
            PolicyDecision::Deny(reason) => assert_eq!(reason.code, "sysex_not_granted"),
            PolicyDecision::Allow => panic!("Should deny sysex without grant"),
        }
        assert!(policy.check_send(true, &sysex).is_allowed());
        assert!(policy.check_send(false, &[0x90, 60, 127]).is_allowed());
    }

    #[test]
    fn size_limits() {
        let mut policy = Policy::default();
        policy.set_max_message_len(3);

        assert!(!policy.check_send(false, &[]).is_allowed());
        assert!(policy.check_send(false, &[0x90, 60, 127]).is_allowed());
        match policy.check_send(false, &[0x90, 60, 127, 0x80]) {
            PolicyDecision::Deny(reason) => assert_eq!(reason.code, "message_too_large"),
            PolicyDecision::Allow => panic!("Should deny oversized message"),
        }
    }
}
