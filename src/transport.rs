//! Target routing (spec §4.8) and the transport collaborator interface
//! (spec §1 "out of scope", §6 "Collaborators").
//!
//! The outer multi-vehicle messaging runtime, the physical transport, and
//! its framing of the carrier message are explicitly out of scope for this
//! crate. [`FtpTransport`] is the narrow seam the engine calls through;
//! callers supply the concrete implementation that actually talks to the
//! messaging runtime.

use std::time::Duration;

use crate::protocol::PayloadHeader;

/// An outbound FTP frame addressed to a specific system/component, ready
/// for the transport to wrap in the outer carrier message and send.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub target_system: u8,
    pub target_component: u8,
    pub payload: PayloadHeader,
}

/// A decoded inbound carrier message carrying an FTP frame, as delivered by
/// the outer message router (spec §6 `register_mavlink_message_handler`).
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// `target_system` from the carrier message; `0` means broadcast.
    pub target_system: u8,
    /// `target_component` from the carrier message; `0` means broadcast.
    pub target_component: u8,
    pub payload: PayloadHeader,
}

/// The collaborators the request engine consumes (spec §6): sending a
/// frame, and the identifiers used to route it.
pub trait FtpTransport: Send + Sync {
    /// Hand an encoded outbound frame to the transport.
    fn send_message(&self, frame: OutboundFrame);

    /// Our own system id (`get_own_system_id`).
    fn own_system_id(&self) -> u8;

    /// Our own component id (`get_own_component_id`).
    fn own_component_id(&self) -> u8;

    /// The paired vehicle's system id (`get_system_id`).
    fn target_system_id(&self) -> u8;

    /// The paired vehicle's autopilot component id (`get_autopilot_id`),
    /// used as the default target component unless overridden.
    fn autopilot_component_id(&self) -> u8;

    /// Per-request timeout (`timeout_s`).
    fn timeout(&self) -> Duration;
}

/// Own-vs-target id bookkeeping for outbound frames and the inbound filter
/// (spec §4.8). An explicit `target_component_override` sticks for the
/// client's lifetime once set.
#[derive(Debug, Clone)]
pub struct TargetRouting {
    pub own_system_id: u8,
    pub own_component_id: u8,
    pub target_system_id: u8,
    target_component_override: Option<u8>,
    autopilot_component_id: u8,
}

impl TargetRouting {
    pub fn new(
        own_system_id: u8,
        own_component_id: u8,
        target_system_id: u8,
        autopilot_component_id: u8,
    ) -> Self {
        TargetRouting {
            own_system_id,
            own_component_id,
            target_system_id,
            target_component_override: None,
            autopilot_component_id,
        }
    }

    /// The destination component id for outbound frames: the explicit
    /// override if one has been set, else the paired system's autopilot
    /// component (spec §4.8).
    pub fn target_component_id(&self) -> u8 {
        self.target_component_override
            .unwrap_or(self.autopilot_component_id)
    }

    /// Set an explicit target component override, which sticks for the
    /// client's lifetime.
    pub fn set_target_component_override(&mut self, component_id: u8) {
        self.target_component_override = Some(component_id);
    }

    /// `true` if an inbound frame's target ids address us: each field must
    /// be `0` (broadcast) or equal to our own id (spec §4.6.1 step 1).
    pub fn accepts(&self, frame: &InboundFrame) -> bool {
        let system_ok = frame.target_system == 0 || frame.target_system == self.own_system_id;
        let component_ok =
            frame.target_component == 0 || frame.target_component == self.own_component_id;
        system_ok && component_ok
    }

    pub fn wrap_outbound(&self, payload: PayloadHeader) -> OutboundFrame {
        OutboundFrame {
            target_system: self.target_system_id,
            target_component: self.target_component_id(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routing() -> TargetRouting {
        TargetRouting::new(245, 190, 1, 50)
    }

    fn frame_targeting(system: u8, component: u8) -> InboundFrame {
        InboundFrame {
            target_system: system,
            target_component: component,
            payload: PayloadHeader::default(),
        }
    }

    #[test]
    fn accepts_broadcast() {
        assert!(routing().accepts(&frame_targeting(0, 0)));
    }

    #[test]
    fn accepts_exact_match() {
        assert!(routing().accepts(&frame_targeting(245, 190)));
    }

    #[test]
    fn rejects_foreign_system() {
        assert!(!routing().accepts(&frame_targeting(7, 0)));
    }

    #[test]
    fn rejects_foreign_component() {
        assert!(!routing().accepts(&frame_targeting(0, 7)));
    }

    #[test]
    fn default_target_component_is_autopilot() {
        assert_eq!(routing().target_component_id(), 50);
    }

    #[test]
    fn override_sticks() {
        let mut r = routing();
        r.set_target_component_override(99);
        assert_eq!(r.target_component_id(), 99);
    }
}
