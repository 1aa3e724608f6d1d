//! Autonomy-based inbound routing.
//!
//! Maps `(connection.passthrough, connection.autonomy)` to a disposition
//! for a decrypted inbound message. Passthrough wins over everything; the
//! mid-tier autonomy levels (`notify`, `auto_respond`) are surfaced as
//! hook points for an external policy collaborator rather than decided
//! here.

use super::model::{AutonomyLevel, MessageState};

/// What to do with an inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Hold for a human. `intervention` marks the passthrough case, which
    /// additionally records a `message_during_intervention` event.
    EscalateToHuman { intervention: bool },
    /// The agent consumes it directly.
    ReadByAgent,
    /// Delivered, pending an external policy decision for this level.
    Hook(AutonomyLevel),
}

impl Disposition {
    /// Message state persisted for this disposition.
    pub fn message_state(&self) -> MessageState {
        match self {
            Disposition::EscalateToHuman { .. } => MessageState::EscalatedToHuman,
            Disposition::ReadByAgent => MessageState::ReadByAgent,
            Disposition::Hook(_) => MessageState::Delivered,
        }
    }
}

/// Order of checks is significant: passthrough is consulted before any
/// autonomy level.
pub fn route_inbound(passthrough: bool, autonomy: AutonomyLevel) -> Disposition {
    if passthrough {
        return Disposition::EscalateToHuman { intervention: true };
    }
    match autonomy {
        AutonomyLevel::FullManual => Disposition::EscalateToHuman { intervention: false },
        AutonomyLevel::FullAuto => Disposition::ReadByAgent,
        AutonomyLevel::Notify => Disposition::Hook(AutonomyLevel::Notify),
        AutonomyLevel::AutoRespond => Disposition::Hook(AutonomyLevel::AutoRespond),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_overrides_every_autonomy_level() {
        for autonomy in [
            AutonomyLevel::FullManual,
            AutonomyLevel::Notify,
            AutonomyLevel::AutoRespond,
            AutonomyLevel::FullAuto,
        ] {
            assert_eq!(
                route_inbound(true, autonomy),
                Disposition::EscalateToHuman { intervention: true }
            );
        }
    }

    #[test]
    fn autonomy_levels_map_to_expected_dispositions() {
        assert_eq!(
            route_inbound(false, AutonomyLevel::FullManual),
            Disposition::EscalateToHuman { intervention: false }
        );
        assert_eq!(
            route_inbound(false, AutonomyLevel::FullAuto),
            Disposition::ReadByAgent
        );
        assert_eq!(
            route_inbound(false, AutonomyLevel::Notify),
            Disposition::Hook(AutonomyLevel::Notify)
        );
        assert_eq!(
            route_inbound(false, AutonomyLevel::AutoRespond),
            Disposition::Hook(AutonomyLevel::AutoRespond)
        );
    }

    #[test]
    fn unknown_autonomy_string_escalates() {
        // Parsing an unrecognized level lands on full manual, which
        // escalates — the safe default.
        let autonomy = AutonomyLevel::parse("quantum_mode");
        assert_eq!(
            route_inbound(false, autonomy),
            Disposition::EscalateToHuman { intervention: false }
        );
    }

    #[test]
    fn disposition_states() {
        assert_eq!(
            Disposition::EscalateToHuman { intervention: true }.message_state(),
            MessageState::EscalatedToHuman
        );
        assert_eq!(Disposition::ReadByAgent.message_state(), MessageState::ReadByAgent);
        assert_eq!(
            Disposition::Hook(AutonomyLevel::Notify).message_state(),
            MessageState::Delivered
        );
    }
}
