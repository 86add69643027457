//! Node roles and pairing compatibility.
//!
//! Roles form a closed set; dispatch and pairing decisions key on the tag,
//! not on string comparison. On the wire a role still travels as a
//! NUL-padded ASCII field so hostnames and dashboards stay human-readable.

use serde::{Deserialize, Serialize};

/// The role a node advertises in every frame it sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Start,
    #[default]
    Finish,
    SpeedTrap,
    Telemetry,
    /// Anything we don't recognise; never compatible, never dispatched.
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Start => "start",
            Role::Finish => "finish",
            Role::SpeedTrap => "speedtrap",
            Role::Telemetry => "telemetry",
            Role::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Role {
        match s {
            "start" => Role::Start,
            "finish" => Role::Finish,
            "speedtrap" => Role::SpeedTrap,
            "telemetry" => Role::Telemetry,
            _ => Role::Unknown,
        }
    }

    /// Pairing compatibility — who links with whom:
    ///
    /// - start ↔ finish (the timing link)
    /// - speedtrap ↔ finish (mid-track speed flows to the dashboard)
    /// - telemetry ↔ finish (chunked IMU runs flow to the dashboard)
    ///
    /// Everything else stays unpaired; a start gate and a speed trap have
    /// nothing to say to each other.
    pub fn compatible_with(&self, other: Role) -> bool {
        matches!(
            (self, other),
            (Role::Start, Role::Finish)
                | (Role::Finish, Role::Start)
                | (Role::SpeedTrap, Role::Finish)
                | (Role::Finish, Role::SpeedTrap)
                | (Role::Telemetry, Role::Finish)
                | (Role::Finish, Role::Telemetry)
        )
    }

    /// The peer this role sends race traffic to by default: gates talk to
    /// their complement, data nodes talk to the finish gate.
    pub fn primary_peer(&self) -> Option<Role> {
        match self {
            Role::Start => Some(Role::Finish),
            Role::Finish => Some(Role::Start),
            Role::SpeedTrap => Some(Role::Finish),
            Role::Telemetry => Some(Role::Finish),
            Role::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatibility_is_symmetric() {
        let roles = [
            Role::Start,
            Role::Finish,
            Role::SpeedTrap,
            Role::Telemetry,
            Role::Unknown,
        ];
        for a in roles {
            for b in roles {
                assert_eq!(
                    a.compatible_with(b),
                    b.compatible_with(a),
                    "{a:?} vs {b:?}"
                );
            }
        }
    }

    #[test]
    fn only_finish_pairs_with_data_roles() {
        assert!(Role::Start.compatible_with(Role::Finish));
        assert!(Role::SpeedTrap.compatible_with(Role::Finish));
        assert!(Role::Telemetry.compatible_with(Role::Finish));

        assert!(!Role::Start.compatible_with(Role::SpeedTrap));
        assert!(!Role::Start.compatible_with(Role::Start));
        assert!(!Role::Finish.compatible_with(Role::Finish));
        assert!(!Role::Unknown.compatible_with(Role::Finish));
    }

    #[test]
    fn parse_round_trips_known_roles() {
        for r in [Role::Start, Role::Finish, Role::SpeedTrap, Role::Telemetry] {
            assert_eq!(Role::parse(r.as_str()), r);
        }
        assert_eq!(Role::parse("judge"), Role::Unknown);
        assert_eq!(Role::parse(""), Role::Unknown);
    }
}
