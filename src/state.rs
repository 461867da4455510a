//! Canonical host lifecycle and provider status normalisation.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Provider-independent lifecycle of a host.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CanonicalState {
    /// Neither instance nor volume exists.
    None,
    /// The instance is being provisioned or booted.
    Starting,
    /// The instance is running.
    Running,
    /// The instance is shutting down.
    Stopping,
    /// The instance is stopped, or only its volume remains.
    Stopped,
    /// The provider reported a status the driver does not understand.
    Error,
}

impl CanonicalState {
    /// Lowercase name used in logs and CLI output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for CanonicalState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Maps a provider-native status string onto [`CanonicalState`].
///
/// Matching ignores case and treats `_` and spaces like `-`, so `STAGING`,
/// `shutting-down` and `stopped in place` are all recognised. Unknown
/// statuses map to [`CanonicalState::Error`] and are logged.
#[must_use]
pub fn normalize_status(status: &str) -> CanonicalState {
    let folded: String = status
        .trim()
        .chars()
        .map(|ch| match ch {
            '_' | ' ' => '-',
            other => other.to_ascii_lowercase(),
        })
        .collect();

    match folded.as_str() {
        "provisioning" | "staging" | "pending" | "starting" | "allocating" => {
            CanonicalState::Starting
        }
        "running" => CanonicalState::Running,
        "stopping" | "shutting-down" | "suspending" => CanonicalState::Stopping,
        "stopped" | "stopped-in-place" | "terminated" | "suspended" => CanonicalState::Stopped,
        _ => {
            warn!(status, "unrecognized instance status");
            CanonicalState::Error
        }
    }
}

/// Derives the canonical state from what the backend reports.
///
/// An absent instance with a retained volume is [`CanonicalState::Stopped`],
/// which distinguishes "never created" from "deleted but disk retained".
#[must_use]
pub fn derive_state(instance_status: Option<&str>, volume_present: bool) -> CanonicalState {
    match (instance_status, volume_present) {
        (None, false) => CanonicalState::None,
        (None, true) => CanonicalState::Stopped,
        (Some(status), _) => normalize_status(status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(None, false, CanonicalState::None)]
    #[case(None, true, CanonicalState::Stopped)]
    #[case(Some("PROVISIONING"), false, CanonicalState::Starting)]
    #[case(Some("STAGING"), true, CanonicalState::Starting)]
    #[case(Some("pending"), false, CanonicalState::Starting)]
    #[case(Some("running"), true, CanonicalState::Running)]
    #[case(Some("shutting-down"), false, CanonicalState::Stopping)]
    #[case(Some("stopping"), true, CanonicalState::Stopping)]
    #[case(Some("TERMINATED"), false, CanonicalState::Stopped)]
    #[case(Some("stopped in place"), true, CanonicalState::Stopped)]
    #[case(Some("locked"), false, CanonicalState::Error)]
    #[case(Some(""), true, CanonicalState::Error)]
    fn derivation_table(
        #[case] status: Option<&str>,
        #[case] volume_present: bool,
        #[case] expected: CanonicalState,
    ) {
        assert_eq!(derive_state(status, volume_present), expected);
    }

    #[test]
    fn instance_status_wins_over_volume_presence() {
        for volume_present in [false, true] {
            assert_eq!(
                derive_state(Some("running"), volume_present),
                CanonicalState::Running
            );
        }
    }
}
