//! Send outcome taxonomy.
//!
//! The transport reports every send as one integer code. The set of codes is
//! closed; anything unrecognized is [`SendOutcome::Other`].

use courier_db::entities::CredentialStatus;

/// Classified result of one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Delivered (`0`).
    Sent,
    /// Recipient or session appears invalid (`-10001`).
    SessionInvalid,
    /// Maintenance or community restriction (`-10000`).
    Maintenance,
    /// Session exited (`-1`).
    SessionExited,
    /// Sender-side restriction (`10004`).
    Restricted,
    /// Sending too fast (`10002`).
    TooFast,
    /// Transport or network failure (`-10002`).
    NetworkError,
    /// Any other failure code.
    Other(i32),
}

impl SendOutcome {
    /// Classify a transport result code.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Sent,
            -10001 => Self::SessionInvalid,
            -10000 => Self::Maintenance,
            -1 => Self::SessionExited,
            10004 => Self::Restricted,
            10002 => Self::TooFast,
            -10002 => Self::NetworkError,
            other => Self::Other(other),
        }
    }

    /// The wire code of this outcome.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Sent => 0,
            Self::SessionInvalid => -10001,
            Self::Maintenance => -10000,
            Self::SessionExited => -1,
            Self::Restricted => 10004,
            Self::TooFast => 10002,
            Self::NetworkError => -10002,
            Self::Other(code) => code,
        }
    }

    /// Health status the credential is demoted to, if this outcome demotes
    /// unconditionally. Session-invalid demotion depends on the streak and is
    /// decided by the result handler.
    #[must_use]
    pub const fn demotion(self) -> Option<CredentialStatus> {
        match self {
            Self::Maintenance => Some(CredentialStatus::Maintenance),
            Self::SessionExited => Some(CredentialStatus::Exited),
            Self::Restricted => Some(CredentialStatus::Restricted),
            Self::TooFast => Some(CredentialStatus::Throttled),
            Self::Other(_) => Some(CredentialStatus::Failed),
            Self::Sent | Self::SessionInvalid | Self::NetworkError => None,
        }
    }

    /// Whether the worker holding the credential must stop after this outcome.
    #[must_use]
    pub const fn stops_credential(self) -> bool {
        !matches!(self, Self::Sent | Self::NetworkError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for code in [0, -10001, -10000, -1, 10004, 10002, -10002, 42] {
            assert_eq!(SendOutcome::from_code(code).code(), code);
        }
        assert_eq!(SendOutcome::from_code(7), SendOutcome::Other(7));
    }

    #[test]
    fn test_demotions() {
        assert_eq!(
            SendOutcome::TooFast.demotion(),
            Some(CredentialStatus::Throttled)
        );
        assert_eq!(
            SendOutcome::Other(99).demotion(),
            Some(CredentialStatus::Failed)
        );
        assert_eq!(SendOutcome::SessionInvalid.demotion(), None);
        assert_eq!(SendOutcome::NetworkError.demotion(), None);
    }

    #[test]
    fn test_only_sent_and_network_keep_credential() {
        assert!(!SendOutcome::Sent.stops_credential());
        assert!(!SendOutcome::NetworkError.stops_credential());
        assert!(SendOutcome::SessionInvalid.stops_credential());
        assert!(SendOutcome::TooFast.stops_credential());
    }
}
