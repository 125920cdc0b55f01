/// Status of a lockdown request
///
/// Most variants are the `Error` strings lockdownd sends back. The ones named
/// after local conditions (`NoRunningSession`, `HandshakeFailed`, ...) are
/// raised by this crate before anything reaches the device.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockdownError {
    // === Local ===
    #[error("no session is running")]
    NoRunningSession,
    #[error("the service is not lockdownd")]
    HandshakeFailed,
    #[error("the pair record has no escrow bag")]
    MissingEscrowBag,
    #[error("no pair record was given and there is no daemon to load one from")]
    NoPairRecordStore,

    // === Reported by the device ===
    #[error("invalid response")]
    InvalidResponse,
    #[error("missing key")]
    MissingKey,
    #[error("missing value")]
    MissingValue,
    #[error("get prohibited")]
    GetProhibited,
    #[error("set prohibited")]
    SetProhibited,
    #[error("remove prohibited")]
    RemoveProhibited,
    #[error("immutable value")]
    ImmutableValue,
    #[error("device is password protected")]
    PasswordProtected,
    #[error("user denied pairing")]
    UserDeniedPairing,
    #[error("pairing dialog response pending")]
    PairingDialogResponsePending,
    #[error("missing host id")]
    MissingHostID,
    #[error("invalid host id")]
    InvalidHostID,
    #[error("a session is already active")]
    SessionActive,
    #[error("session is inactive")]
    SessionInactive,
    #[error("missing session id")]
    MissingSessionID,
    #[error("invalid session id")]
    InvalidSessionID,
    #[error("missing service")]
    MissingService,
    #[error("invalid service")]
    InvalidService,
    #[error("service limit reached")]
    ServiceLimit,
    #[error("missing pair record")]
    MissingPairRecord,
    #[error("saving the pair record failed")]
    SavePairRecordFailed,
    #[error("invalid pair record")]
    InvalidPairRecord,
    #[error("invalid activation record")]
    InvalidActivationRecord,
    #[error("missing activation record")]
    MissingActivationRecord,
    #[error("service prohibited")]
    ServiceProhibited,
    #[error("escrow locked")]
    EscrowLocked,
    #[error("pairing prohibited over this connection")]
    PairingProhibitedOverThisConnection,
    #[error("find my iphone protected")]
    FMiPProtected,
    #[error("managed configuration protected")]
    MCProtected,
    #[error("managed configuration challenge required")]
    MCChallengeRequired,

    #[error("unknown lockdown error `{0}`")]
    Unknown(String),
}

impl LockdownError {
    /// Maps the device's `Error` string, anything unrecognized becomes [`Self::Unknown`]
    #[must_use]
    pub fn from_device(error: &str) -> Self {
        match error {
            "InvalidResponse" => Self::InvalidResponse,
            "MissingKey" => Self::MissingKey,
            "MissingValue" => Self::MissingValue,
            "GetProhibited" => Self::GetProhibited,
            "SetProhibited" => Self::SetProhibited,
            "RemoveProhibited" => Self::RemoveProhibited,
            "ImmutableValue" => Self::ImmutableValue,
            "PasswordProtected" => Self::PasswordProtected,
            "UserDeniedPairing" => Self::UserDeniedPairing,
            "PairingDialogResponsePending" => Self::PairingDialogResponsePending,
            "MissingHostID" => Self::MissingHostID,
            "InvalidHostID" => Self::InvalidHostID,
            "SessionActive" => Self::SessionActive,
            "SessionInactive" => Self::SessionInactive,
            "MissingSessionID" => Self::MissingSessionID,
            "InvalidSessionID" => Self::InvalidSessionID,
            "MissingService" => Self::MissingService,
            "InvalidService" => Self::InvalidService,
            "ServiceLimit" => Self::ServiceLimit,
            "MissingPairRecord" => Self::MissingPairRecord,
            "SavePairRecordFailed" => Self::SavePairRecordFailed,
            "InvalidPairRecord" => Self::InvalidPairRecord,
            "InvalidActivationRecord" => Self::InvalidActivationRecord,
            "MissingActivationRecord" => Self::MissingActivationRecord,
            "ServiceProhibited" => Self::ServiceProhibited,
            "EscrowLocked" => Self::EscrowLocked,
            "PairingProhibitedOverThisConnection" => Self::PairingProhibitedOverThisConnection,
            "FMiPProtected" => Self::FMiPProtected,
            "MCProtected" => Self::MCProtected,
            "MCChallengeRequired" => Self::MCChallengeRequired,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// The wire name for errors the device can report
    #[must_use]
    pub fn device_name(&self) -> Option<&str> {
        Some(match self {
            Self::InvalidResponse => "InvalidResponse",
            Self::MissingKey => "MissingKey",
            Self::MissingValue => "MissingValue",
            Self::GetProhibited => "GetProhibited",
            Self::SetProhibited => "SetProhibited",
            Self::RemoveProhibited => "RemoveProhibited",
            Self::ImmutableValue => "ImmutableValue",
            Self::PasswordProtected => "PasswordProtected",
            Self::UserDeniedPairing => "UserDeniedPairing",
            Self::PairingDialogResponsePending => "PairingDialogResponsePending",
            Self::MissingHostID => "MissingHostID",
            Self::InvalidHostID => "InvalidHostID",
            Self::SessionActive => "SessionActive",
            Self::SessionInactive => "SessionInactive",
            Self::MissingSessionID => "MissingSessionID",
            Self::InvalidSessionID => "InvalidSessionID",
            Self::MissingService => "MissingService",
            Self::InvalidService => "InvalidService",
            Self::ServiceLimit => "ServiceLimit",
            Self::MissingPairRecord => "MissingPairRecord",
            Self::SavePairRecordFailed => "SavePairRecordFailed",
            Self::InvalidPairRecord => "InvalidPairRecord",
            Self::InvalidActivationRecord => "InvalidActivationRecord",
            Self::MissingActivationRecord => "MissingActivationRecord",
            Self::ServiceProhibited => "ServiceProhibited",
            Self::EscrowLocked => "EscrowLocked",
            Self::PairingProhibitedOverThisConnection => "PairingProhibitedOverThisConnection",
            Self::FMiPProtected => "FMiPProtected",
            Self::MCProtected => "MCProtected",
            Self::MCChallengeRequired => "MCChallengeRequired",
            Self::Unknown(name) => name.as_str(),
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_errors_map_both_ways() {
        for name in ["MissingKey", "SessionActive", "FMiPProtected", "ServiceProhibited"] {
            let err = LockdownError::from_device(name);
            assert!(!matches!(err, LockdownError::Unknown(_)));
            assert_eq!(err.device_name(), Some(name));
        }
    }

    #[test]
    fn test_unknown_error_keeps_its_name() {
        let err = LockdownError::from_device("SomethingNew");
        assert_eq!(err, LockdownError::Unknown("SomethingNew".into()));
        assert_eq!(err.to_string(), "unknown lockdown error `SomethingNew`");
    }

    #[test]
    fn test_local_errors_have_no_wire_name() {
        assert_eq!(LockdownError::NoRunningSession.device_name(), None);
    }
}
