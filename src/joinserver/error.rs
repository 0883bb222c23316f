//! Error taxonomy of the join engine and the key-retrieval operations.
//!
//! Every failure surfaces to the caller with its category; nothing is
//! retried inside the engine except the optimistic-store loop, which ends
//! in `Busy` when exhausted.

use std::fmt;

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::lorawan::{CodecError, MType, Major};
use crate::registry::RegistryError;
use crate::types::MacVersion;

/// Which peer's registered address failed the caller check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    NetworkServer,
    ApplicationServer,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::NetworkServer => write!(f, "Network Server"),
            Component::ApplicationServer => write!(f, "Application Server"),
        }
    }
}

/// Why the MIC check failed.
#[derive(Debug, Error)]
pub enum MicError {
    #[error("expected 23 bytes of raw payload, got {0}")]
    Length(usize),
    #[error("MIC mismatch")]
    Mismatch,
    #[error("failed to compute MIC")]
    Compute(#[source] CryptoError),
}

/// Which part of a stored record is unusable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorruptRegistryError {
    #[error("AppKey missing or zero")]
    AppKeyMissing,
    #[error("NwkKey missing or zero")]
    NwkKeyMissing,
    #[error("AppSKey envelope not found")]
    AppSKeyEnvelopeNotFound,
    #[error("NwkSEncKey envelope not found")]
    NwkSEncKeyEnvelopeNotFound,
    #[error("FNwkSIntKey envelope not found")]
    FNwkSIntKeyEnvelopeNotFound,
    #[error("SNwkSIntKey envelope not found")]
    SNwkSIntKeyEnvelopeNotFound,
}

/// Semantic error categories, used by transport adapters for result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Input,
    Policy,
    Replay,
    Integrity,
    Registry,
    Crypto,
    Transient,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Input => "input",
            ErrorCategory::Policy => "policy",
            ErrorCategory::Replay => "replay",
            ErrorCategory::Integrity => "integrity",
            ErrorCategory::Registry => "registry",
            ErrorCategory::Crypto => "crypto",
            ErrorCategory::Transient => "transient",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum JoinError {
    // Input errors.
    #[error("unsupported MAC version {version}")]
    UnsupportedMacVersion { version: MacVersion },
    #[error("missing DevAddr")]
    MissingDevAddr,
    #[error("missing payload")]
    MissingPayload,
    #[error("failed to unmarshal payload")]
    UnmarshalPayloadFailed(#[source] CodecError),
    #[error("unsupported LoRaWAN version: {major}")]
    UnsupportedLorawanVersion { major: Major },
    #[error("wrong payload type {mtype}")]
    WrongPayloadType { mtype: MType },
    #[error("missing join-request payload")]
    MissingJoinRequest,
    #[error("missing DevEUI")]
    MissingDevEui,
    #[error("missing JoinEUI")]
    MissingJoinEui,
    #[error("missing session key ID")]
    MissingSessionKeyId,

    // Policy errors.
    #[error("unknown AppEUI")]
    UnknownAppEui,
    #[error("join-request must be forwarded to another cluster")]
    ForwardJoinRequest,
    #[error("registered MAC version {registered} is lower than selected {selected}")]
    MacVersionMismatch {
        registered: MacVersion,
        selected: MacVersion,
    },
    #[error("caller address does not match the registered {component} address")]
    AddressMismatch { component: Component },
    #[error("device has no active session")]
    NoSession,
    #[error("no session matches the requested session key ID")]
    SessionKeyIdMismatch,

    // Replay errors.
    #[error("DevNonce is smaller than the next expected value")]
    DevNonceTooSmall,
    #[error("DevNonce counter exhausted")]
    DevNonceTooHigh,
    #[error("DevNonce has already been used")]
    DevNonceReused,

    // Integrity.
    #[error("MIC check failed")]
    MicCheckFailed(#[source] MicError),

    // Registry integrity.
    #[error("corrupt registry entry")]
    CorruptRegistry(#[source] CorruptRegistryError),
    #[error(transparent)]
    Registry(#[from] RegistryError),

    // Crypto.
    #[error("failed to encrypt join-accept payload")]
    EncryptPayloadFailed(#[source] CryptoError),
    #[error("failed to compute join-accept MIC")]
    ComputeMic(#[source] CryptoError),

    // The optimistic-store retries ran out.
    #[error("device record is contended, retry the join")]
    Busy,
}

impl JoinError {
    pub fn category(&self) -> ErrorCategory {
        use JoinError::*;
        match self {
            UnsupportedMacVersion { .. }
            | MissingDevAddr
            | MissingPayload
            | UnmarshalPayloadFailed(_)
            | UnsupportedLorawanVersion { .. }
            | WrongPayloadType { .. }
            | MissingJoinRequest
            | MissingDevEui
            | MissingJoinEui
            | MissingSessionKeyId => ErrorCategory::Input,
            UnknownAppEui
            | ForwardJoinRequest
            | MacVersionMismatch { .. }
            | AddressMismatch { .. }
            | NoSession
            | SessionKeyIdMismatch => ErrorCategory::Policy,
            DevNonceTooSmall | DevNonceTooHigh | DevNonceReused => ErrorCategory::Replay,
            MicCheckFailed(_) => ErrorCategory::Integrity,
            CorruptRegistry(_) | Registry(_) => ErrorCategory::Registry,
            EncryptPayloadFailed(_) | ComputeMic(_) => ErrorCategory::Crypto,
            Busy => ErrorCategory::Transient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            JoinError::MissingDevAddr.category(),
            ErrorCategory::Input
        );
        assert_eq!(
            JoinError::DevNonceReused.category(),
            ErrorCategory::Replay
        );
        assert_eq!(
            JoinError::MicCheckFailed(MicError::Mismatch).category(),
            ErrorCategory::Integrity
        );
        assert_eq!(
            JoinError::CorruptRegistry(CorruptRegistryError::AppKeyMissing).category(),
            ErrorCategory::Registry
        );
        assert_eq!(JoinError::Busy.category(), ErrorCategory::Transient);
    }

    #[test]
    fn test_address_mismatch_names_component() {
        let err = JoinError::AddressMismatch {
            component: Component::NetworkServer,
        };
        assert!(err.to_string().contains("Network Server"));
    }
}
