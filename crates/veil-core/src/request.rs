//! Signed stream requests and responses.
//!
//! A signed object is laid out as
//!
//! ```text
//! +------+------------------+--------------+
//! | type | bincode body     | signature    |
//! | 1 B  | variable         | 64 B         |
//! +------+------------------+--------------+
//! ```
//!
//! and is carried on a stream behind a `u16` big-endian length. The
//! signature covers the type byte and the body. Relays forward objects
//! byte-for-byte, so a request's hash is taken over the raw object.

use crate::addr::Addr;
use crate::error::{Error, ErrorCode, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use veil_crypto::{Hash, PublicKey, SIGNATURE_SIZE, SecretKey, Signature};

/// Largest signed object accepted on the wire
pub const MAX_SIGNED_OBJECT_SIZE: usize = 4096;

/// Kind of signed object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    /// [`StreamRequest`]
    Request = 1,
    /// [`StreamResponse`]
    Response = 2,
}

impl TryFrom<u8> for ObjectType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Response),
            other => Err(ErrorCode::SignedObjectInvalid.wrap(format!("unknown type {other}"))),
        }
    }
}

/// Request to open a stream from `src` to `dst`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    /// Strictly increasing per source entity
    pub timestamp: u64,
    /// Dialing end
    pub src: Addr,
    /// Listening end
    pub dst: Addr,
}

/// Answer to a [`StreamRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamResponse {
    /// Hash of the signed request being answered
    pub req_hash: Hash,
    /// Whether the stream was accepted
    pub accepted: bool,
    /// Rejection reason, an [`ErrorCode`] value (0 when accepted)
    pub error_code: u16,
}

/// Raw signed object, kept byte-exact for forwarding and hashing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedObject {
    bytes: Vec<u8>,
}

impl SignedObject {
    fn sign_body<T: Serialize>(kind: ObjectType, body: &T, sk: &SecretKey) -> Result<Self> {
        let encoded =
            bincode::serialize(body).map_err(|e| ErrorCode::SignedObjectInvalid.wrap(e))?;
        let mut bytes = Vec::with_capacity(1 + encoded.len() + SIGNATURE_SIZE);
        bytes.push(kind as u8);
        bytes.extend_from_slice(&encoded);
        let sig = sk.sign(&bytes);
        bytes.extend_from_slice(sig.as_bytes());
        Ok(Self { bytes })
    }

    /// Sign a request with the source entity's key
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::SignedObjectInvalid`] if encoding fails.
    pub fn sign_request(req: &StreamRequest, sk: &SecretKey) -> Result<Self> {
        Self::sign_body(ObjectType::Request, req, sk)
    }

    /// Sign a response
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::SignedObjectInvalid`] if encoding fails.
    pub fn sign_response(resp: &StreamResponse, sk: &SecretKey) -> Result<Self> {
        Self::sign_body(ObjectType::Response, resp, sk)
    }

    /// Wrap raw bytes, checking only the outer structure
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::SignedObjectInvalid`] if the object is too short,
    /// too long or of an unknown type.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < 2 + SIGNATURE_SIZE || bytes.len() > MAX_SIGNED_OBJECT_SIZE {
            return Err(ErrorCode::SignedObjectInvalid
                .wrap(format!("object of {} bytes", bytes.len())));
        }
        ObjectType::try_from(bytes[0])?;
        Ok(Self { bytes })
    }

    /// Raw bytes as sent on the wire
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Object kind
    #[must_use]
    pub fn object_type(&self) -> ObjectType {
        if self.bytes[0] == ObjectType::Request as u8 {
            ObjectType::Request
        } else {
            ObjectType::Response
        }
    }

    fn split(&self) -> (&[u8], &[u8]) {
        self.bytes.split_at(self.bytes.len() - SIGNATURE_SIZE)
    }

    /// Signature trailer
    #[must_use]
    pub fn signature(&self) -> Signature {
        let (_, sig) = self.split();
        Signature::from_slice(sig).unwrap_or_default()
    }

    /// Hash of the raw object
    #[must_use]
    pub fn hash(&self) -> Hash {
        Hash::of(&self.bytes)
    }

    /// Whether `pk` signed this object
    #[must_use]
    pub fn is_signed_by(&self, pk: &PublicKey) -> bool {
        let (signed, _) = self.split();
        pk.verify(signed, &self.signature()).is_ok()
    }

    fn decode_body<T: for<'de> Deserialize<'de>>(&self, kind: ObjectType) -> Result<T> {
        if self.object_type() != kind {
            return Err(ErrorCode::SignedObjectInvalid.wrap(format!("expected {kind:?} object")));
        }
        let (signed, _) = self.split();
        bincode::deserialize(&signed[1..]).map_err(|e| ErrorCode::SignedObjectInvalid.wrap(e))
    }

    /// Decode a request body without verifying it
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::SignedObjectInvalid`] if this is not a request.
    pub fn request(&self) -> Result<StreamRequest> {
        self.decode_body(ObjectType::Request)
    }

    /// Decode a response body without verifying it
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::SignedObjectInvalid`] if this is not a response.
    pub fn response(&self) -> Result<StreamResponse> {
        self.decode_body(ObjectType::Response)
    }
}

impl StreamRequest {
    /// Decode `obj` and check its addresses and signature
    ///
    /// Timestamp ordering is checked separately by a [`TimestampTracker`].
    ///
    /// # Errors
    ///
    /// Returns the [`ErrorCode`] for the first failed check.
    pub fn open(obj: &SignedObject) -> Result<Self> {
        let req = obj.request()?;
        if req.src.pk.is_null() {
            return Err(ErrorCode::ReqInvalidSrcPk.into());
        }
        if req.dst.pk.is_null() {
            return Err(ErrorCode::ReqInvalidDstPk.into());
        }
        if req.src.port == 0 {
            return Err(ErrorCode::ReqInvalidSrcPort.into());
        }
        if req.dst.port == 0 {
            return Err(ErrorCode::ReqInvalidDstPort.into());
        }
        if !obj.is_signed_by(&req.src.pk) {
            return Err(ErrorCode::ReqInvalidSig.into());
        }
        Ok(req)
    }
}

impl StreamResponse {
    /// Acceptance of the request hashed as `req_hash`
    #[must_use]
    pub fn accept(req_hash: Hash) -> Self {
        Self {
            req_hash,
            accepted: true,
            error_code: 0,
        }
    }

    /// Rejection of the request hashed as `req_hash`
    #[must_use]
    pub fn reject(req_hash: Hash, code: ErrorCode) -> Self {
        Self {
            req_hash,
            accepted: false,
            error_code: code.code(),
        }
    }

    /// Decode `obj` and check it answers `req_hash`
    ///
    /// Any response must be signed by `dst_pk`. When `relay_pk` is given a
    /// rejection signed by that relay is accepted too; an acceptance never
    /// is.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::RespInvalidHash`] or [`ErrorCode::RespInvalidSig`].
    pub fn open(
        obj: &SignedObject,
        req_hash: &Hash,
        dst_pk: &PublicKey,
        relay_pk: Option<&PublicKey>,
    ) -> Result<Self> {
        let resp = obj.response()?;
        if resp.req_hash != *req_hash {
            return Err(ErrorCode::RespInvalidHash.into());
        }
        let by_dst = obj.is_signed_by(dst_pk);
        let by_relay = !resp.accepted && relay_pk.is_some_and(|pk| obj.is_signed_by(pk));
        if !by_dst && !by_relay {
            return Err(ErrorCode::RespInvalidSig.into());
        }
        Ok(resp)
    }

    /// `Ok` if accepted, otherwise the rejection reason
    ///
    /// # Errors
    ///
    /// Returns the carried [`ErrorCode`], or
    /// [`ErrorCode::RespNotAccepted`] if the code is unknown.
    pub fn into_result(self) -> Result<()> {
        if self.accepted {
            return Ok(());
        }
        Err(ErrorCode::from_code(self.error_code)
            .unwrap_or(ErrorCode::RespNotAccepted)
            .into())
    }
}

/// Run `fut` under `limit`, mapping expiry to [`Error::Timeout`]
pub(crate) async fn timed<T, F>(limit: Duration, what: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::Timeout(what.into()))?
}

/// Read one length-prefixed signed object
///
/// # Errors
///
/// Returns an I/O error on transport failure and
/// [`ErrorCode::SignedObjectInvalid`] for a malformed object.
pub async fn read_object<R: AsyncRead + Unpin>(reader: &mut R) -> Result<SignedObject> {
    let len = reader.read_u16().await? as usize;
    if len > MAX_SIGNED_OBJECT_SIZE {
        return Err(ErrorCode::SignedObjectInvalid.wrap(format!("object of {len} bytes")));
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    SignedObject::from_bytes(bytes)
}

/// Write one length-prefixed signed object
///
/// # Errors
///
/// Returns an I/O error on transport failure.
pub async fn write_object<W: AsyncWrite + Unpin>(writer: &mut W, obj: &SignedObject) -> Result<()> {
    let mut buf = Vec::with_capacity(2 + obj.bytes.len());
    buf.extend_from_slice(&(obj.bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(&obj.bytes);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Last accepted request timestamp per source entity
#[derive(Debug, Default)]
pub struct TimestampTracker {
    last: Mutex<HashMap<PublicKey, u64>>,
}

impl TimestampTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `timestamp` for `src` if it is newer than the last one
    ///
    /// Check and update happen under one lock, so concurrent requests from
    /// the same source cannot both pass with the same timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::ReqInvalidTimestamp`] if `timestamp` is not
    /// strictly greater than the last accepted one.
    pub fn check_and_update(&self, src: &PublicKey, timestamp: u64) -> Result<()> {
        let mut last = self.last.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(&prev) = last.get(src) {
            if timestamp <= prev {
                return Err(ErrorCode::ReqInvalidTimestamp.into());
            }
        }
        last.insert(*src, timestamp);
        Ok(())
    }

    /// Last accepted timestamp for `src`
    #[must_use]
    pub fn last(&self, src: &PublicKey) -> Option<u64> {
        self.last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(src)
            .copied()
    }
}

/// Source of strictly increasing request timestamps
#[derive(Debug, Default)]
pub struct TimestampClock {
    last: AtomicU64,
}

impl TimestampClock {
    /// Create a clock
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp: Unix nanoseconds, bumped past the previous value
    pub fn next(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_default();
        now.max(prev + 1)
    }
}
