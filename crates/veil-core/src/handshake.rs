//! Session handshake and encrypted record layer.
//!
//! Three messages authenticate both static Ed25519 identities and agree on
//! fresh X25519 traffic keys:
//!
//! ```text
//! I -> R : version | e_i | s_i
//! R -> I : e_r | s_r | sig_r(H || "responder")
//! I -> R : sig_i(H || "initiator")
//! ```
//!
//! `H` is the transcript hash over the first message and the responder's
//! ephemeral and static keys. Each handshake message is framed with a `u16`
//! big-endian length; after the handshake every record is a `u32` length
//! followed by a ChaCha20-Poly1305 ciphertext.

use crate::error::{Error, ErrorCode, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use veil_crypto::hash::{Transcript, derive_key_material};
use veil_crypto::x25519::EphemeralSecret;
use veil_crypto::{PUBLIC_KEY_SIZE, PublicKey, SIGNATURE_SIZE, SecretKey, SessionCipher, Signature};

/// Handshake protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest ciphertext record accepted from a peer
pub const MAX_RECORD_SIZE: usize = 64 * 1024;

const TRANSCRIPT_LABEL: &[u8] = b"veil handshake v1";
const KEY_CONTEXT: &str = "veil session keys v1";

const MSG1_LEN: usize = 1 + 32 + PUBLIC_KEY_SIZE;
const MSG2_LEN: usize = 32 + PUBLIC_KEY_SIZE + SIGNATURE_SIZE;
const MSG3_LEN: usize = SIGNATURE_SIZE;

/// Receiving half of an encrypted session
pub struct SecureReader<R> {
    inner: R,
    cipher: SessionCipher,
}

/// Sending half of an encrypted session
pub struct SecureWriter<W> {
    inner: W,
    cipher: SessionCipher,
}

impl<R: AsyncRead + Unpin> SecureReader<R> {
    /// Read and decrypt one record; `None` on end of stream
    ///
    /// # Errors
    ///
    /// Returns an I/O error on transport failure or an oversized record, and
    /// a crypto error if the record fails authentication.
    pub async fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut header = [0u8; 4];
        match self.inner.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_RECORD_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("record of {len} bytes exceeds limit"),
            )
            .into());
        }

        let mut ciphertext = vec![0u8; len];
        self.inner.read_exact(&mut ciphertext).await?;
        Ok(Some(self.cipher.open(&ciphertext)?))
    }
}

impl<W: AsyncWrite + Unpin> SecureWriter<W> {
    /// Encrypt and send one record
    ///
    /// # Errors
    ///
    /// Returns an error if encryption or the transport write fails.
    pub async fn write_record(&mut self, plaintext: &[u8]) -> Result<()> {
        let ciphertext = self.cipher.seal(plaintext)?;
        let mut buf = Vec::with_capacity(4 + ciphertext.len());
        buf.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
        buf.extend_from_slice(&ciphertext);
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Close the sending direction of the transport
    ///
    /// # Errors
    ///
    /// Returns the transport's shutdown error.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Result of a successful handshake
pub struct Established<T> {
    /// Authenticated static key of the peer
    pub remote_pk: PublicKey,
    /// Decrypting half
    pub reader: SecureReader<ReadHalf<T>>,
    /// Encrypting half
    pub writer: SecureWriter<WriteHalf<T>>,
}

impl<T> std::fmt::Debug for Established<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("remote_pk", &self.remote_pk)
            .finish_non_exhaustive()
    }
}

fn handshake_err(e: impl std::fmt::Display) -> Error {
    Error::Handshake(e.to_string().into())
}

async fn write_message<T: AsyncWrite + Unpin>(io: &mut T, body: &[u8]) -> Result<()> {
    let mut buf = Vec::with_capacity(2 + body.len());
    buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
    buf.extend_from_slice(body);
    io.write_all(&buf).await.map_err(handshake_err)?;
    io.flush().await.map_err(handshake_err)
}

async fn read_message<T: AsyncRead + Unpin>(io: &mut T, expected: usize) -> Result<Vec<u8>> {
    let mut header = [0u8; 2];
    io.read_exact(&mut header).await.map_err(handshake_err)?;
    let len = u16::from_be_bytes(header) as usize;
    if len != expected {
        return Err(ErrorCode::SessionHandshakeExtraBytes
            .wrap(format!("expected {expected} bytes, got {len}")));
    }
    let mut body = vec![0u8; len];
    io.read_exact(&mut body).await.map_err(handshake_err)?;
    Ok(body)
}

fn split_key(bytes: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes[..32]);
    key
}

fn signed_payload(transcript: &[u8; 32], role: &[u8]) -> Vec<u8> {
    let mut payload = transcript.to_vec();
    payload.extend_from_slice(role);
    payload
}

/// Traffic keys as (initiator to responder, responder to initiator)
fn traffic_keys(shared: &[u8; 32], transcript: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let material = derive_key_material::<64>(KEY_CONTEXT, &[shared, transcript]);
    (split_key(&material[..32]), split_key(&material[32..]))
}

fn establish<T: AsyncRead + AsyncWrite>(
    io: T,
    remote_pk: PublicKey,
    send_key: &[u8; 32],
    recv_key: &[u8; 32],
) -> Established<T> {
    let (read_half, write_half) = tokio::io::split(io);
    Established {
        remote_pk,
        reader: SecureReader {
            inner: read_half,
            cipher: SessionCipher::new(recv_key),
        },
        writer: SecureWriter {
            inner: write_half,
            cipher: SessionCipher::new(send_key),
        },
    }
}

/// Run the initiator side of the handshake
///
/// When `expected` is set the responder must authenticate as that key.
///
/// # Errors
///
/// Returns [`Error::Timeout`] if the handshake does not finish within
/// `timeout`, [`ErrorCode::SessionHandshakeExtraBytes`] for a message of the
/// wrong size, and [`Error::Handshake`] for any other failure.
pub async fn initiate<T>(
    io: T,
    sk: &SecretKey,
    expected: Option<PublicKey>,
    timeout: Duration,
) -> Result<Established<T>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, initiate_inner(io, sk, expected))
        .await
        .map_err(|_| Error::Timeout("session handshake".into()))?
}

async fn initiate_inner<T>(
    mut io: T,
    sk: &SecretKey,
    expected: Option<PublicKey>,
) -> Result<Established<T>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let ephemeral = EphemeralSecret::generate();
    let mut msg1 = Vec::with_capacity(MSG1_LEN);
    msg1.push(PROTOCOL_VERSION);
    msg1.extend_from_slice(&ephemeral.public_bytes());
    msg1.extend_from_slice(sk.public_key().as_bytes());
    write_message(&mut io, &msg1).await?;

    let msg2 = read_message(&mut io, MSG2_LEN).await?;
    let remote_eph = split_key(&msg2[..32]);
    let remote_pk = PublicKey::from_slice(&msg2[32..64])?;
    let remote_sig = Signature::from_slice(&msg2[64..])?;

    if let Some(pinned) = expected {
        if pinned != remote_pk {
            return Err(handshake_err(format!(
                "responder authenticated as {remote_pk}, expected {pinned}"
            )));
        }
    }

    let mut transcript = Transcript::new(TRANSCRIPT_LABEL);
    transcript.append(&msg1);
    transcript.append(&remote_eph);
    transcript.append(remote_pk.as_bytes());
    let h = transcript.finalize();

    remote_pk
        .verify(&signed_payload(h.as_bytes(), b"responder"), &remote_sig)
        .map_err(|_| handshake_err("invalid responder signature"))?;

    let shared = ephemeral.exchange(&remote_eph).map_err(handshake_err)?;
    let sig = sk.sign(&signed_payload(h.as_bytes(), b"initiator"));
    write_message(&mut io, sig.as_bytes()).await?;

    let (i2r, r2i) = traffic_keys(shared.as_bytes(), h.as_bytes());
    Ok(establish(io, remote_pk, &i2r, &r2i))
}

/// Run the responder side of the handshake
///
/// # Errors
///
/// Same as [`initiate`].
pub async fn respond<T>(io: T, sk: &SecretKey, timeout: Duration) -> Result<Established<T>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, respond_inner(io, sk))
        .await
        .map_err(|_| Error::Timeout("session handshake".into()))?
}

async fn respond_inner<T>(mut io: T, sk: &SecretKey) -> Result<Established<T>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let msg1 = read_message(&mut io, MSG1_LEN).await?;
    if msg1[0] != PROTOCOL_VERSION {
        return Err(handshake_err(format!(
            "unsupported protocol version {}",
            msg1[0]
        )));
    }
    let remote_eph = split_key(&msg1[1..33]);
    let remote_pk = PublicKey::from_slice(&msg1[33..])?;

    let ephemeral = EphemeralSecret::generate();
    let local_eph = ephemeral.public_bytes();
    let local_pk = sk.public_key();

    let mut transcript = Transcript::new(TRANSCRIPT_LABEL);
    transcript.append(&msg1);
    transcript.append(&local_eph);
    transcript.append(local_pk.as_bytes());
    let h = transcript.finalize();

    let shared = ephemeral.exchange(&remote_eph).map_err(handshake_err)?;

    let mut msg2 = Vec::with_capacity(MSG2_LEN);
    msg2.extend_from_slice(&local_eph);
    msg2.extend_from_slice(local_pk.as_bytes());
    msg2.extend_from_slice(sk.sign(&signed_payload(h.as_bytes(), b"responder")).as_bytes());
    write_message(&mut io, &msg2).await?;

    let msg3 = read_message(&mut io, MSG3_LEN).await?;
    let remote_sig = Signature::from_slice(&msg3)?;
    remote_pk
        .verify(&signed_payload(h.as_bytes(), b"initiator"), &remote_sig)
        .map_err(|_| handshake_err("invalid initiator signature"))?;

    let (i2r, r2i) = traffic_keys(shared.as_bytes(), h.as_bytes());
    Ok(establish(io, remote_pk, &r2i, &i2r))
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_crypto::generate_keypair;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_handshake_authenticates_both_sides() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (pk_i, sk_i) = generate_keypair();
        let (pk_r, sk_r) = generate_keypair();

        let (init, resp) = tokio::join!(
            initiate(a, &sk_i, Some(pk_r), TIMEOUT),
            respond(b, &sk_r, TIMEOUT)
        );
        let mut init = init.unwrap();
        let mut resp = resp.unwrap();
        assert_eq!(init.remote_pk, pk_r);
        assert_eq!(resp.remote_pk, pk_i);

        init.writer.write_record(b"ping").await.unwrap();
        assert_eq!(resp.reader.read_record().await.unwrap().unwrap(), b"ping");
        resp.writer.write_record(b"pong").await.unwrap();
        assert_eq!(init.reader.read_record().await.unwrap().unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_pinned_key_mismatch() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (_, sk_i) = generate_keypair();
        let (_, sk_r) = generate_keypair();
        let (other, _) = generate_keypair();

        let (init, _resp) = tokio::join!(
            initiate(a, &sk_i, Some(other), TIMEOUT),
            respond(b, &sk_r, Duration::from_millis(200))
        );
        assert!(matches!(init, Err(Error::Handshake(_))));
    }

    #[tokio::test]
    async fn test_wrong_length_is_extra_bytes() {
        let (mut a, b) = tokio::io::duplex(1024);
        let (_, sk_r) = generate_keypair();

        a.write_all(&[0, 80]).await.unwrap();
        a.write_all(&[0u8; 80]).await.unwrap();
        let err = respond(b, &sk_r, TIMEOUT).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::SessionHandshakeExtraBytes));
    }

    #[tokio::test]
    async fn test_bad_version_rejected() {
        let (mut a, b) = tokio::io::duplex(1024);
        let (_, sk_r) = generate_keypair();

        let mut msg = vec![0, MSG1_LEN as u8, 99];
        msg.extend_from_slice(&[1u8; MSG1_LEN - 1]);
        a.write_all(&msg).await.unwrap();
        assert!(matches!(
            respond(b, &sk_r, TIMEOUT).await,
            Err(Error::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (_a, b) = tokio::io::duplex(1024);
        let (_, sk_r) = generate_keypair();
        assert!(matches!(
            respond(b, &sk_r, Duration::from_millis(50)).await,
            Err(Error::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_transport_reads_none() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (_, sk_i) = generate_keypair();
        let (_, sk_r) = generate_keypair();

        let (init, resp) = tokio::join!(
            initiate(a, &sk_i, None, TIMEOUT),
            respond(b, &sk_r, TIMEOUT)
        );
        let mut init = init.unwrap();
        let mut resp = resp.unwrap();
        init.writer.shutdown().await.unwrap();
        assert!(resp.reader.read_record().await.unwrap().is_none());
    }
}
