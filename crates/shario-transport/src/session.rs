//! Session establishment.
//!
//! Performs the `Noise_XX` handshake over a freshly connected stream and
//! binds the session to the remote's node identifier. The handshake payloads
//! of messages 2 (responder) and 3 (initiator) carry an identity
//! announcement: the DER-encoded RSA public key and a signature over the
//! sender's Noise static key. A session is only established once that
//! signature verifies against the static key the handshake itself
//! authenticated; the node identifier is then derived from the announced
//! public key.
//!
//! ```text
//! Initiator                          Responder
//!     |                                  |
//!     |-- Noise msg1 (e) --------------->|
//!     |                                  |
//!     |<-- Noise msg2 (e,ee,s,es) + id --|
//!     |                                  |
//!     |-- Noise msg3 (s,se) + id ------->|
//!     |                                  |
//!     |       [Session Established]      |
//! ```

use crate::error::{Result, TransportError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use shario_crypto::noise::{NoiseHandshake, NoiseKeypair, NoiseTransport};
use shario_crypto::signatures::{Signature, SigningKey, VerifyingKey};
use shario_crypto::NodeId;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Handshake messages above this size are malformed.
const MAX_HANDSHAKE_WIRE_SIZE: usize = 4096;

/// Identity announcement carried in a handshake payload.
///
/// `public_key` is the base64 SPKI DER encoding of the identity key;
/// `signature` is the base64 RSA signature over the announcing side's Noise
/// static public key.
#[derive(Debug, Serialize, Deserialize)]
struct IdentityAnnouncement {
    public_key: String,
    signature: String,
}

impl IdentityAnnouncement {
    fn new(signing: &SigningKey, noise_static: &[u8; 32]) -> Result<Self> {
        let public_der = signing
            .verifying_key()
            .to_public_key_der()
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let signature = signing.sign(noise_static);
        Ok(Self {
            public_key: BASE64.encode(public_der),
            signature: BASE64.encode(signature.as_bytes()),
        })
    }

    /// Verify the announcement against the static key the handshake proved.
    fn verify(&self, remote_noise_static: &[u8; 32]) -> Result<NodeId> {
        let key_der = BASE64
            .decode(&self.public_key)
            .map_err(|_| TransportError::Handshake("malformed identity key".to_string()))?;
        let verifying = VerifyingKey::from_public_key_der(&key_der)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let sig_bytes = BASE64
            .decode(&self.signature)
            .map_err(|_| TransportError::Handshake("malformed signature".to_string()))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        verifying
            .verify(remote_noise_static, &signature)
            .map_err(|_| TransportError::Handshake("identity signature invalid".to_string()))?;

        Ok(verifying.node_id())
    }
}

async fn send_handshake_msg<W: AsyncWrite + Unpin>(writer: &mut W, msg: &[u8]) -> Result<()> {
    let len =
        u16::try_from(msg.len()).map_err(|_| TransportError::protocol("handshake msg too long"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(msg).await?;
    writer.flush().await?;
    Ok(())
}

async fn recv_handshake_msg<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len > MAX_HANDSHAKE_WIRE_SIZE {
        return Err(TransportError::protocol("handshake msg too long"));
    }

    let mut msg = vec![0u8; len];
    reader.read_exact(&mut msg).await?;
    Ok(msg)
}

/// Perform the handshake as the dialing side.
///
/// Returns the established transport state and the remote's proven node id.
///
/// # Errors
///
/// Returns [`TransportError::Handshake`] if any message fails to decrypt or
/// the identity announcement does not verify.
pub async fn perform_handshake_initiator<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    noise_keys: &NoiseKeypair,
    signing: &SigningKey,
) -> Result<(NoiseTransport, NodeId)> {
    let mut handshake = NoiseHandshake::new_initiator(noise_keys)?;

    let msg1 = handshake.write_message(&[])?;
    send_handshake_msg(stream, &msg1).await?;

    let msg2 = recv_handshake_msg(stream).await?;
    let payload = handshake.read_message(&msg2)?;

    let remote_static = handshake
        .get_remote_static()
        .ok_or_else(|| TransportError::Handshake("no remote static key".to_string()))?;
    let announcement: IdentityAnnouncement = serde_json::from_slice(&payload)
        .map_err(|_| TransportError::Handshake("missing identity announcement".to_string()))?;
    let remote_id = announcement.verify(&remote_static)?;

    let own = IdentityAnnouncement::new(signing, noise_keys.public_key())?;
    let own_payload = serde_json::to_vec(&own)
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    let msg3 = handshake.write_message(&own_payload)?;
    send_handshake_msg(stream, &msg3).await?;

    Ok((handshake.into_transport()?, remote_id))
}

/// Perform the handshake as the accepting side.
///
/// Returns the established transport state and the remote's proven node id.
///
/// # Errors
///
/// Returns [`TransportError::Handshake`] if any message fails to decrypt or
/// the identity announcement does not verify.
pub async fn perform_handshake_responder<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    noise_keys: &NoiseKeypair,
    signing: &SigningKey,
) -> Result<(NoiseTransport, NodeId)> {
    let mut handshake = NoiseHandshake::new_responder(noise_keys)?;

    let msg1 = recv_handshake_msg(stream).await?;
    handshake.read_message(&msg1)?;

    let own = IdentityAnnouncement::new(signing, noise_keys.public_key())?;
    let own_payload = serde_json::to_vec(&own)
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    let msg2 = handshake.write_message(&own_payload)?;
    send_handshake_msg(stream, &msg2).await?;

    let msg3 = recv_handshake_msg(stream).await?;
    let payload = handshake.read_message(&msg3)?;

    let remote_static = handshake
        .get_remote_static()
        .ok_or_else(|| TransportError::Handshake("no remote static key".to_string()))?;
    let announcement: IdentityAnnouncement = serde_json::from_slice(&payload)
        .map_err(|_| TransportError::Handshake("missing identity announcement".to_string()))?;
    let remote_id = announcement.verify(&remote_static)?;

    Ok((handshake.into_transport()?, remote_id))
}
