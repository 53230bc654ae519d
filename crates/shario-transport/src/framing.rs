//! Encrypted record framing for established sessions.
//!
//! A session carries logical messages (substreams) over a stream socket.
//! On the wire each record is `[u16 length][Noise ciphertext]`. A logical
//! message is one bincode-encoded [`Frame`]; its byte length travels in a
//! 4-byte header record, followed by the frame bytes split across as many
//! records as needed. Records never interleave between messages on a
//! connection, which is what gives substreams their per-connection ordering.
//!
//! The Noise transport state is shared between the read and write halves of
//! a connection, so it is guarded by a mutex that is only held for the
//! in-memory cipher operation, never across socket I/O.

use crate::error::{Result, TransportError};
use serde::{Deserialize, Serialize};
use shario_crypto::noise::NoiseTransport;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest plaintext carried in one encrypted record.
///
/// Kept under the Noise record ceiling (65535 bytes including the 16-byte
/// tag) with headroom.
const RECORD_MAX_PLAINTEXT: usize = 60_000;

/// One substream message: a protocol name and a single framed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Protocol the substream was opened for (e.g. `/shario/chat/1.0.0`)
    pub protocol: String,
    /// The message bytes
    pub payload: Vec<u8>,
}

/// Encrypt and write one record.
async fn write_record<W: AsyncWrite + Unpin>(
    writer: &mut W,
    noise: &Mutex<NoiseTransport>,
    plaintext: &[u8],
) -> Result<()> {
    debug_assert!(plaintext.len() <= RECORD_MAX_PLAINTEXT);

    let ciphertext = {
        let mut guard = noise.lock().expect("noise cipher lock poisoned");
        guard.encrypt(plaintext)?
    };

    let len =
        u16::try_from(ciphertext.len()).map_err(|_| TransportError::protocol("record too long"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&ciphertext).await?;
    Ok(())
}

/// Read and decrypt one record.
async fn read_record<R: AsyncRead + Unpin>(
    reader: &mut R,
    noise: &Mutex<NoiseTransport>,
) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut ciphertext = vec![0u8; len];
    reader.read_exact(&mut ciphertext).await?;

    let mut guard = noise.lock().expect("noise cipher lock poisoned");
    Ok(guard.decrypt(&ciphertext)?)
}

/// Write one logical message (a complete substream) to the connection.
///
/// Resolves only after every record has been handed to the socket, so a
/// caller that awaits this before sending the next message gets serial,
/// in-order emission.
///
/// # Errors
///
/// Returns an error on cipher failure or socket I/O failure.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    noise: &Mutex<NoiseTransport>,
    frame: &Frame,
) -> Result<()> {
    let bytes =
        bincode::serialize(frame).map_err(|e| TransportError::Protocol(e.to_string().into()))?;

    let len = u32::try_from(bytes.len())
        .map_err(|_| TransportError::protocol("frame length overflow"))?;
    write_record(writer, noise, &len.to_be_bytes()).await?;

    for chunk in bytes.chunks(RECORD_MAX_PLAINTEXT) {
        write_record(writer, noise, chunk).await?;
    }

    writer.flush().await?;
    Ok(())
}

/// Read one logical message from the connection.
///
/// Waits without bound for the start of a message (idle sessions are fine),
/// but once a message has begun every continuation record must arrive within
/// `continuation_timeout`; a stalled message closes the connection.
///
/// # Errors
///
/// Returns an error on EOF, decryption failure, a frame above `max_frame_len`
/// or a mid-message stall.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    noise: &Mutex<NoiseTransport>,
    max_frame_len: usize,
    continuation_timeout: Duration,
) -> Result<Frame> {
    let header = read_record(reader, noise).await?;
    let header: [u8; 4] = header
        .try_into()
        .map_err(|_| TransportError::protocol("bad message header"))?;
    let total = u32::from_be_bytes(header) as usize;

    if total > max_frame_len {
        return Err(TransportError::protocol("frame exceeds message ceiling"));
    }

    let mut bytes = Vec::with_capacity(total);
    while bytes.len() < total {
        let record = tokio::time::timeout(continuation_timeout, read_record(reader, noise))
            .await
            .map_err(|_| TransportError::timeout("mid-message read stalled"))??;
        bytes.extend_from_slice(&record);
    }

    if bytes.len() != total {
        return Err(TransportError::protocol("record overrun"));
    }

    bincode::deserialize(&bytes).map_err(|e| TransportError::Protocol(e.to_string().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shario_crypto::noise::{NoiseHandshake, NoiseKeypair};

    fn noise_pair() -> (Mutex<NoiseTransport>, Mutex<NoiseTransport>) {
        let a_keys = NoiseKeypair::generate().unwrap();
        let b_keys = NoiseKeypair::generate().unwrap();

        let mut a = NoiseHandshake::new_initiator(&a_keys).unwrap();
        let mut b = NoiseHandshake::new_responder(&b_keys).unwrap();

        let m1 = a.write_message(&[]).unwrap();
        b.read_message(&m1).unwrap();
        let m2 = b.write_message(&[]).unwrap();
        a.read_message(&m2).unwrap();
        let m3 = a.write_message(&[]).unwrap();
        b.read_message(&m3).unwrap();

        (
            Mutex::new(a.into_transport().unwrap()),
            Mutex::new(b.into_transport().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_message_round_trip() {
        let (sender_noise, receiver_noise) = noise_pair();
        let (mut tx, mut rx) = tokio::io::duplex(256 * 1024);

        let frame = Frame {
            protocol: "/shario/chat/1.0.0".to_string(),
            payload: b"{\"type\":\"text\"}".to_vec(),
        };

        write_message(&mut tx, &sender_noise, &frame).await.unwrap();

        let got = read_message(&mut rx, &receiver_noise, 64 * 1024, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(got, frame);
    }

    #[tokio::test]
    async fn test_multiple_messages_stay_ordered() {
        let (sender_noise, receiver_noise) = noise_pair();
        let (mut tx, mut rx) = tokio::io::duplex(256 * 1024);

        for i in 0u8..10 {
            let frame = Frame {
                protocol: "/shario/transfer/1.0.0".to_string(),
                payload: vec![i; 100],
            };
            write_message(&mut tx, &sender_noise, &frame).await.unwrap();
        }

        for i in 0u8..10 {
            let got = read_message(&mut rx, &receiver_noise, 64 * 1024, Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(got.payload, vec![i; 100]);
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (sender_noise, receiver_noise) = noise_pair();
        let (mut tx, mut rx) = tokio::io::duplex(1024 * 1024);

        let frame = Frame {
            protocol: "p".to_string(),
            payload: vec![0u8; 128 * 1024],
        };

        let writer = tokio::spawn(async move {
            let _ = write_message(&mut tx, &sender_noise, &frame).await;
        });

        let err = read_message(&mut rx, &receiver_noise, 64 * 1024, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
        writer.abort();
    }

    #[tokio::test]
    async fn test_tampered_record_fails_decrypt() {
        let (sender_noise, receiver_noise) = noise_pair();
        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);

        let frame = Frame {
            protocol: "p".to_string(),
            payload: vec![1, 2, 3],
        };
        write_message(&mut tx, &sender_noise, &frame).await.unwrap();
        drop(tx);

        // Tamper with the stream by copying through a corrupting proxy.
        let mut raw = Vec::new();
        rx.read_to_end(&mut raw).await.unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;

        let mut cursor = std::io::Cursor::new(raw);
        let err = read_message(
            &mut cursor,
            &receiver_noise,
            64 * 1024,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Crypto(shario_crypto::CryptoError::DecryptionFailed)
        ));
    }
}
