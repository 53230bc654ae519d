//! `Noise_XX` handshake for mutual session authentication.
//!
//! Implements the `Noise_XX` pattern using the snow library:
//! - Pattern: `XX` (mutual authentication, identity hiding)
//! - DH: `25519` (Curve25519)
//! - Cipher: `ChaChaPoly` (ChaCha20-Poly1305)
//! - Hash: `BLAKE2s`
//!
//! ## Message Flow
//!
//! ```text
//! Message 1: Initiator → Responder: e
//! Message 2: Responder → Initiator: e, ee, s, es   (+ identity announcement)
//! Message 3: Initiator → Responder: s, se          (+ identity announcement)
//! ```
//!
//! The handshake payloads of messages 2 and 3 carry each side's identity
//! announcement: the DER-encoded RSA public key plus a signature over the Noise
//! static key. Verifying that signature binds the encrypted session to the
//! node identifier, which is what the transport layer authenticates against.

use crate::CryptoError;
use snow::{Builder, HandshakeState, TransportState};
use zeroize::Zeroize;

/// Noise protocol pattern used by Shario sessions.
const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Maximum handshake message size.
///
/// The raw XX messages are at most 96 bytes; the identity announcement adds
/// a JSON payload of ~800 bytes (base64 DER public key plus an RSA
/// signature). Anything larger is malformed.
const MAX_HANDSHAKE_MSG_SIZE: usize = 4096;

/// Role in the Noise handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Initiates the handshake (sends message 1)
    Initiator,
    /// Responds to handshake (receives message 1)
    Responder,
}

/// State of the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Initial state, ready to start
    Initial,
    /// After message 1 (initiator sent, responder received)
    Message1Complete,
    /// After message 2 (responder sent, initiator received)
    Message2Complete,
    /// Handshake complete, transport ready
    Complete,
}

/// Static keypair for Noise handshakes.
///
/// This is the long-term session key; it is derived deterministically from
/// the identity key so the persisted identity file only needs to store the
/// RSA material.
pub struct NoiseKeypair {
    private: Vec<u8>,
    public: [u8; 32],
}

impl NoiseKeypair {
    /// Generate a new random keypair.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Handshake`] if keypair generation fails.
    pub fn generate() -> Result<Self, CryptoError> {
        let builder = Builder::new(
            NOISE_PATTERN
                .parse()
                .map_err(|e| CryptoError::Handshake(format!("pattern parse error: {e:?}")))?,
        );

        let keypair = builder
            .generate_keypair()
            .map_err(|e| CryptoError::Handshake(format!("keypair generation error: {e:?}")))?;

        let mut public = [0u8; 32];
        public.copy_from_slice(&keypair.public);

        Ok(Self {
            private: keypair.private,
            public,
        })
    }

    /// Derive the Noise static keypair from a 32-byte identity seed.
    ///
    /// The derivation is a pure function of the seed, so reloading the same
    /// identity yields the same session key.
    #[must_use]
    pub fn derive_from_seed(seed: &[u8; 32]) -> Self {
        let private: [u8; 32] = blake3::derive_key("shario v1 noise static key", seed);

        let secret = x25519_dalek::StaticSecret::from(private);
        let public = x25519_dalek::PublicKey::from(&secret).to_bytes();

        Self {
            private: private.to_vec(),
            public,
        }
    }

    /// Get the public key bytes.
    #[must_use]
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public
    }

    /// Get the private key bytes.
    #[must_use]
    pub fn private_key(&self) -> &[u8] {
        &self.private
    }
}

impl Drop for NoiseKeypair {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

impl Clone for NoiseKeypair {
    fn clone(&self) -> Self {
        Self {
            private: self.private.clone(),
            public: self.public,
        }
    }
}

/// `Noise_XX` handshake session.
///
/// Manages the 3-message handshake pattern for mutual authentication.
pub struct NoiseHandshake {
    state: HandshakeState,
    role: Role,
    phase: HandshakePhase,
}

impl NoiseHandshake {
    /// Create a new handshake as the initiator.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Handshake`] if the state cannot be built.
    pub fn new_initiator(local_keypair: &NoiseKeypair) -> Result<Self, CryptoError> {
        Self::new(local_keypair, Role::Initiator)
    }

    /// Create a new handshake as the responder.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Handshake`] if the state cannot be built.
    pub fn new_responder(local_keypair: &NoiseKeypair) -> Result<Self, CryptoError> {
        Self::new(local_keypair, Role::Responder)
    }

    fn new(local_keypair: &NoiseKeypair, role: Role) -> Result<Self, CryptoError> {
        let builder = Builder::new(
            NOISE_PATTERN
                .parse()
                .map_err(|e| CryptoError::Handshake(format!("pattern parse error: {e:?}")))?,
        );

        let builder = builder
            .local_private_key(&local_keypair.private)
            .map_err(|e| CryptoError::Handshake(format!("key error: {e:?}")))?;

        let state = match role {
            Role::Initiator => builder.build_initiator(),
            Role::Responder => builder.build_responder(),
        }
        .map_err(|e| CryptoError::Handshake(format!("build error: {e:?}")))?;

        Ok(Self {
            state,
            role,
            phase: HandshakePhase::Initial,
        })
    }

    /// Get the current handshake phase.
    #[must_use]
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Get the role of this handshake.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Check if the handshake is complete.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.phase == HandshakePhase::Complete
    }

    /// Write the next handshake message, optionally with a payload.
    ///
    /// Returns the message bytes to send to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Handshake`] if called in the wrong phase for
    /// the current role or the underlying state fails.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::Initial | HandshakePhase::Message2Complete)
            | (Role::Responder, HandshakePhase::Message1Complete) => {}
            _ => return Err(CryptoError::Handshake("write in wrong phase".to_string())),
        }

        let mut message = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = self.state.write_message(payload, &mut message)?;
        message.truncate(len);

        self.advance();
        Ok(message)
    }

    /// Read a handshake message from the peer.
    ///
    /// Returns any payload included in the message.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Handshake`] if called in the wrong phase for
    /// the current role or decryption fails.
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match (self.role, self.phase) {
            (Role::Responder, HandshakePhase::Initial | HandshakePhase::Message2Complete)
            | (Role::Initiator, HandshakePhase::Message1Complete) => {}
            _ => return Err(CryptoError::Handshake("read in wrong phase".to_string())),
        }

        let mut payload = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = self.state.read_message(message, &mut payload)?;
        payload.truncate(len);

        self.advance();
        Ok(payload)
    }

    fn advance(&mut self) {
        self.phase = match self.phase {
            HandshakePhase::Initial => HandshakePhase::Message1Complete,
            HandshakePhase::Message1Complete => HandshakePhase::Message2Complete,
            HandshakePhase::Message2Complete | HandshakePhase::Complete => HandshakePhase::Complete,
        };
    }

    /// Get the remote peer's static public key (available after message 2/3).
    #[must_use]
    pub fn get_remote_static(&self) -> Option<[u8; 32]> {
        self.state.get_remote_static().map(|key| {
            let mut arr = [0u8; 32];
            arr.copy_from_slice(key);
            arr
        })
    }

    /// Complete the handshake and transition to transport mode.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Handshake`] if the handshake is not complete.
    pub fn into_transport(self) -> Result<NoiseTransport, CryptoError> {
        if self.phase != HandshakePhase::Complete {
            return Err(CryptoError::Handshake("handshake not complete".to_string()));
        }

        let transport = self.state.into_transport_mode()?;
        Ok(NoiseTransport { transport })
    }
}

/// Established Noise transport: encrypts and decrypts session records.
pub struct NoiseTransport {
    transport: TransportState,
}

impl NoiseTransport {
    /// Encrypt a plaintext record.
    ///
    /// The plaintext must fit a single Noise record (≤ 65519 bytes); the
    /// framing layer splits larger messages.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] on cipher failure.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut out = vec![0u8; plaintext.len() + 16];
        let len = self
            .transport
            .write_message(plaintext, &mut out)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        out.truncate(len);
        Ok(out)
    }

    /// Decrypt a ciphertext record.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] on a bad MAC or corrupted
    /// record.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut out = vec![0u8; ciphertext.len()];
        let len = self
            .transport
            .read_message(ciphertext, &mut out)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        out.truncate(len);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_handshake() -> (NoiseTransport, NoiseTransport, [u8; 32], [u8; 32]) {
        let init_keys = NoiseKeypair::generate().unwrap();
        let resp_keys = NoiseKeypair::generate().unwrap();

        let mut initiator = NoiseHandshake::new_initiator(&init_keys).unwrap();
        let mut responder = NoiseHandshake::new_responder(&resp_keys).unwrap();

        let msg1 = initiator.write_message(&[]).unwrap();
        responder.read_message(&msg1).unwrap();

        let msg2 = responder.write_message(b"responder payload").unwrap();
        let payload2 = initiator.read_message(&msg2).unwrap();
        assert_eq!(payload2, b"responder payload");

        let msg3 = initiator.write_message(b"initiator payload").unwrap();
        let payload3 = responder.read_message(&msg3).unwrap();
        assert_eq!(payload3, b"initiator payload");

        assert!(initiator.is_complete());
        assert!(responder.is_complete());

        let remote_of_init = initiator.get_remote_static().unwrap();
        let remote_of_resp = responder.get_remote_static().unwrap();
        assert_eq!(remote_of_init, *resp_keys.public_key());
        assert_eq!(remote_of_resp, *init_keys.public_key());

        (
            initiator.into_transport().unwrap(),
            responder.into_transport().unwrap(),
            *init_keys.public_key(),
            *resp_keys.public_key(),
        )
    }

    #[test]
    fn test_full_handshake_and_transport() {
        let (mut a, mut b, _, _) = run_handshake();

        let ct = a.encrypt(b"hello over noise").unwrap();
        assert_ne!(ct, b"hello over noise");
        let pt = b.decrypt(&ct).unwrap();
        assert_eq!(pt, b"hello over noise");

        // And the other direction.
        let ct = b.encrypt(b"reply").unwrap();
        assert_eq!(a.decrypt(&ct).unwrap(), b"reply");
    }

    #[test]
    fn test_decrypt_rejects_tampered_record() {
        let (mut a, mut b, _, _) = run_handshake();

        let mut ct = a.encrypt(b"payload").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xff;

        assert!(matches!(b.decrypt(&ct), Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_wrong_phase_is_rejected() {
        let keys = NoiseKeypair::generate().unwrap();
        let mut responder = NoiseHandshake::new_responder(&keys).unwrap();

        // Responder cannot write before reading message 1.
        assert!(responder.write_message(&[]).is_err());
    }

    #[test]
    fn test_derived_keypair_is_deterministic() {
        let seed = [9u8; 32];
        let a = NoiseKeypair::derive_from_seed(&seed);
        let b = NoiseKeypair::derive_from_seed(&seed);
        assert_eq!(a.public_key(), b.public_key());

        let other = NoiseKeypair::derive_from_seed(&[10u8; 32]);
        assert_ne!(a.public_key(), other.public_key());
    }

    #[test]
    fn test_incomplete_handshake_cannot_enter_transport() {
        let keys = NoiseKeypair::generate().unwrap();
        let mut initiator = NoiseHandshake::new_initiator(&keys).unwrap();
        let _msg1 = initiator.write_message(&[]).unwrap();

        assert!(initiator.into_transport().is_err());
    }
}
