//! RSA-2048 identity signatures.
//!
//! The signing key is the node's long-term identity; the node identifier is
//! the SHA-256 digest of its DER-encoded public key. During session
//! establishment each side signs its Noise static key, binding the encrypted
//! session to the identity that claims it. Signatures are PKCS#1 v1.5 over
//! SHA-256; keys travel and persist as DER (PKCS#8 private, SPKI public).

use crate::{CryptoError, NodeId, RSA_KEY_BITS, RSA_SIGNATURE_SIZE};
use rand_core::CryptoRngCore;
use rsa::pkcs1v15::{
    Signature as RsaSignature, SigningKey as RsaSigningKey, VerifyingKey as RsaVerifyingKey,
};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

/// RSA PKCS#1 v1.5 signature (256 bytes for a 2048-bit key)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(Vec<u8>);

impl Signature {
    /// Create a signature from a slice
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the slice does not have
    /// the length of an RSA-2048 signature.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != RSA_SIGNATURE_SIZE {
            return Err(CryptoError::InvalidSignature);
        }
        Ok(Self(slice.to_vec()))
    }

    /// Get the raw signature bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// RSA signing key (private half of the node identity)
///
/// The underlying key material is zeroized on drop by the `rsa` crate.
#[derive(Clone)]
pub struct SigningKey {
    private: RsaPrivateKey,
    signer: RsaSigningKey<Sha256>,
}

impl SigningKey {
    /// Generate a new RSA-2048 signing key
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if key generation fails
    /// (insufficient entropy).
    pub fn generate<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(rng, RSA_KEY_BITS)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self::from_private(private))
    }

    fn from_private(private: RsaPrivateKey) -> Self {
        let signer = RsaSigningKey::<Sha256>::new(private.clone());
        Self { private, signer }
    }

    /// Restore a signing key from its PKCS#8 DER encoding
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the bytes are not a valid
    /// PKCS#8 RSA private key.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self::from_private(private))
    }

    /// PKCS#8 DER encoding of the private key
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if encoding fails.
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(self
            .private
            .to_pkcs8_der()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .as_bytes()
            .to_vec())
    }

    /// Sign a message (PKCS#1 v1.5 over SHA-256)
    ///
    /// Signing is deterministic: the same message always produces the same
    /// signature with the same key.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signer.sign(message).to_vec())
    }

    /// Get the corresponding verifying key (public half)
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            public: RsaPublicKey::from(&self.private),
        }
    }

    /// Node identifier derived from this key's public half.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.verifying_key().node_id()
    }

    /// Deterministic 32-byte seed for the session-layer Noise static key.
    ///
    /// Derived from the private key material, so the same identity always
    /// presents the same static key; the session is additionally bound to
    /// the identity by the handshake signature.
    #[must_use]
    pub fn noise_seed(&self) -> [u8; 32] {
        let der = self.private.to_pkcs8_der().expect("valid key encodes");
        crate::hash::derive_key("shario v1 noise seed", der.as_bytes())
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("node_id", &self.node_id().short())
            .finish()
    }
}

/// RSA verifying key (public half of an identity)
#[derive(Clone)]
pub struct VerifyingKey {
    public: RsaPublicKey,
}

impl VerifyingKey {
    /// Create from an SPKI DER encoding
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the bytes are not a valid
    /// DER-encoded RSA public key.
    pub fn from_public_key_der(der: &[u8]) -> Result<Self, CryptoError> {
        let public = RsaPublicKey::from_public_key_der(der)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { public })
    }

    /// SPKI DER encoding of the public key
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if encoding fails.
    pub fn to_public_key_der(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(self
            .public
            .to_public_key_der()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .as_bytes()
            .to_vec())
    }

    /// Verify a signature over a message
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if verification fails.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        let signature = RsaSignature::try_from(signature.as_bytes())
            .map_err(|_| CryptoError::InvalidSignature)?;
        RsaVerifyingKey::<Sha256>::new(self.public.clone())
            .verify(message, &signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// Node identifier this key corresponds to: the SHA-256 digest of its
    /// DER encoding.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        let der = self
            .public
            .to_public_key_der()
            .expect("valid key encodes");
        NodeId::from_bytes(crate::hash::sha256(der.as_bytes()))
    }
}

impl std::fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyingKey")
            .field("node_id", &self.node_id().short())
            .finish()
    }
}
