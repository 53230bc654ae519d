//! Identity store.
//!
//! A node's identity is a persisted RSA-2048 keypair; the node identifier is
//! derived from its public half, which also signs the session keys during
//! handshakes. The file is tagged with the process id so co-resident
//! instances never collide on one keypair, is written with owner-only
//! permissions, and is rewritten atomically on every nickname change.

use crate::error::{NodeError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use shario_crypto::signatures::{Signature, SigningKey, VerifyingKey};
use shario_crypto::NodeId;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Nickname assigned to a freshly generated identity.
const DEFAULT_NICKNAME: &str = "Anonymous";

/// On-disk identity schema.
#[derive(Debug, Serialize, Deserialize)]
struct IdentityFile {
    nickname: String,
    public_key: String,
    private_key: String,
    peer_id: String,
}

/// The node's durable identity and mutable nickname.
pub struct IdentityStore {
    signing: Arc<SigningKey>,
    node_id: NodeId,
    nickname: RwLock<String>,
    path: PathBuf,
}

impl IdentityStore {
    /// Load the identity for this process tag, generating one on first run.
    ///
    /// # Errors
    ///
    /// - [`NodeError::Config`] if the directory cannot be created
    /// - [`NodeError::Identity`] if the file cannot be parsed, or the stored
    ///   keys and identifier disagree (tamper check)
    pub fn open(config_dir: &Path, process_tag: &str) -> Result<Self> {
        fs::create_dir_all(config_dir)
            .map_err(|_| NodeError::config("config directory cannot be created"))?;

        let path = config_dir.join(format!("identity_{process_tag}.json"));
        if path.exists() {
            let bytes = fs::read(&path)
                .map_err(|e| NodeError::Identity(format!("cannot read identity file: {e}")))?;
            let store = Self::from_file_bytes(&bytes, path.clone())?;
            tracing::info!("loaded identity {}", store.node_id.short());
            Ok(store)
        } else {
            let signing = SigningKey::generate(&mut OsRng)
                .map_err(|e| NodeError::Identity(format!("key generation failed: {e}")))?;
            let node_id = signing.node_id();
            let store = Self {
                signing: Arc::new(signing),
                node_id,
                nickname: RwLock::new(DEFAULT_NICKNAME.to_string()),
                path,
            };
            store.persist()?;
            tracing::info!("generated new identity {}", node_id.short());
            Ok(store)
        }
    }

    /// Parse and verify a serialized identity.
    fn from_file_bytes(bytes: &[u8], path: PathBuf) -> Result<Self> {
        let file: IdentityFile = serde_json::from_slice(bytes)
            .map_err(|e| NodeError::Identity(format!("malformed identity file: {e}")))?;

        let private_der = BASE64
            .decode(&file.private_key)
            .map_err(|e| NodeError::Identity(format!("malformed private key: {e}")))?;
        let signing = SigningKey::from_pkcs8_der(&private_der)
            .map_err(|e| NodeError::Identity(format!("invalid private key: {e}")))?;
        let node_id = signing.node_id();

        // Tamper check: the stored public key and identifier must both match
        // what the private key derives.
        let stored_public = BASE64
            .decode(&file.public_key)
            .map_err(|e| NodeError::Identity(format!("malformed public key: {e}")))?;
        let derived_public = signing
            .verifying_key()
            .to_public_key_der()
            .map_err(|e| NodeError::Identity(e.to_string()))?;
        if stored_public != derived_public {
            return Err(NodeError::Identity(
                "public key does not match private key".to_string(),
            ));
        }
        if file.peer_id != node_id.to_hex() {
            return Err(NodeError::Identity(
                "node identifier does not match key material".to_string(),
            ));
        }

        Ok(Self {
            signing: Arc::new(signing),
            node_id,
            nickname: RwLock::new(file.nickname),
            path,
        })
    }

    /// Import a previously exported identity, persisting it at the location
    /// `open` would use for the same directory and tag.
    ///
    /// # Errors
    ///
    /// Fails like [`Self::open`] when the serialized identity is malformed
    /// or its identifier does not re-derive.
    pub fn import(config_dir: &Path, process_tag: &str, bytes: &[u8]) -> Result<Self> {
        fs::create_dir_all(config_dir)
            .map_err(|_| NodeError::config("config directory cannot be created"))?;
        let path = config_dir.join(format!("identity_{process_tag}.json"));

        let store = Self::from_file_bytes(bytes, path)?;
        store.persist()?;
        Ok(store)
    }

    /// Serialize the identity, private key included.
    ///
    /// # Errors
    ///
    /// Returns a serialization error (should not happen).
    pub fn export(&self) -> Result<Vec<u8>> {
        let file = self.to_file()?;
        Ok(serde_json::to_vec_pretty(&file)?)
    }

    fn to_file(&self) -> Result<IdentityFile> {
        let public_der = self
            .signing
            .verifying_key()
            .to_public_key_der()
            .map_err(|e| NodeError::Identity(e.to_string()))?;
        let private_der = self
            .signing
            .to_pkcs8_der()
            .map_err(|e| NodeError::Identity(e.to_string()))?;

        Ok(IdentityFile {
            nickname: self.nickname(),
            public_key: BASE64.encode(public_der),
            private_key: BASE64.encode(private_der),
            peer_id: self.node_id.to_hex(),
        })
    }

    /// The node identifier derived from the public key.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The signing key shared with the transport layer.
    #[must_use]
    pub fn signing_key(&self) -> Arc<SigningKey> {
        Arc::clone(&self.signing)
    }

    /// Current nickname.
    #[must_use]
    pub fn nickname(&self) -> String {
        self.nickname.read().expect("nickname lock").clone()
    }

    /// Update the nickname and rewrite the identity file atomically.
    ///
    /// The nickname is trimmed; an empty result is rejected.
    ///
    /// # Errors
    ///
    /// - [`NodeError::EmptyNickname`] for whitespace-only input
    /// - I/O errors from the rewrite
    pub fn set_nickname(&self, nickname: &str) -> Result<()> {
        let trimmed = nickname.trim();
        if trimmed.is_empty() {
            return Err(NodeError::EmptyNickname);
        }

        *self.nickname.write().expect("nickname lock") = trimmed.to_string();
        self.persist()
    }

    /// Sign arbitrary bytes with the identity key.
    #[must_use]
    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.signing.sign(bytes)
    }

    /// The DER-encoded public key other nodes verify this identity with.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Identity`] if encoding fails.
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        self.signing
            .verifying_key()
            .to_public_key_der()
            .map_err(|e| NodeError::Identity(e.to_string()))
    }

    /// Verify a signature against a DER-encoded public key.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Identity`] when the key is invalid or the
    /// signature does not verify.
    pub fn verify(bytes: &[u8], signature: &Signature, public_key_der: &[u8]) -> Result<()> {
        let key = VerifyingKey::from_public_key_der(public_key_der)
            .map_err(|e| NodeError::Identity(e.to_string()))?;
        key.verify(bytes, signature)
            .map_err(|_| NodeError::Identity("signature verification failed".to_string()))
    }

    /// Write the identity file atomically: temp sibling, fsync, rename.
    fn persist(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.to_file()?)?;

        let tmp = self.path.with_extension("json.tmp");
        {
            use std::io::Write;
            let mut file = fs::File::create(&tmp)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                file.set_permissions(fs::Permissions::from_mode(0o600))?;
            }
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl std::fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityStore")
            .field("node_id", &self.node_id.short())
            .field("nickname", &self.nickname())
            .finish()
    }
}
