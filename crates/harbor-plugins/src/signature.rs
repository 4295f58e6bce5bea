//! Offline artifact signature verification using ed25519
//!
//! Publishers sign the SHA-256 digest of the artifact file; the manifest carries
//! the base64 signature and the host trusts a set of issuer public keys.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Public keys allowed to sign artifacts
#[derive(Debug, Clone, Default)]
pub struct TrustedKeys {
    keys: Vec<VerifyingKey>,
}

impl TrustedKeys {
    /// Parse base64 keys, returning the keys that could not be decoded alongside
    pub fn parse<S: AsRef<str>>(encoded: &[S]) -> (Self, Vec<String>) {
        let mut keys = Vec::new();
        let mut invalid = Vec::new();
        for key in encoded {
            match decode_key(key.as_ref()) {
                Ok(key) => keys.push(key),
                Err(reason) => invalid.push(reason),
            }
        }
        (Self { keys }, invalid)
    }

    pub fn from_keys(keys: Vec<VerifyingKey>) -> Self {
        Self { keys }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Verify a base64 signature over `digest` against any trusted key
    pub fn verify_digest(&self, digest: &[u8], signature_b64: &str) -> Result<(), String> {
        if self.keys.is_empty() {
            return Err("no trusted signing keys configured".to_string());
        }

        let bytes = BASE64_STANDARD
            .decode(signature_b64.trim())
            .map_err(|e| format!("invalid signature encoding: {e}"))?;
        let signature =
            Signature::from_slice(&bytes).map_err(|e| format!("invalid signature: {e}"))?;

        if self
            .keys
            .iter()
            .any(|key| key.verify(digest, &signature).is_ok())
        {
            Ok(())
        } else {
            Err("signature does not match any trusted key".to_string())
        }
    }
}

fn decode_key(encoded: &str) -> Result<VerifyingKey, String> {
    let bytes = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|e| format!("invalid key encoding: {e}"))?;
    let array: [u8; ed25519_dalek::PUBLIC_KEY_LENGTH] = bytes
        .try_into()
        .map_err(|_| "signing key must be 32 bytes".to_string())?;
    VerifyingKey::from_bytes(&array).map_err(|e| format!("invalid signing key: {e}"))
}

/// SHA-256 digest of an artifact file
pub fn artifact_digest(path: &Path) -> io::Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize().into())
}

/// Sign an artifact, returning the base64 signature to place in its manifest
pub fn sign_artifact(path: &Path, key: &SigningKey) -> io::Result<String> {
    let digest = artifact_digest(path)?;
    Ok(BASE64_STANDARD.encode(key.sign(&digest).to_bytes()))
}

/// Base64 form of a verifying key, as used in configuration
pub fn encode_public_key(key: &VerifyingKey) -> String {
    BASE64_STANDARD.encode(key.as_bytes())
}
