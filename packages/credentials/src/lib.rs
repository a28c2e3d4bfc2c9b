//! LedgerGate: Credential Sealing
//!
//! Tenant-keyed sealing for credentials at rest and resolution of the
//! credential reference formats the control plane accepts.
//!
//! Reference formats:
//! - `sealed://<blob>`: sealed locally, opened here
//! - `cus-vault://<tenant>/<id>`: live external vault reference
//! - `vault://<path>`: legacy, rejected
//!
//! Sealing never persists plaintext: a per-tenant key is derived from the
//! master key with HMAC-SHA256, the payload is XORed with a SHA-256 counter
//! keystream, and an HMAC tag binds nonce, ciphertext, and caller context.
//! Tampering, a wrong tenant, or a wrong context fails closed.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const SEALED_PREFIX: &str = "sealed://";
const LIVE_VAULT_PREFIX: &str = "cus-vault://";
const LEGACY_VAULT_PREFIX: &str = "vault://";
const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 32;

/// Credential handling failures.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CredentialError {
    #[error("credential reference format not recognized")]
    InvalidFormat,

    #[error("legacy vault:// references are no longer accepted")]
    LegacyVaultRejected,

    #[error("credential could not be opened: wrong key, tenant, context, or tampering")]
    OpenFailed,
}

/// Outcome of resolving a credential reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedCredential {
    /// The sealed blob opened locally.
    Plaintext(String),
    /// A live external vault reference; resolution happens out-of-process.
    External { path: String },
}

/// Seals and opens tenant credentials.
pub struct CredentialService {
    master_key: [u8; 32],
}

impl CredentialService {
    pub fn new(master_key: [u8; 32]) -> Self {
        Self { master_key }
    }

    /// Development-only keying when no master key is provisioned.
    pub fn with_dev_key() -> Self {
        tracing::warn!("credential service running with a derived development key");
        let digest = Sha256::digest(b"ledgergate-development-master-key");
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self::new(key)
    }

    fn tenant_key(&self, tenant_id: &str) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(&self.master_key)
            .expect("HMAC accepts keys of any length");
        mac.update(tenant_id.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&mac.finalize().into_bytes());
        key
    }

    fn keystream_block(key: &[u8; 32], nonce: &[u8], counter: u64) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(nonce);
        hasher.update(counter.to_le_bytes());
        let digest = hasher.finalize();
        let mut block = [0u8; 32];
        block.copy_from_slice(&digest);
        block
    }

    fn apply_keystream(key: &[u8; 32], nonce: &[u8], data: &mut [u8]) {
        for (i, chunk) in data.chunks_mut(32).enumerate() {
            let block = Self::keystream_block(key, nonce, i as u64);
            for (byte, pad) in chunk.iter_mut().zip(block.iter()) {
                *byte ^= pad;
            }
        }
    }

    fn tag(key: &[u8; 32], nonce: &[u8], ciphertext: &[u8], context: &str) -> [u8; 32] {
        let mut mac =
            HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
        mac.update(nonce);
        mac.update(ciphertext);
        mac.update(context.as_bytes());
        let mut tag = [0u8; 32];
        tag.copy_from_slice(&mac.finalize().into_bytes());
        tag
    }

    /// Seal a credential for a tenant. `context` is bound into the tag and
    /// must match at open time.
    pub fn seal(&self, tenant_id: &str, plaintext: &str, context: &str) -> String {
        let key = self.tenant_key(tenant_id);
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut ciphertext = plaintext.as_bytes().to_vec();
        Self::apply_keystream(&key, &nonce, &mut ciphertext);
        let tag = Self::tag(&key, &nonce, &ciphertext, context);

        let mut blob = Vec::with_capacity(NONCE_LEN + TAG_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&tag);
        blob.extend_from_slice(&ciphertext);
        format!("{SEALED_PREFIX}{}", BASE64.encode(blob))
    }

    /// Open a sealed credential. Fails closed on any mismatch.
    pub fn open(
        &self,
        tenant_id: &str,
        credential_ref: &str,
        context: &str,
    ) -> Result<String, CredentialError> {
        let encoded = credential_ref
            .strip_prefix(SEALED_PREFIX)
            .ok_or(CredentialError::InvalidFormat)?;
        let blob = BASE64
            .decode(encoded)
            .map_err(|_| CredentialError::InvalidFormat)?;
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(CredentialError::InvalidFormat);
        }

        let (nonce, rest) = blob.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let key = self.tenant_key(tenant_id);
        let expected = Self::tag(&key, nonce, ciphertext, context);
        // Constant-time comparison over the full tag.
        let mismatch = tag
            .iter()
            .zip(expected.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if mismatch != 0 {
            tracing::warn!(tenant_id = %tenant_id, "sealed credential failed authentication");
            return Err(CredentialError::OpenFailed);
        }

        let mut plaintext = ciphertext.to_vec();
        Self::apply_keystream(&key, nonce, &mut plaintext);
        String::from_utf8(plaintext).map_err(|_| CredentialError::OpenFailed)
    }

    /// Resolve a credential reference to plaintext or a live external
    /// pointer. Legacy `vault://` references are rejected.
    pub fn resolve(
        &self,
        tenant_id: &str,
        credential_ref: &str,
        context: &str,
    ) -> Result<ResolvedCredential, CredentialError> {
        if credential_ref.starts_with(SEALED_PREFIX) {
            return self
                .open(tenant_id, credential_ref, context)
                .map(ResolvedCredential::Plaintext);
        }
        if let Some(path) = credential_ref.strip_prefix(LIVE_VAULT_PREFIX) {
            return Ok(ResolvedCredential::External {
                path: path.to_string(),
            });
        }
        if credential_ref.starts_with(LEGACY_VAULT_PREFIX) {
            return Err(CredentialError::LegacyVaultRejected);
        }
        Err(CredentialError::InvalidFormat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> CredentialService {
        CredentialService::new([7u8; 32])
    }

    #[test]
    fn test_seal_open_round_trip() {
        let service = service();
        let sealed = service.seal("t-1", "sk-live-abcdef123456", "integration:int-1");
        assert!(sealed.starts_with("sealed://"));

        let opened = service.open("t-1", &sealed, "integration:int-1").unwrap();
        assert_eq!(opened, "sk-live-abcdef123456");
    }

    #[test]
    fn test_wrong_tenant_fails_closed() {
        let service = service();
        let sealed = service.seal("t-1", "secret", "ctx");
        assert_eq!(
            service.open("t-2", &sealed, "ctx"),
            Err(CredentialError::OpenFailed)
        );
    }

    #[test]
    fn test_wrong_context_fails_closed() {
        let service = service();
        let sealed = service.seal("t-1", "secret", "integration:int-1");
        assert_eq!(
            service.open("t-1", &sealed, "integration:int-2"),
            Err(CredentialError::OpenFailed)
        );
    }

    #[test]
    fn test_tampered_blob_fails_closed() {
        let service = service();
        let sealed = service.seal("t-1", "secret", "ctx");
        let encoded = sealed.strip_prefix("sealed://").unwrap();
        let mut blob = BASE64.decode(encoded).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        let tampered = format!("sealed://{}", BASE64.encode(blob));
        assert_eq!(
            service.open("t-1", &tampered, "ctx"),
            Err(CredentialError::OpenFailed)
        );
    }

    #[test]
    fn test_resolve_formats() {
        let service = service();

        let sealed = service.seal("t-1", "secret", "ctx");
        assert_eq!(
            service.resolve("t-1", &sealed, "ctx").unwrap(),
            ResolvedCredential::Plaintext("secret".to_string())
        );

        assert_eq!(
            service.resolve("t-1", "cus-vault://t-1/prod-key", "ctx").unwrap(),
            ResolvedCredential::External {
                path: "t-1/prod-key".to_string()
            }
        );

        assert_eq!(
            service.resolve("t-1", "vault://legacy/path", "ctx"),
            Err(CredentialError::LegacyVaultRejected)
        );

        assert_eq!(
            service.resolve("t-1", "plain-api-key", "ctx"),
            Err(CredentialError::InvalidFormat)
        );
    }

    #[test]
    fn test_distinct_nonces_per_seal() {
        let service = service();
        let a = service.seal("t-1", "secret", "ctx");
        let b = service.seal("t-1", "secret", "ctx");
        assert_ne!(a, b);
        assert_eq!(service.open("t-1", &a, "ctx").unwrap(), "secret");
        assert_eq!(service.open("t-1", &b, "ctx").unwrap(), "secret");
    }
}
