use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// HMAC / SHA-256 signing of bus envelopes
// ---------------------------------------------------------------------------

/// Compute SHA-256 hash of data. Returns hex digest string.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Signs and verifies bus envelopes with a shared secret.
///
/// The MAC covers `channel` and `body` so a valid envelope cannot be replayed
/// onto a different channel:
///
/// 1. SHA-256 of `channel \n body`, hex encoded
/// 2. HMAC-SHA256(secret, hash), hex encoded
#[derive(Clone)]
pub struct BusSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for BusSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSigner").finish_non_exhaustive()
    }
}

impl BusSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self, channel: &str, body: &str) -> Option<HmacSha256> {
        let digest = sha256_hex(format!("{channel}\n{body}").as_bytes());
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret).ok()?;
        mac.update(digest.as_bytes());
        Some(mac)
    }

    pub fn sign(&self, channel: &str, body: &str) -> String {
        self.mac(channel, body)
            .map(|mac| hex::encode(mac.finalize().into_bytes()))
            .unwrap_or_default()
    }

    /// Constant-time check of a hex signature.
    pub fn verify(&self, channel: &str, body: &str, signature: &str) -> bool {
        let Ok(raw) = hex::decode(signature) else {
            return false;
        };
        self.mac(channel, body)
            .is_some_and(|mac| mac.verify_slice(&raw).is_ok())
    }
}
