//! Identity resolution and storage key generation.

use sha2::{Digest, Sha256};

/// Number of digest bytes kept when a token is turned into a storage key.
const TOKEN_HASH_BYTES: usize = 8;

/// The kind of identity a request is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityClass {
    /// Client network address
    Ip,
    /// Opaque access token
    Token,
}

impl IdentityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityClass::Ip => "ip",
            IdentityClass::Token => "token",
        }
    }
}

impl std::fmt::Display for IdentityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved identity, safe to log and to use in storage keys.
///
/// For tokens, `key` is a truncated hash and `label` is the masked token;
/// the raw token is never retained.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    /// Identity class
    pub class: IdentityClass,
    /// Storage key component
    pub key: String,
    /// Human-readable form for messages and logs
    pub label: String,
}

impl IdentityKey {
    /// Resolve the identity for a request. A non-empty token wins over the address.
    pub fn resolve(ip: &str, token: &str) -> Self {
        if token.is_empty() {
            Self {
                class: IdentityClass::Ip,
                key: ip.to_string(),
                label: ip.to_string(),
            }
        } else {
            Self {
                class: IdentityClass::Token,
                key: hash_token(token),
                label: mask_token(token),
            }
        }
    }

    /// Counter key for the window starting at `epoch_secs`.
    ///
    /// Format: `{class}:{key}:{epoch_secs}`
    pub fn window_key(&self, epoch_secs: i64) -> String {
        format!("{}:{}:{}", self.class, self.key, epoch_secs)
    }

    /// Ban marker key. Format: `ban:{class}:{key}`
    pub fn ban_key(&self) -> String {
        format!("ban:{}:{}", self.class, self.key)
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.class, self.label)
    }
}

/// Hex-encoded first 8 bytes of the token's SHA-256 digest.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..TOKEN_HASH_BYTES])
}

/// Mask a token for display: first two and last two characters visible.
///
/// Tokens of four characters or fewer are fully masked.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }

    let mut masked = String::with_capacity(token.len());
    masked.extend(&chars[..2]);
    masked.push_str(&"*".repeat(chars.len() - 4));
    masked.extend(&chars[chars.len() - 2..]);
    masked
}
