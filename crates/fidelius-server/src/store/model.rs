use serde::{Deserialize, Serialize};

/// Stored in redb as bincode-encoded bytes, keyed by secret id.
/// Both fields are opaque to the server: encryption happens client-side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecretRecord {
    /// Encoded ciphertext (payload + auth tag).
    pub ciphertext: String,
    /// Encoded nonce used for this ciphertext only.
    pub nonce: String,
    /// Unix timestamp (seconds) when the record was created.
    pub created_at: i64,
    /// Unix timestamp (seconds) from which the record is no longer readable.
    pub expires_at: i64,
}

impl SecretRecord {
    /// Returns true once `now` has reached the expiry timestamp.
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

/// What a successful consume hands back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Secret {
    pub ciphertext: String,
    pub nonce: String,
}

impl From<SecretRecord> for Secret {
    fn from(record: SecretRecord) -> Self {
        Self {
            ciphertext: record.ciphertext,
            nonce: record.nonce,
        }
    }
}

/// Upper bound on the encoded nonce. A 12-byte nonce is 16 base64 chars.
pub const MAX_NONCE_LEN: usize = 128;

/// Worst-case UTF-8 width of one plaintext character.
const UTF8_MAX_BYTES: usize = 4;
/// AEAD authentication tag.
const TAG_BYTES: usize = 16;
/// AEAD nonce / IV.
const IV_BYTES: usize = 12;
const SAFETY_MARGIN: usize = 128;

/// Size limits applied to incoming payloads before any storage access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadLimits {
    pub max_ciphertext_len: usize,
    pub max_nonce_len: usize,
}

impl PayloadLimits {
    /// Limits for secrets of at most `max_plain_chars` characters:
    /// `4 * ceil((4 * chars + 28) / 3) + 128`.
    ///
    /// `None` if the bound does not fit in a `usize`.
    pub fn checked_for_plaintext_chars(max_plain_chars: usize) -> Option<Self> {
        let raw = max_plain_chars
            .checked_mul(UTF8_MAX_BYTES)?
            .checked_add(TAG_BYTES + IV_BYTES)?;
        let max_ciphertext_len = raw
            .div_ceil(3)
            .checked_mul(4)?
            .checked_add(SAFETY_MARGIN)?;
        Some(Self {
            max_ciphertext_len,
            max_nonce_len: MAX_NONCE_LEN,
        })
    }

    /// Like [`checked_for_plaintext_chars`](Self::checked_for_plaintext_chars),
    /// saturating at `usize::MAX` instead of failing.
    pub fn for_plaintext_chars(max_plain_chars: usize) -> Self {
        Self::checked_for_plaintext_chars(max_plain_chars).unwrap_or(Self {
            max_ciphertext_len: usize::MAX,
            max_nonce_len: MAX_NONCE_LEN,
        })
    }
}

impl Default for PayloadLimits {
    fn default() -> Self {
        Self::for_plaintext_chars(5000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ciphertext_limit_matches_formula() {
        // 4 * ceil((20000 + 28) / 3) + 128 = 4 * 6676 + 128
        assert_eq!(
            PayloadLimits::for_plaintext_chars(5000).max_ciphertext_len,
            26_832
        );
        // 4 * ceil(32 / 3) + 128 = 4 * 11 + 128
        assert_eq!(PayloadLimits::for_plaintext_chars(1).max_ciphertext_len, 172);
        // 4 * ceil(28 / 3) + 128
        assert_eq!(PayloadLimits::for_plaintext_chars(0).max_ciphertext_len, 168);
    }

    #[test]
    fn oversized_char_limit_saturates_instead_of_wrapping() {
        assert_eq!(PayloadLimits::checked_for_plaintext_chars(usize::MAX / 2), None);
        assert_eq!(PayloadLimits::checked_for_plaintext_chars(usize::MAX), None);
        assert_eq!(
            PayloadLimits::for_plaintext_chars(usize::MAX / 2).max_ciphertext_len,
            usize::MAX
        );
        assert_eq!(
            PayloadLimits::checked_for_plaintext_chars(5000),
            Some(PayloadLimits::for_plaintext_chars(5000))
        );
    }

    #[test]
    fn expiry_is_inclusive_of_deadline() {
        let record = SecretRecord {
            ciphertext: "c".into(),
            nonce: "n".into(),
            created_at: 100,
            expires_at: 160,
        };
        assert!(!record.is_expired(159));
        assert!(record.is_expired(160));
        assert!(record.is_expired(161));
    }
}
