//! Namespace identity derivation.
//!
//! A [`NamespaceId`] is the 8-character token that scopes one batch of jobs.
//! It is derived one-way from a seed (usually the enclosing Nomad job name)
//! so that every run of the same batch lands in the same namespace.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Fixed salt mixed into every derivation. Changing it changes every
/// namespace ever derived.
const SALT: &str = "PhridcyunDryehorgedraflomcaInGiagyaumOfDyabsyacutNeldUd7";

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Length of a namespace identity in characters
pub const ID_LEN: usize = 8;

/// Deterministic namespace identity (8 lowercase base-36 characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespaceId(String);

impl NamespaceId {
    /// Derive the identity for `seed`.
    pub fn derive(seed: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(SALT.as_bytes());
        hasher.update(seed.as_bytes());
        let digest = hasher.finalize();

        let mut encoded = encode_base36(&digest);
        encoded.truncate(ID_LEN);
        NamespaceId(encoded)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `"<id>-"` prefix applied to job and service names.
    pub fn prefix(&self) -> String {
        format!("{}-", self.0)
    }

    /// Prefix `name` unless it already carries this identity's prefix.
    pub fn prefixed(&self, name: &str) -> String {
        let prefix = self.prefix();
        if name.starts_with(&prefix) {
            name.to_string()
        } else {
            format!("{}{}", prefix, name)
        }
    }
}

impl std::fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Big-endian base-36 encoding, most significant digit first, with one `0`
/// per leading zero byte.
fn encode_base36(bytes: &[u8]) -> String {
    let mut number: Vec<u8> = bytes.iter().copied().skip_while(|b| *b == 0).collect();
    let mut digits = Vec::with_capacity(bytes.len() * 2);

    while !number.is_empty() {
        let mut remainder: u32 = 0;
        let mut quotient = Vec::with_capacity(number.len());
        for byte in &number {
            let acc = (remainder << 8) | u32::from(*byte);
            let q = acc / 36;
            remainder = acc % 36;
            if !(quotient.is_empty() && q == 0) {
                quotient.push(q as u8);
            }
        }
        digits.push(ALPHABET[remainder as usize]);
        number = quotient;
    }

    let leading_zeros = bytes.iter().take_while(|b| **b == 0).count();
    digits.extend(std::iter::repeat(b'0').take(leading_zeros));
    digits.reverse();

    String::from_utf8(digits).unwrap_or_default()
}
