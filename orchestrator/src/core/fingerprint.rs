//! Content fingerprints used as cache keys.
//!
//! A fingerprint hashes an operator name plus the inputs that change the
//! operator's answer. Fields are length-prefixed so `("ab", "c")` and
//! `("a", "bc")` never collide.

use sha2::{Digest, Sha256};

/// Incremental builder for an operator fingerprint.
#[derive(Clone)]
pub struct Fingerprint {
    operator: String,
    hasher: Sha256,
}

impl Fingerprint {
    pub fn new(operator: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"fp/v1\0");
        let mut fp = Self {
            operator: operator.to_string(),
            hasher,
        };
        fp.push(operator.as_bytes());
        fp
    }

    /// Add a named field.
    pub fn field(mut self, name: &str, value: &str) -> Self {
        self.push(name.as_bytes());
        self.push(value.as_bytes());
        self
    }

    /// Add a named list of values; order is significant.
    pub fn list<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.push(name.as_bytes());
        let mut count = 0u64;
        let mut inner = Sha256::new();
        for value in values {
            let bytes = value.as_ref().as_bytes();
            inner.update((bytes.len() as u64).to_le_bytes());
            inner.update(bytes);
            count += 1;
        }
        self.hasher.update(count.to_le_bytes());
        self.hasher.update(inner.finalize());
        self
    }

    /// Render as `"<operator>:<hex sha256>"`.
    pub fn finish(self) -> String {
        format!("{}:{}", self.operator, hex::encode(self.hasher.finalize()))
    }

    fn push(&mut self, bytes: &[u8]) {
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_prefixed_and_stable() {
        let a = Fingerprint::new("execution")
            .field("objective", "build a login page")
            .list("deps", ["design schema"])
            .finish();
        let b = Fingerprint::new("execution")
            .field("objective", "build a login page")
            .list("deps", ["design schema"])
            .finish();
        assert_eq!(a, b);
        assert!(a.starts_with("execution:"));
        assert_eq!(a.len(), "execution:".len() + 64);
    }

    #[test]
    fn field_boundaries_do_not_collide() {
        let a = Fingerprint::new("op").field("x", "ab").field("y", "c").finish();
        let b = Fingerprint::new("op").field("x", "a").field("y", "bc").finish();
        assert_ne!(a, b);
    }

    #[test]
    fn operator_name_changes_fingerprint() {
        let a = Fingerprint::new("creation").field("k", "v").finish();
        let b = Fingerprint::new("execution").field("k", "v").finish();
        assert_ne!(a[a.find(':').unwrap()..], b[b.find(':').unwrap()..]);
    }
}
