use base64::prelude::*;
use rand::{RngCore, SeedableRng};

use super::jid::Jid;

/// Identifier the receiving side assigns to one direction of a stream. Feeds
/// into dialback key derivation, so it must be unpredictable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamId(String);

impl StreamId {
    pub fn new() -> Self {
        let id = Self::generate_id();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn generate_id() -> String {
        let mut rng = rand_chacha::ChaCha20Rng::from_entropy();
        let mut id_raw = [0u8; 16];
        rng.fill_bytes(&mut id_raw);

        BASE64_STANDARD.encode(id_raw)
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attributes of a `<stream:stream>` opening tag, either direction. The `id`
/// is kept verbatim; only the side that generated it may interpret it.
#[derive(Debug, Default)]
pub struct StreamHeader {
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub id: Option<String>,
    pub version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::StreamId;

    #[test]
    fn ids_are_unique() {
        assert_ne!(StreamId::new(), StreamId::new());
    }

    #[test]
    fn id_is_not_empty() {
        assert!(!StreamId::new().as_str().is_empty());
    }
}
