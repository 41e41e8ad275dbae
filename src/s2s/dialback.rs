//! Server Dialback (XEP-0220): key derivation and the `db:result` /
//! `db:verify` element shapes exchanged during the three-party handshake.

use hmac::{Hmac, Mac};
use rand::{RngCore, SeedableRng};
use sha2::{Digest, Sha256};

use crate::xml::{namespaces, Element};

type HmacSha256 = Hmac<Sha256>;

/// Per-process dialback key generator. The secret never leaves this struct;
/// peers only ever see derived keys.
#[derive(Clone)]
pub struct DialbackKey {
    secret_digest: [u8; 32],
}

impl std::fmt::Debug for DialbackKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialbackKey").finish_non_exhaustive()
    }
}

impl DialbackKey {
    pub fn new(secret: &[u8]) -> Self {
        let secret_digest = Sha256::digest(secret).into();
        Self { secret_digest }
    }

    /// A fresh random secret for processes without a configured one. Dialback
    /// keys only need to stay stable for the lifetime of the streams that
    /// carry them.
    pub fn generated() -> Self {
        let mut rng = rand_chacha::ChaCha20Rng::from_entropy();
        let mut secret = [0u8; 32];
        rng.fill_bytes(&mut secret);
        Self::new(&secret)
    }

    /// `hex(HMAC-SHA256(SHA256(secret), "from to stream-id"))`, lowercase.
    pub fn generate(&self, from: &str, to: &str, stream_id: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret_digest)
            .expect("hmac accepts any key length");
        mac.update(from.as_bytes());
        mac.update(b" ");
        mac.update(to.as_bytes());
        mac.update(b" ");
        mac.update(stream_id.as_bytes());

        hex::encode(mac.finalize().into_bytes())
    }

    pub fn verify(&self, key: &str, from: &str, to: &str, stream_id: &str) -> bool {
        self.generate(from, to, stream_id) == key
    }
}

/// The four dialback frames, as classified off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialbackFrame {
    /// `<db:result from to>key</db:result>`: the initiator asks us to verify
    /// its claimed domain.
    ResultRequest {
        from: String,
        to: String,
        key: String,
    },
    /// `<db:result type='valid|invalid'/>`: the receiving server's verdict on
    /// our own claim.
    ResultResponse {
        from: String,
        to: String,
        valid: bool,
    },
    /// `<db:verify from to id>key</db:verify>`: a receiving server asks us,
    /// as the authoritative server, whether we issued this key.
    VerifyRequest {
        from: String,
        to: String,
        id: String,
        key: String,
    },
    /// `<db:verify type='valid|invalid' id/>`: the authoritative server's
    /// answer to our verify request.
    VerifyResponse {
        from: String,
        to: String,
        id: String,
        valid: bool,
    },
}

pub fn classify(element: &Element) -> Option<DialbackFrame> {
    let is_result = element.validate("result", Some(namespaces::DIALBACK));
    let is_verify = element.validate("verify", Some(namespaces::DIALBACK));
    if !is_result && !is_verify {
        return None;
    }

    let from = element.attribute("from", None)?.to_string();
    let to = element.attribute("to", None)?.to_string();
    let verdict = element.attribute("type", None);

    if is_result {
        return match verdict {
            Some(verdict) => Some(DialbackFrame::ResultResponse {
                from,
                to,
                valid: verdict == "valid",
            }),
            None => Some(DialbackFrame::ResultRequest {
                from,
                to,
                key: element.text(),
            }),
        };
    }

    let id = element.attribute("id", None)?.to_string();
    match verdict {
        Some(verdict) => Some(DialbackFrame::VerifyResponse {
            from,
            to,
            id,
            valid: verdict == "valid",
        }),
        None => Some(DialbackFrame::VerifyRequest {
            from,
            to,
            id,
            key: element.text(),
        }),
    }
}

pub fn result_request(from: &str, to: &str, key: &str) -> Element {
    let mut result = Element::new("result", Some(namespaces::DIALBACK));
    result.set_attribute("from", None, from);
    result.set_attribute("to", None, to);
    result.add_text(key.to_string());
    result
}

pub fn result_response(from: &str, to: &str, valid: bool) -> Element {
    let mut result = Element::new("result", Some(namespaces::DIALBACK));
    result.set_attribute("from", None, from);
    result.set_attribute("to", None, to);
    result.set_attribute("type", None, if valid { "valid" } else { "invalid" });
    result
}

pub fn verify_request(from: &str, to: &str, id: &str, key: &str) -> Element {
    let mut verify = Element::new("verify", Some(namespaces::DIALBACK));
    verify.set_attribute("from", None, from);
    verify.set_attribute("to", None, to);
    verify.set_attribute("id", None, id);
    verify.add_text(key.to_string());
    verify
}

pub fn verify_response(from: &str, to: &str, id: &str, valid: bool) -> Element {
    let mut verify = Element::new("verify", Some(namespaces::DIALBACK));
    verify.set_attribute("from", None, from);
    verify.set_attribute("to", None, to);
    verify.set_attribute("id", None, id);
    verify.set_attribute("type", None, if valid { "valid" } else { "invalid" });
    verify
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_roundtrip() {
        let keys = DialbackKey::new(b"s3cr3t");
        let key = keys.generate("a.example", "b.example", "id-1");
        assert!(keys.verify(&key, "a.example", "b.example", "id-1"));
    }

    #[test]
    fn key_is_lowercase_hex() {
        let keys = DialbackKey::new(b"s3cr3t");
        let key = keys.generate("a.example", "b.example", "id-1");
        assert_eq!(key.len(), 64);
        assert!(key
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn any_field_mutation_fails_verification() {
        let keys = DialbackKey::new(b"s3cr3t");
        let key = keys.generate("a.example", "b.example", "id-1");
        assert!(!keys.verify(&key, "x.example", "b.example", "id-1"));
        assert!(!keys.verify(&key, "a.example", "x.example", "id-1"));
        assert!(!keys.verify(&key, "a.example", "b.example", "id-2"));
        assert!(!keys.verify("not-the-key", "a.example", "b.example", "id-1"));
    }

    #[test]
    fn different_secrets_disagree() {
        let ours = DialbackKey::new(b"ours");
        let theirs = DialbackKey::new(b"theirs");
        let key = ours.generate("a.example", "b.example", "id-1");
        assert!(!theirs.verify(&key, "a.example", "b.example", "id-1"));
    }

    #[test]
    fn classify_result_request() {
        let element = result_request("a.example", "b.example", "deadbeef");
        assert_eq!(
            classify(&element),
            Some(DialbackFrame::ResultRequest {
                from: "a.example".to_string(),
                to: "b.example".to_string(),
                key: "deadbeef".to_string(),
            })
        );
    }

    #[test]
    fn classify_result_response() {
        let element = result_response("b.example", "a.example", true);
        assert_eq!(
            classify(&element),
            Some(DialbackFrame::ResultResponse {
                from: "b.example".to_string(),
                to: "a.example".to_string(),
                valid: true,
            })
        );
    }

    #[test]
    fn classify_verify_frames() {
        let request = verify_request("b.example", "a.example", "id-1", "deadbeef");
        assert_eq!(
            classify(&request),
            Some(DialbackFrame::VerifyRequest {
                from: "b.example".to_string(),
                to: "a.example".to_string(),
                id: "id-1".to_string(),
                key: "deadbeef".to_string(),
            })
        );

        let response = verify_response("a.example", "b.example", "id-1", false);
        assert_eq!(
            classify(&response),
            Some(DialbackFrame::VerifyResponse {
                from: "a.example".to_string(),
                to: "b.example".to_string(),
                id: "id-1".to_string(),
                valid: false,
            })
        );
    }

    #[test]
    fn classify_ignores_other_elements() {
        let element = Element::new("message", Some(namespaces::XMPP_SERVER));
        assert_eq!(classify(&element), None);
    }
}
