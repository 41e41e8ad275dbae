use crate::xml::{namespaces, Element};

use super::jid::Jid;

/// Top-level routable element on a federation stream. Everything except the
/// addressing attributes and the name is carried opaquely.
#[derive(Debug, Clone)]
pub struct Stanza {
    pub element: Element,
}

pub const STANZA_NAMES: [&str; 3] = ["message", "presence", "iq"];

impl Stanza {
    pub fn new(element: Element) -> Self {
        Stanza { element }
    }

    /// True for the three stanza kinds; anything else on a stream is
    /// stream-level protocol, not traffic.
    pub fn is_routable(&self) -> bool {
        STANZA_NAMES.contains(&self.element.name())
    }

    pub fn from_attr(&self) -> Option<&str> {
        self.element.attribute("from", None)
    }

    pub fn to_attr(&self) -> Option<&str> {
        self.element.attribute("to", None)
    }

    pub fn id(&self) -> Option<&str> {
        self.element.attribute("id", None)
    }

    pub fn stanza_type(&self) -> Option<&str> {
        self.element.attribute("type", None)
    }

    pub fn is_error(&self) -> bool {
        self.stanza_type() == Some("error")
    }

    pub fn from_jid(&self) -> Option<Jid> {
        self.from_attr().and_then(|jid| jid.parse().ok())
    }

    pub fn to_jid(&self) -> Option<Jid> {
        self.to_attr().and_then(|jid| jid.parse().ok())
    }

    /// Rewrites this stanza into the error reply sent back to its originator:
    /// addresses swapped, `type='error'`, and a stanza error appended. Returns
    /// `None` for stanzas already of type error, which must never be bounced
    /// again.
    pub fn into_error_bounce(self, error_type: &str, condition: &str) -> Option<Stanza> {
        if self.is_error() {
            return None;
        }

        let mut element = self.element;
        let original_from = element.remove_attribute("from", None);
        let original_to = element.remove_attribute("to", None);

        if let Some(from) = original_from {
            element.set_attribute("to", None, from);
        }
        if let Some(to) = original_to {
            element.set_attribute("from", None, to);
        }
        element.set_attribute("type", None, "error");

        let mut error = Element::new("error", None);
        error.set_attribute("type", None, error_type);
        error.with_child(condition, Some(namespaces::XMPP_STANZA_ERRORS), |child| {
            child.set_attribute("xmlns", None, namespaces::XMPP_STANZA_ERRORS);
        });
        element.add_child(error);

        Some(Stanza { element })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(from: Option<&str>, to: Option<&str>, stanza_type: Option<&str>) -> Stanza {
        let mut element = Element::new("message", Some(namespaces::XMPP_SERVER));
        if let Some(from) = from {
            element.set_attribute("from", None, from);
        }
        if let Some(to) = to {
            element.set_attribute("to", None, to);
        }
        if let Some(stanza_type) = stanza_type {
            element.set_attribute("type", None, stanza_type);
        }
        element.set_attribute("id", None, "m1");
        Stanza::new(element)
    }

    #[test]
    fn routable_names() {
        assert!(message(None, None, None).is_routable());
        let other = Stanza::new(Element::new("handshake", None));
        assert!(!other.is_routable());
    }

    #[test]
    fn bounce_swaps_addresses_and_sets_type() {
        let stanza = message(Some("a@x.example"), Some("b@y.example"), Some("chat"));
        let bounce = stanza
            .into_error_bounce("cancel", "remote-server-not-found")
            .unwrap();

        assert_eq!(bounce.from_attr(), Some("b@y.example"));
        assert_eq!(bounce.to_attr(), Some("a@x.example"));
        assert_eq!(bounce.stanza_type(), Some("error"));
        assert_eq!(bounce.id(), Some("m1"));

        let error = bounce.element.find_child("error", None).unwrap();
        assert_eq!(error.attribute("type", None), Some("cancel"));
        assert!(error
            .find_child(
                "remote-server-not-found",
                Some(namespaces::XMPP_STANZA_ERRORS)
            )
            .is_some());
    }

    #[test]
    fn bounce_without_to_replies_to_sender() {
        let stanza = message(Some("a@x.example"), None, None);
        let bounce = stanza.into_error_bounce("modify", "jid-malformed").unwrap();

        assert_eq!(bounce.to_attr(), Some("a@x.example"));
        assert_eq!(bounce.from_attr(), None);
    }

    #[test]
    fn error_stanzas_are_never_bounced() {
        let stanza = message(Some("a@x.example"), Some("b@y.example"), Some("error"));
        assert!(stanza
            .into_error_bounce("cancel", "remote-server-not-found")
            .is_none());
    }
}
