//! Builders and recognizers for the stream-level frames both session state
//! machines exchange: features, STARTTLS, SASL EXTERNAL, stream errors.

use base64::prelude::*;

use crate::xml::{namespaces, Element};

use super::StreamErrorCondition;

pub const MECHANISM_EXTERNAL: &str = "EXTERNAL";

/// `<stream:features>` advertised to an inbound peer. EXTERNAL is offered
/// only on a TLS stream of a secure domain that has not yet authenticated;
/// every other combination gets the empty element, which tells the peer to
/// carry on with dialback.
pub fn features(secure_domain: bool, secure: bool, authed: bool) -> Element {
    let mut features = Element::new("features", Some(namespaces::XMPP_STREAMS));

    if secure_domain && secure && !authed {
        features.with_child("mechanisms", Some(namespaces::XMPP_SASL), |mechanisms| {
            mechanisms.set_attribute("xmlns", None, namespaces::XMPP_SASL);
            mechanisms.with_child("mechanism", Some(namespaces::XMPP_SASL), |mechanism| {
                mechanism.add_text(MECHANISM_EXTERNAL.to_string());
            });
        });
    }

    features
}

pub fn is_features(element: &Element) -> bool {
    element.validate("features", Some(namespaces::XMPP_STREAMS))
}

/// Does a peer's `<stream:features>` advertise STARTTLS?
pub fn features_offer_starttls(element: &Element) -> bool {
    element
        .find_child("starttls", Some(namespaces::XMPP_STARTTLS))
        .is_some()
}

/// Does a peer's `<stream:features>` advertise the EXTERNAL SASL mechanism?
pub fn features_offer_external(element: &Element) -> bool {
    let Some(mechanisms) = element.find_child("mechanisms", Some(namespaces::XMPP_SASL)) else {
        return false;
    };

    mechanisms.child_elements().any(|mechanism| {
        mechanism.validate("mechanism", Some(namespaces::XMPP_SASL))
            && mechanism.text() == MECHANISM_EXTERNAL
    })
}

pub fn starttls() -> Element {
    let mut starttls = Element::new("starttls", Some(namespaces::XMPP_STARTTLS));
    starttls.set_attribute("xmlns", None, namespaces::XMPP_STARTTLS);
    starttls
}

pub fn is_starttls(element: &Element) -> bool {
    element.validate("starttls", Some(namespaces::XMPP_STARTTLS))
}

pub fn proceed() -> Element {
    let mut proceed = Element::new("proceed", Some(namespaces::XMPP_STARTTLS));
    proceed.set_attribute("xmlns", None, namespaces::XMPP_STARTTLS);
    proceed
}

pub fn is_proceed(element: &Element) -> bool {
    element.validate("proceed", Some(namespaces::XMPP_STARTTLS))
}

/// `<auth mechanism='EXTERNAL'>` with the authorization identity, our own
/// domain, as base64 text.
pub fn sasl_auth_external(authzid: &str) -> Element {
    let mut auth = Element::new("auth", Some(namespaces::XMPP_SASL));
    auth.set_attribute("xmlns", None, namespaces::XMPP_SASL);
    auth.set_attribute("mechanism", None, MECHANISM_EXTERNAL);
    auth.add_text(BASE64_STANDARD.encode(authzid));
    auth
}

pub fn is_sasl_auth(element: &Element) -> bool {
    element.validate("auth", Some(namespaces::XMPP_SASL))
}

pub fn sasl_success() -> Element {
    let mut success = Element::new("success", Some(namespaces::XMPP_SASL));
    success.set_attribute("xmlns", None, namespaces::XMPP_SASL);
    success
}

pub fn is_sasl_success(element: &Element) -> bool {
    element.validate("success", Some(namespaces::XMPP_SASL))
}

pub fn sasl_failure_not_authorized() -> Element {
    let mut failure = Element::new("failure", Some(namespaces::XMPP_SASL));
    failure.set_attribute("xmlns", None, namespaces::XMPP_SASL);
    failure.with_child("not-authorized", Some(namespaces::XMPP_SASL), |_| {});
    failure
}

pub fn is_sasl_failure(element: &Element) -> bool {
    element.validate("failure", Some(namespaces::XMPP_SASL))
}

pub fn stream_error(condition: StreamErrorCondition) -> Element {
    let mut error = Element::new("error", Some(namespaces::XMPP_STREAMS));
    error.with_child(
        condition.as_str(),
        Some(namespaces::XMPP_STREAM_ERRORS),
        |child| {
            child.set_attribute("xmlns", None, namespaces::XMPP_STREAM_ERRORS);
        },
    );
    error
}
