//! Server-to-server federation core of an XMPP server: session state
//! machines for both stream directions, per-domain coordination with dialback
//! and SASL EXTERNAL, and the supporting XML stream plumbing.

pub mod dns;
pub mod router;
pub mod s2s;
pub mod settings;
pub mod xml;
pub mod xmpp;
