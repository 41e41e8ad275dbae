//! Multiplexer over the hosted domains: finds the domain context an inbound
//! stream or outbound stanza belongs to.

use std::collections::HashMap;

use anyhow::{anyhow, Error};

use crate::s2s::context::DomainContextHandle;
use crate::xmpp::jid::normalize_domain;
use crate::xmpp::stanza::Stanza;

#[derive(Default)]
pub struct Router {
    contexts: HashMap<String, DomainContextHandle>,
}

impl Router {
    pub fn new() -> Self {
        Router {
            contexts: HashMap::new(),
        }
    }

    pub fn register(&mut self, context: DomainContextHandle) {
        self.contexts
            .insert(normalize_domain(context.domain()), context);
    }

    pub fn context(&self, domain: &str) -> Option<&DomainContextHandle> {
        self.contexts.get(&normalize_domain(domain))
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.contexts.keys().map(|domain| domain.as_str())
    }

    /// Route an outbound stanza via the context hosting its `from` domain.
    pub fn send(&self, stanza: Stanza) -> Result<(), Error> {
        let from = stanza
            .from_jid()
            .ok_or_else(|| anyhow!("outbound stanza without a valid from address"))?;

        match self.context(from.domain()) {
            Some(context) => {
                context.send(stanza);
                Ok(())
            }
            None => Err(anyhow!("no hosted domain \"{}\"", from.domain())),
        }
    }

    /// Terminate every session of every hosted domain.
    pub fn end(&self) {
        for context in self.contexts.values() {
            context.end();
        }
    }
}
