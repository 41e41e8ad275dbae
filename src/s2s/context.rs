//! Per-hosted-domain coordinator. One actor task owns the inbound and
//! outbound session maps, the pre-authentication queues, and all dialback
//! bookkeeping for its domain; sessions talk to it exclusively through typed
//! channel messages, so every state transition for a domain is serialized.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::settings::Credentials;
use crate::xml::Element;
use crate::xmpp::stanza::Stanza;

use super::{dialback, StreamErrorCondition};

/// Commands a context issues to one of its outgoing sessions.
#[derive(Debug)]
pub enum OutgoingCommand {
    SendStanza(Stanza),
    SendElement(Element),
    End,
}

#[derive(Debug, Clone)]
pub struct OutgoingHandle {
    pub id: Uuid,
    pub tx: mpsc::UnboundedSender<OutgoingCommand>,
}

/// Commands a context issues to one of its incoming sessions.
#[derive(Debug)]
pub enum IncomingCommand {
    SendElement(Element),
    /// Outcome of the dialback verification this session asked for. The
    /// session reports `<db:result type=…>` to its peer and, when valid,
    /// starts accepting stanzas for `peer`.
    DialbackOutcome { peer: String, valid: bool },
    CloseWithError(StreamErrorCondition),
    End,
}

#[derive(Debug, Clone)]
pub struct IncomingHandle {
    pub id: Uuid,
    pub tx: mpsc::UnboundedSender<IncomingCommand>,
}

/// Opens outgoing federation links on behalf of a context. The production
/// implementation resolves SRV targets and spawns an
/// [`super::outgoing::OutgoingSession`]; tests substitute a recorder.
pub trait OutboundConnector: Send + Sync {
    fn spawn(
        &self,
        local_domain: String,
        remote_domain: String,
        credentials: Option<Credentials>,
        events: mpsc::UnboundedSender<ContextCommand>,
        session_id: Uuid,
    ) -> OutgoingHandle;
}

#[derive(Debug)]
pub enum ContextCommand {
    SetCredentials(Credentials),
    /// Route an outbound stanza towards its `to` domain.
    Send(Stanza),
    /// Ship a protocol element to a remote domain as soon as the outgoing
    /// stream is connected, without waiting for authentication. Dialback
    /// frames travel this way.
    SendRaw {
        element: Element,
        destination: String,
    },
    /// Admit a verified inbound stream for `domain`.
    AddInStream {
        domain: String,
        session: IncomingHandle,
    },
    /// Authoritative dialback check: did our outgoing stream to `domain` send
    /// `key` for `stream_id`?
    VerifyDialback {
        domain: String,
        stream_id: String,
        key: String,
        respond_to: oneshot::Sender<bool>,
    },
    /// Run the verify round-trip for an inbound stream claiming `from`.
    VerifyIncoming {
        from: String,
        stream_id: String,
        key: String,
        session: IncomingHandle,
    },
    /// An authenticated inbound stream received a stanza; filter and deliver.
    Deliver { peer: String, element: Element },
    InStreamClosed { session_id: Uuid },
    End,

    // outgoing session lifecycle
    OutStreamConnected {
        remote: String,
        session_id: Uuid,
        stream_id: Option<String>,
        dialback_key: Option<String>,
    },
    OutStreamOnline {
        remote: String,
        session_id: Uuid,
    },
    /// `<db:verify type=…>` reply received on the outgoing stream to
    /// `remote`, answering the check for inbound stream `stream_id`.
    OutStreamVerified {
        remote: String,
        stream_id: String,
        valid: bool,
    },
    OutStreamClosed {
        remote: String,
        session_id: Uuid,
    },
}

#[derive(Clone)]
pub struct DomainContextHandle {
    domain: String,
    tx: mpsc::UnboundedSender<ContextCommand>,
}

impl DomainContextHandle {
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn set_credentials(&self, credentials: Credentials) {
        let _ = self.tx.send(ContextCommand::SetCredentials(credentials));
    }

    pub fn send(&self, stanza: Stanza) {
        let _ = self.tx.send(ContextCommand::Send(stanza));
    }

    pub fn send_raw(&self, element: Element, destination: &str) {
        let _ = self.tx.send(ContextCommand::SendRaw {
            element,
            destination: destination.to_string(),
        });
    }

    pub fn add_in_stream(&self, domain: &str, session: IncomingHandle) {
        let _ = self.tx.send(ContextCommand::AddInStream {
            domain: domain.to_string(),
            session,
        });
    }

    /// Answers the authoritative dialback question, suspending until the
    /// outgoing session in question has its key material. Absent sessions and
    /// torn-down contexts answer `false`.
    pub async fn verify_dialback(&self, domain: &str, stream_id: &str, key: &str) -> bool {
        let (respond_to, response) = oneshot::channel();
        let command = ContextCommand::VerifyDialback {
            domain: domain.to_string(),
            stream_id: stream_id.to_string(),
            key: key.to_string(),
            respond_to,
        };
        if self.tx.send(command).is_err() {
            return false;
        }
        response.await.unwrap_or(false)
    }

    pub fn verify_incoming(&self, from: &str, stream_id: &str, key: &str, session: IncomingHandle) {
        let _ = self.tx.send(ContextCommand::VerifyIncoming {
            from: from.to_string(),
            stream_id: stream_id.to_string(),
            key: key.to_string(),
            session,
        });
    }

    pub fn deliver(&self, peer: &str, element: Element) {
        let _ = self.tx.send(ContextCommand::Deliver {
            peer: peer.to_string(),
            element,
        });
    }

    pub fn in_stream_closed(&self, session_id: Uuid) {
        let _ = self.tx.send(ContextCommand::InStreamClosed { session_id });
    }

    pub fn end(&self) {
        let _ = self.tx.send(ContextCommand::End);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutgoingState {
    Connecting,
    Connected,
    Online,
}

struct AuthoritativeCheck {
    stream_id: String,
    key: String,
    respond_to: oneshot::Sender<bool>,
}

struct PendingVerify {
    from: String,
    session: IncomingHandle,
}

struct OutgoingEntry {
    id: Uuid,
    tx: mpsc::UnboundedSender<OutgoingCommand>,
    state: OutgoingState,
    stream_id: Option<String>,
    dialback_key: Option<String>,
    queue: VecDeque<Stanza>,
    pending_raw: Vec<Element>,
    pending_checks: Vec<AuthoritativeCheck>,
    pending_verifies: HashMap<String, PendingVerify>,
}

impl OutgoingEntry {
    fn command(&self, command: OutgoingCommand) {
        let _ = self.tx.send(command);
    }
}

pub struct DomainContext {
    domain: String,
    credentials: Option<Credentials>,
    rx: mpsc::UnboundedReceiver<ContextCommand>,
    self_tx: mpsc::UnboundedSender<ContextCommand>,
    s2s_in: HashMap<String, IncomingHandle>,
    s2s_out: HashMap<String, OutgoingEntry>,
    stanza_listener: mpsc::UnboundedSender<Stanza>,
    connector: Arc<dyn OutboundConnector>,
}

impl DomainContext {
    pub fn spawn(
        domain: String,
        stanza_listener: mpsc::UnboundedSender<Stanza>,
        connector: Arc<dyn OutboundConnector>,
        credentials: Option<Credentials>,
    ) -> DomainContextHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut context = DomainContext {
            domain: domain.clone(),
            credentials,
            rx,
            self_tx: tx.clone(),
            s2s_in: HashMap::new(),
            s2s_out: HashMap::new(),
            stanza_listener,
            connector,
        };

        tokio::spawn(async move {
            context.run().await;
        });

        DomainContextHandle { domain, tx }
    }

    async fn run(&mut self) {
        while let Some(command) = self.rx.recv().await {
            if self.handle_command(command) {
                break;
            }
        }
        debug!(domain = %self.domain, "domain context stopped");
    }

    /// Returns true when the context should stop.
    fn handle_command(&mut self, command: ContextCommand) -> bool {
        match command {
            ContextCommand::SetCredentials(credentials) => {
                self.credentials = Some(credentials);
            }
            ContextCommand::Send(stanza) => self.handle_send(stanza),
            ContextCommand::SendRaw {
                element,
                destination,
            } => {
                let entry = self.ensure_outgoing(&destination);
                match entry.state {
                    OutgoingState::Connecting => entry.pending_raw.push(element),
                    _ => entry.command(OutgoingCommand::SendElement(element)),
                }
            }
            ContextCommand::AddInStream { domain, session } => {
                self.register_in_stream(domain, session);
            }
            ContextCommand::VerifyDialback {
                domain,
                stream_id,
                key,
                respond_to,
            } => self.handle_verify_dialback(domain, stream_id, key, respond_to),
            ContextCommand::VerifyIncoming {
                from,
                stream_id,
                key,
                session,
            } => self.handle_verify_incoming(from, stream_id, key, session),
            ContextCommand::Deliver { peer, element } => self.handle_deliver(peer, element),
            ContextCommand::InStreamClosed { session_id } => {
                self.s2s_in.retain(|_, session| session.id != session_id);
            }
            ContextCommand::OutStreamConnected {
                remote,
                session_id,
                stream_id,
                dialback_key,
            } => self.handle_out_connected(remote, session_id, stream_id, dialback_key),
            ContextCommand::OutStreamOnline { remote, session_id } => {
                if let Some(entry) = self.s2s_out.get_mut(&remote) {
                    if entry.id == session_id {
                        entry.state = OutgoingState::Online;
                        for stanza in entry.queue.drain(..) {
                            let _ = entry.tx.send(OutgoingCommand::SendStanza(stanza));
                        }
                    }
                }
            }
            ContextCommand::OutStreamVerified {
                remote,
                stream_id,
                valid,
            } => self.handle_out_verified(remote, stream_id, valid),
            ContextCommand::OutStreamClosed { remote, session_id } => {
                self.handle_out_closed(remote, session_id);
            }
            ContextCommand::End => {
                for (_, session) in self.s2s_in.drain() {
                    let _ = session.tx.send(IncomingCommand::End);
                }
                for (_, entry) in self.s2s_out.drain() {
                    for check in entry.pending_checks {
                        let _ = check.respond_to.send(false);
                    }
                    let _ = entry.tx.send(OutgoingCommand::End);
                }
                return true;
            }
        }

        false
    }

    fn handle_send(&mut self, stanza: Stanza) {
        let destination = match stanza.to_jid() {
            Some(jid) => jid.domain().to_string(),
            None => {
                // Unroutable; bounce back to the sender unless it is already
                // an error, in which case it is dropped to stop the loop.
                if let Some(bounce) = stanza.into_error_bounce("modify", "jid-malformed") {
                    self.receive(bounce);
                }
                return;
            }
        };

        let entry = self.ensure_outgoing(&destination);
        match entry.state {
            OutgoingState::Online => entry.command(OutgoingCommand::SendStanza(stanza)),
            _ => entry.queue.push_back(stanza),
        }
    }

    fn handle_verify_dialback(
        &mut self,
        domain: String,
        stream_id: String,
        key: String,
        respond_to: oneshot::Sender<bool>,
    ) {
        match self.s2s_out.get_mut(&domain) {
            None => {
                let _ = respond_to.send(false);
            }
            Some(entry) => match entry.state {
                OutgoingState::Connecting => entry.pending_checks.push(AuthoritativeCheck {
                    stream_id,
                    key,
                    respond_to,
                }),
                _ => {
                    let _ = respond_to.send(entry.matches_key(&stream_id, &key));
                }
            },
        }
    }

    fn handle_verify_incoming(
        &mut self,
        from: String,
        stream_id: String,
        key: String,
        session: IncomingHandle,
    ) {
        let local_domain = self.domain.clone();
        let entry = self.ensure_outgoing(&from);
        let verify = dialback::verify_request(&local_domain, &from, &stream_id, &key);
        entry.pending_verifies.insert(
            stream_id,
            PendingVerify {
                from: from.clone(),
                session,
            },
        );
        match entry.state {
            OutgoingState::Connecting => entry.pending_raw.push(verify),
            _ => entry.command(OutgoingCommand::SendElement(verify)),
        }
    }

    fn handle_deliver(&mut self, peer: String, element: Element) {
        let stanza = Stanza::new(element);

        if !stanza.is_routable() {
            debug!(peer = %peer, element = stanza.element.name(), "dropping non-stanza element");
            return;
        }

        let from_domain = stanza.from_jid().map(|jid| jid.domain().to_string());
        let to_domain = stanza.to_jid().map(|jid| jid.domain().to_string());

        let (Some(from_domain), Some(to_domain)) = (from_domain, to_domain) else {
            self.close_in_stream(&peer, StreamErrorCondition::ImproperAddressing);
            return;
        };

        // A stream verified for domain D may only originate stanzas from D.
        if from_domain != peer {
            warn!(peer = %peer, from = %from_domain, "spoofed from domain on inbound stream");
            self.close_in_stream(&peer, StreamErrorCondition::InvalidFrom);
            return;
        }

        if to_domain != self.domain {
            self.close_in_stream(&peer, StreamErrorCondition::ImproperAddressing);
            return;
        }

        self.receive(stanza);
    }

    fn handle_out_connected(
        &mut self,
        remote: String,
        session_id: Uuid,
        stream_id: Option<String>,
        dialback_key: Option<String>,
    ) {
        let Some(entry) = self.s2s_out.get_mut(&remote) else {
            return;
        };
        if entry.id != session_id {
            return;
        }

        entry.state = OutgoingState::Connected;
        entry.stream_id = stream_id;
        entry.dialback_key = dialback_key;

        for element in entry.pending_raw.drain(..) {
            let _ = entry.tx.send(OutgoingCommand::SendElement(element));
        }
        for check in entry.pending_checks.drain(..) {
            let valid = entry.stream_id.as_deref() == Some(check.stream_id.as_str())
                && entry.dialback_key.as_deref() == Some(check.key.as_str());
            let _ = check.respond_to.send(valid);
        }
    }

    fn handle_out_verified(&mut self, remote: String, stream_id: String, valid: bool) {
        let Some(entry) = self.s2s_out.get_mut(&remote) else {
            return;
        };
        let Some(pending) = entry.pending_verifies.remove(&stream_id) else {
            debug!(remote = %remote, stream_id = %stream_id, "verify reply without a pending check");
            return;
        };

        if valid {
            self.register_in_stream(pending.from.clone(), pending.session.clone());
        }
        let _ = pending.session.tx.send(IncomingCommand::DialbackOutcome {
            peer: pending.from,
            valid,
        });
    }

    fn handle_out_closed(&mut self, remote: String, session_id: Uuid) {
        let matches = self
            .s2s_out
            .get(&remote)
            .map(|entry| entry.id == session_id)
            .unwrap_or(false);
        if !matches {
            return;
        }

        let entry = self.s2s_out.remove(&remote).expect("entry just found");

        for stanza in entry.queue {
            match stanza.into_error_bounce("cancel", "remote-server-not-found") {
                Some(bounce) => self.receive(bounce),
                None => debug!(remote = %remote, "dropping undeliverable error stanza"),
            }
        }
        for check in entry.pending_checks {
            let _ = check.respond_to.send(false);
        }
        for (_, pending) in entry.pending_verifies {
            let _ = pending.session.tx.send(IncomingCommand::DialbackOutcome {
                peer: pending.from,
                valid: false,
            });
        }
    }

    fn register_in_stream(&mut self, domain: String, session: IncomingHandle) {
        let session_id = session.id;
        if let Some(previous) = self.s2s_in.insert(domain.clone(), session) {
            if previous.id != session_id {
                debug!(domain = %domain, "replacing verified inbound stream");
                let _ = previous
                    .tx
                    .send(IncomingCommand::CloseWithError(StreamErrorCondition::Conflict));
            }
        }
    }

    fn close_in_stream(&mut self, peer: &str, condition: StreamErrorCondition) {
        if let Some(session) = self.s2s_in.remove(peer) {
            let _ = session.tx.send(IncomingCommand::CloseWithError(condition));
        }
    }

    fn receive(&self, stanza: Stanza) {
        if self.stanza_listener.send(stanza).is_err() {
            warn!(domain = %self.domain, "stanza listener is gone");
        }
    }

    fn ensure_outgoing(&mut self, remote: &str) -> &mut OutgoingEntry {
        assert!(!remote.is_empty(), "empty destination domain");

        if !self.s2s_out.contains_key(remote) {
            let session_id = Uuid::new_v4();
            let handle = self.connector.spawn(
                self.domain.clone(),
                remote.to_string(),
                self.credentials.clone(),
                self.self_tx.clone(),
                session_id,
            );
            debug!(domain = %self.domain, remote = %remote, session = %session_id, "opening outgoing stream");
            self.s2s_out.insert(
                remote.to_string(),
                OutgoingEntry {
                    id: handle.id,
                    tx: handle.tx,
                    state: OutgoingState::Connecting,
                    stream_id: None,
                    dialback_key: None,
                    queue: VecDeque::new(),
                    pending_raw: Vec::new(),
                    pending_checks: Vec::new(),
                    pending_verifies: HashMap::new(),
                },
            );
        }

        self.s2s_out.get_mut(remote).expect("entry just inserted")
    }
}

impl OutgoingEntry {
    fn matches_key(&self, stream_id: &str, key: &str) -> bool {
        self.stream_id.as_deref() == Some(stream_id) && self.dialback_key.as_deref() == Some(key)
    }
}
