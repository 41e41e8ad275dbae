//! State machine for a peer-initiated federation stream: stream header
//! exchange, feature advertisement, STARTTLS, SASL EXTERNAL or dialback
//! verification, then stanza delivery into the owning domain context.

use std::sync::Arc;

use tokio::io::ReadHalf;
use tokio::select;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::router::Router;
use crate::xml::stream_parser::{Frame, StreamParser};
use crate::xml::Element;
use crate::xmpp::jid::normalize_domain;
use crate::xmpp::stream::{Connection, XmppStream};
use crate::xmpp::stream_header::{StreamHeader, StreamId};

use super::context::{DomainContextHandle, IncomingCommand, IncomingHandle};
use super::dialback::{self, DialbackFrame};
use super::frames;
use super::{S2sError, StreamErrorCondition};

#[derive(Debug, Clone, Copy)]
pub struct IncomingSessionSettings {
    /// Operator policy: offer SASL EXTERNAL once the stream is secure.
    pub secure_domain: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub struct IncomingSession<C, P>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
{
    id: Uuid,
    stream: XmppStream<C, P>,
    router: Arc<Router>,
    settings: IncomingSessionSettings,
    /// Our identifier for this stream, sent in the response header and
    /// referenced by the peer's dialback verification.
    stream_id: StreamId,
    connected: bool,
    /// Domain the peer has proven it speaks for. Set at most once; a
    /// verification failure closes the session instead of clearing it.
    authed_domain: Option<String>,
    local: Option<DomainContextHandle>,
    peer_header: Option<StreamHeader>,
    cmd_tx: mpsc::UnboundedSender<IncomingCommand>,
    cmd_rx: mpsc::UnboundedReceiver<IncomingCommand>,
}

impl<C, P> IncomingSession<C, P>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
{
    pub fn new(connection: C, router: Arc<Router>, settings: IncomingSessionSettings) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        IncomingSession {
            id: Uuid::new_v4(),
            stream: XmppStream::new(connection),
            router,
            settings,
            stream_id: StreamId::new(),
            connected: false,
            authed_domain: None,
            local: None,
            peer_header: None,
            cmd_tx,
            cmd_rx,
        }
    }

    pub fn handle(&self) -> IncomingHandle {
        IncomingHandle {
            id: self.id,
            tx: self.cmd_tx.clone(),
        }
    }

    pub async fn run(mut self) {
        debug!(session = %self.id, "incoming s2s stream");

        match self.serve().await {
            Ok(()) => {}
            Err(error) => {
                debug!(session = %self.id, error = %error, "incoming s2s stream failed");
                let _ = self
                    .send_stream_error(StreamErrorCondition::UndefinedCondition)
                    .await;
            }
        }

        if let Some(context) = &self.local {
            context.in_stream_closed(self.id);
        }
        debug!(session = %self.id, "incoming s2s stream closed");
    }

    async fn serve(&mut self) -> Result<(), S2sError> {
        loop {
            select! {
                frame = self.stream.reader().next() => {
                    let flow = match frame {
                        Some(Ok(Frame::StreamStart(header))) => self.handle_stream_open(header).await?,
                        Some(Ok(Frame::XmlFragment(element))) => self.handle_element(element).await?,
                        Some(Ok(Frame::StreamEnd)) => {
                            let _ = self.close_stream().await;
                            Flow::Stop
                        }
                        Some(Err(error)) => return Err(S2sError::Other(error)),
                        None => Flow::Stop,
                    };
                    if flow == Flow::Stop {
                        return Ok(());
                    }
                }
                Some(command) = self.cmd_rx.recv() => {
                    if self.handle_command(command).await? == Flow::Stop {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Peer opened (or restarted) the stream. The response header carries a
    /// fresh id chosen by us; features follow as their own frame.
    async fn handle_stream_open(&mut self, header: StreamHeader) -> Result<Flow, S2sError> {
        let Some(local_jid) = header.to.clone() else {
            return self.refuse_stream(&header, StreamErrorCondition::HostUnknown).await;
        };

        let context = match self.router.context(local_jid.domain()) {
            Some(context) => context.clone(),
            None => {
                return self.refuse_stream(&header, StreamErrorCondition::HostUnknown).await;
            }
        };

        let response = StreamHeader {
            from: Some(local_jid),
            to: header.from.clone(),
            id: Some(self.stream_id.to_string()),
            version: Some("1.0".to_string()),
        };

        self.local = Some(context);
        self.peer_header = Some(header);
        self.connected = true;

        self.stream
            .writer()
            .write_stream_header(&response, true)
            .await?;
        self.send_features().await?;

        Ok(Flow::Continue)
    }

    async fn send_features(&mut self) -> Result<(), S2sError> {
        let features = frames::features(
            self.settings.secure_domain,
            self.stream.is_secure(),
            self.authed_domain.is_some(),
        );
        self.stream.writer().write_xml_element(&features).await?;
        Ok(())
    }

    async fn handle_element(&mut self, element: Element) -> Result<Flow, S2sError> {
        if !self.connected {
            return Err(S2sError::Negotiation(
                "element before stream header".to_string(),
            ));
        }

        if frames::is_starttls(&element) {
            return self.handle_starttls().await;
        }

        if frames::is_sasl_auth(&element) {
            return self.handle_sasl_auth(&element).await;
        }

        if let Some(frame) = dialback::classify(&element) {
            return self.handle_dialback(frame).await;
        }

        match self.authed_domain.clone() {
            Some(peer) => {
                if let Some(context) = &self.local {
                    context.deliver(&peer, element);
                }
            }
            None => {
                debug!(session = %self.id, element = element.name(), "dropping element on unauthenticated stream");
            }
        }

        Ok(Flow::Continue)
    }

    async fn handle_starttls(&mut self) -> Result<Flow, S2sError> {
        if self.stream.is_secure() || !self.stream.is_starttls_allowed() {
            self.send_stream_error(StreamErrorCondition::UndefinedCondition)
                .await?;
            return Ok(Flow::Stop);
        }

        self.stream
            .writer()
            .write_xml_element(&frames::proceed())
            .await?;
        self.stream.upgrade_to_tls().await?;

        // peer must now restart the stream; features are re-sent on its new
        // header
        Ok(Flow::Continue)
    }

    async fn handle_sasl_auth(&mut self, element: &Element) -> Result<Flow, S2sError> {
        let mechanism = element.attribute("mechanism", None);

        if !self.stream.is_secure() || mechanism.is_none() {
            return self.send_not_authorized_and_close().await;
        }
        if mechanism != Some(frames::MECHANISM_EXTERNAL) {
            return self.send_not_authorized_and_close().await;
        }

        let Some(claimed) = self.claimed_peer_domain() else {
            return self.send_not_authorized_and_close().await;
        };

        let certificate_missing = self
            .stream
            .tls()
            .peer_certificate
            .as_ref()
            .map_or(true, |certificate| certificate.is_empty());

        if certificate_missing {
            // handshake completed without a client certificate; ask for one
            // before judging identity
            if let Err(error) = self.stream.renegotiate(true).await {
                debug!(session = %self.id, error = %error, "tls renegotiation failed");
                return self.send_not_authorized_and_close().await;
            }
        }

        self.verify_certificate(claimed).await
    }

    /// RFC 6125-style check of the peer certificate against the stream's
    /// server name, then SASL success and stream restart.
    async fn verify_certificate(&mut self, claimed: String) -> Result<Flow, S2sError> {
        let tls = self.stream.tls().clone();

        if !tls.authorized {
            return self.send_not_authorized_and_close().await;
        }

        let Some(servername) = tls.servername else {
            return self.send_not_authorized_and_close().await;
        };

        let identity_ok = tls
            .peer_certificate
            .as_ref()
            .map_or(false, |certificate| certificate.matches_name(&servername));
        if !identity_ok {
            return self.send_not_authorized_and_close().await;
        }

        // success strictly precedes the stream restart
        self.stream
            .writer()
            .write_xml_element(&frames::sasl_success())
            .await?;
        self.stream.reset();

        self.authed_domain = Some(claimed.clone());
        if let Some(context) = &self.local {
            context.add_in_stream(&claimed, self.handle());
        }
        debug!(session = %self.id, peer = %claimed, method = "SASL", "inbound stream authenticated");

        Ok(Flow::Continue)
    }

    async fn handle_dialback(&mut self, frame: DialbackFrame) -> Result<Flow, S2sError> {
        let Some(context) = self.local.clone() else {
            return Err(S2sError::Negotiation(
                "dialback before stream header".to_string(),
            ));
        };

        match frame {
            DialbackFrame::ResultRequest { from, key, .. } => {
                let from = normalize_domain(&from);
                context.verify_incoming(&from, self.stream_id.as_str(), &key, self.handle());
                Ok(Flow::Continue)
            }
            DialbackFrame::VerifyRequest { from, to, id, key } => {
                // the peer asks us, as the authoritative server, whether we
                // issued this key on our stream to it
                let asker = normalize_domain(&from);
                let valid = context.verify_dialback(&asker, &id, &key).await;
                let response = dialback::verify_response(&to, &from, &id, valid);
                self.stream.writer().write_xml_element(&response).await?;
                Ok(Flow::Continue)
            }
            DialbackFrame::ResultResponse { .. } | DialbackFrame::VerifyResponse { .. } => {
                warn!(session = %self.id, "dialback response on an inbound stream");
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_command(&mut self, command: IncomingCommand) -> Result<Flow, S2sError> {
        match command {
            IncomingCommand::SendElement(element) => {
                self.stream.writer().write_xml_element(&element).await?;
                Ok(Flow::Continue)
            }
            IncomingCommand::DialbackOutcome { peer, valid } => {
                let local_domain = match &self.local {
                    Some(context) => context.domain().to_string(),
                    None => return Err(S2sError::Negotiation("dialback outcome without context".to_string())),
                };
                let response = dialback::result_response(&local_domain, &peer, valid);
                self.stream.writer().write_xml_element(&response).await?;

                if valid {
                    self.authed_domain = Some(peer.clone());
                    debug!(session = %self.id, peer = %peer, method = "dialback", "inbound stream authenticated");
                    Ok(Flow::Continue)
                } else {
                    self.close_stream().await?;
                    Ok(Flow::Stop)
                }
            }
            IncomingCommand::CloseWithError(condition) => {
                self.send_stream_error(condition).await?;
                Ok(Flow::Stop)
            }
            IncomingCommand::End => {
                self.close_stream().await?;
                Ok(Flow::Stop)
            }
        }
    }

    fn claimed_peer_domain(&self) -> Option<String> {
        self.peer_header
            .as_ref()
            .and_then(|header| header.from.as_ref())
            .map(|jid| jid.domain().to_string())
    }

    /// Refuse a stream we will not serve: answer with our own header so the
    /// error can be delivered in a well-formed document, then close.
    async fn refuse_stream(
        &mut self,
        peer_header: &StreamHeader,
        condition: StreamErrorCondition,
    ) -> Result<Flow, S2sError> {
        let response = StreamHeader {
            from: peer_header.to.clone(),
            to: peer_header.from.clone(),
            id: Some(self.stream_id.to_string()),
            version: Some("1.0".to_string()),
        };
        self.stream
            .writer()
            .write_stream_header(&response, true)
            .await?;
        self.send_stream_error(condition).await?;
        Ok(Flow::Stop)
    }

    async fn send_stream_error(&mut self, condition: StreamErrorCondition) -> Result<(), S2sError> {
        if self.stream.writer().has_stream_header() {
            let error = frames::stream_error(condition);
            self.stream.writer().write_xml_element(&error).await?;
        }
        self.close_stream().await
    }

    /// Failure frame, stream close tag, transport shutdown. Strictly in that
    /// order.
    async fn send_not_authorized_and_close(&mut self) -> Result<Flow, S2sError> {
        self.stream
            .writer()
            .write_xml_element(&frames::sasl_failure_not_authorized())
            .await?;
        self.close_stream().await?;
        Ok(Flow::Stop)
    }

    async fn close_stream(&mut self) -> Result<(), S2sError> {
        if self.stream.writer().has_stream_header() {
            self.stream.writer().write_stream_close().await?;
        }
        self.stream.writer().shutdown().await?;
        Ok(())
    }
}
