//! State machine for a locally-initiated federation stream: stream header
//! exchange, STARTTLS when offered, then SASL EXTERNAL or dialback, then
//! wire-sending whatever the owning context dispatches.

use tokio::io::ReadHalf;
use tokio::select;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::xml::stream_parser::{Frame, StreamParser};
use crate::xml::Element;
use crate::xmpp::jid::Jid;
use crate::xmpp::stream::{Connection, XmppStream};
use crate::xmpp::stream_header::StreamHeader;

use super::context::{ContextCommand, OutgoingCommand};
use super::dialback::{self, DialbackFrame, DialbackKey};
use super::frames;
use super::S2sError;

#[derive(Clone)]
pub struct OutgoingSessionConfig {
    pub local_domain: String,
    pub remote_domain: String,
    pub keys: DialbackKey,
}

pub struct OutgoingSession<C, P>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
{
    id: Uuid,
    stream: XmppStream<C, P>,
    config: OutgoingSessionConfig,
    events: mpsc::UnboundedSender<ContextCommand>,
    commands: mpsc::UnboundedReceiver<OutgoingCommand>,
    /// Stream id the receiving server assigned, from its response header.
    stream_id: Option<String>,
    /// Dialback key we sent for this stream, kept for the authoritative
    /// comparison when the peer reaches back.
    db_key: Option<String>,
}

impl<C, P> OutgoingSession<C, P>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
{
    pub fn new(
        connection: C,
        config: OutgoingSessionConfig,
        events: mpsc::UnboundedSender<ContextCommand>,
        commands: mpsc::UnboundedReceiver<OutgoingCommand>,
        id: Uuid,
    ) -> Self {
        OutgoingSession {
            id,
            stream: XmppStream::new(connection),
            config,
            events,
            commands,
            stream_id: None,
            db_key: None,
        }
    }

    pub async fn run(mut self) {
        let remote = self.config.remote_domain.clone();
        debug!(session = %self.id, remote = %remote, "outgoing s2s stream");

        match self.negotiate_and_serve().await {
            Ok(()) | Err(S2sError::ConnectionClosed) => {
                debug!(session = %self.id, remote = %remote, "outgoing s2s stream closed");
            }
            Err(error) => {
                warn!(session = %self.id, remote = %remote, error = %error, "outgoing s2s stream failed");
                if self.stream.writer().has_stream_header() {
                    let error =
                        frames::stream_error(super::StreamErrorCondition::UndefinedCondition);
                    let _ = self.stream.writer().write_xml_element(&error).await;
                    let _ = self.stream.writer().write_stream_close().await;
                }
            }
        }

        let _ = self.events.send(ContextCommand::OutStreamClosed {
            remote,
            session_id: self.id,
        });
    }

    async fn negotiate_and_serve(&mut self) -> Result<(), S2sError> {
        self.open_stream().await?;
        let mut features = self.expect_features().await?;

        if frames::features_offer_starttls(&features) && !self.stream.is_secure() {
            self.negotiate_starttls().await?;
            features = self.expect_features().await?;
        }

        if frames::features_offer_external(&features) && self.stream.is_secure() {
            self.announce_connected(None);
            self.authenticate_external().await?;
        } else {
            self.authenticate_dialback().await?;
        }

        debug!(session = %self.id, remote = %self.config.remote_domain, "outgoing s2s stream online");
        let _ = self.events.send(ContextCommand::OutStreamOnline {
            remote: self.config.remote_domain.clone(),
            session_id: self.id,
        });

        self.serve().await
    }

    /// Send our header, read the peer's, record its stream id.
    async fn open_stream(&mut self) -> Result<(), S2sError> {
        let header = self.open_header()?;
        self.stream
            .writer()
            .write_stream_header(&header, true)
            .await?;

        let header = self.expect_stream_header().await?;
        self.stream_id = header.id;
        Ok(())
    }

    fn open_header(&self) -> Result<StreamHeader, S2sError> {
        let from = Jid::from_domain(&self.config.local_domain).map_err(S2sError::Other)?;
        let to = Jid::from_domain(&self.config.remote_domain).map_err(S2sError::Other)?;
        Ok(StreamHeader {
            from: Some(from),
            to: Some(to),
            id: None,
            version: Some("1.0".to_string()),
        })
    }

    async fn negotiate_starttls(&mut self) -> Result<(), S2sError> {
        self.stream
            .writer()
            .write_xml_element(&frames::starttls())
            .await?;

        let element = self.expect_element().await?;
        if !frames::is_proceed(&element) {
            return Err(S2sError::Negotiation(
                "peer refused starttls".to_string(),
            ));
        }

        self.stream.upgrade_to_tls().await?;
        self.open_stream().await
    }

    async fn authenticate_external(&mut self) -> Result<(), S2sError> {
        let auth = frames::sasl_auth_external(&self.config.local_domain);
        self.stream.writer().write_xml_element(&auth).await?;

        loop {
            let element = self.expect_element().await?;
            if frames::is_sasl_success(&element) {
                break;
            }
            if frames::is_sasl_failure(&element) {
                return Err(S2sError::Sasl(
                    "peer rejected external authentication".to_string(),
                ));
            }
            if let Some(DialbackFrame::VerifyResponse { id, valid, .. }) =
                dialback::classify(&element)
            {
                self.forward_verified(id, valid);
                continue;
            }
            debug!(session = %self.id, element = element.name(), "ignoring element during sasl");
        }

        // restart the stream on the authenticated connection
        self.stream.reset();
        self.open_stream().await
    }

    async fn authenticate_dialback(&mut self) -> Result<(), S2sError> {
        let stream_id = self
            .stream_id
            .clone()
            .ok_or_else(|| S2sError::Dialback("peer assigned no stream id".to_string()))?;

        let key = self.config.keys.generate(
            &self.config.local_domain,
            &self.config.remote_domain,
            &stream_id,
        );
        self.db_key = Some(key.clone());
        self.announce_connected(Some(key.clone()));

        let request =
            dialback::result_request(&self.config.local_domain, &self.config.remote_domain, &key);
        self.stream.writer().write_xml_element(&request).await?;

        loop {
            let element = self.expect_element().await?;
            match dialback::classify(&element) {
                Some(DialbackFrame::ResultResponse { valid, .. }) => {
                    if valid {
                        return Ok(());
                    }
                    return Err(S2sError::Dialback(
                        "receiving server reported the key invalid".to_string(),
                    ));
                }
                Some(DialbackFrame::VerifyResponse { id, valid, .. }) => {
                    self.forward_verified(id, valid);
                }
                Some(other) => {
                    warn!(session = %self.id, frame = ?other, "unexpected dialback frame on outgoing stream");
                }
                None => {
                    debug!(session = %self.id, element = element.name(), "ignoring element during dialback");
                }
            }
        }
    }

    /// Established phase: relay context commands to the wire; the only
    /// inbound frames of interest are verify replies for our context.
    async fn serve(&mut self) -> Result<(), S2sError> {
        loop {
            select! {
                frame = self.stream.reader().next() => {
                    match frame {
                        Some(Ok(Frame::XmlFragment(element))) => {
                            match dialback::classify(&element) {
                                Some(DialbackFrame::VerifyResponse { id, valid, .. }) => {
                                    self.forward_verified(id, valid);
                                }
                                Some(other) => {
                                    warn!(session = %self.id, frame = ?other, "unexpected dialback frame on outgoing stream");
                                }
                                None => {
                                    debug!(session = %self.id, element = element.name(), "ignoring inbound element on outgoing stream");
                                }
                            }
                        }
                        Some(Ok(Frame::StreamStart(_))) => {
                            warn!(session = %self.id, "unexpected stream restart by peer");
                        }
                        Some(Ok(Frame::StreamEnd)) | None => return Ok(()),
                        Some(Err(error)) => return Err(S2sError::Other(error)),
                    }
                }
                Some(command) = self.commands.recv() => {
                    self.apply_command(command).await?;
                }
            }
        }
    }

    /// Waits for the next stream-level frame while still serving context
    /// commands; dialback verify requests must go out while our own
    /// authentication is in flight.
    async fn next_frame(&mut self) -> Result<Frame, S2sError> {
        loop {
            select! {
                frame = self.stream.reader().next() => {
                    return match frame {
                        Some(Ok(frame)) => Ok(frame),
                        Some(Err(error)) => Err(S2sError::Other(error)),
                        None => Err(S2sError::ConnectionClosed),
                    };
                }
                Some(command) = self.commands.recv() => {
                    self.apply_command(command).await?;
                }
            }
        }
    }

    async fn expect_stream_header(&mut self) -> Result<StreamHeader, S2sError> {
        match self.next_frame().await? {
            Frame::StreamStart(header) => Ok(header),
            Frame::StreamEnd => Err(S2sError::ConnectionClosed),
            Frame::XmlFragment(_) => Err(S2sError::Negotiation(
                "expected stream header".to_string(),
            )),
        }
    }

    async fn expect_element(&mut self) -> Result<Element, S2sError> {
        match self.next_frame().await? {
            Frame::XmlFragment(element) => Ok(element),
            Frame::StreamEnd => Err(S2sError::ConnectionClosed),
            Frame::StreamStart(_) => Err(S2sError::Negotiation(
                "unexpected stream restart".to_string(),
            )),
        }
    }

    async fn expect_features(&mut self) -> Result<Element, S2sError> {
        let element = self.expect_element().await?;
        if frames::is_features(&element) {
            Ok(element)
        } else {
            Err(S2sError::Negotiation("expected stream features".to_string()))
        }
    }

    async fn apply_command(&mut self, command: OutgoingCommand) -> Result<(), S2sError> {
        match command {
            OutgoingCommand::SendStanza(stanza) => {
                self.stream.writer().write_xml_element(&stanza.element).await?;
                Ok(())
            }
            OutgoingCommand::SendElement(element) => {
                self.stream.writer().write_xml_element(&element).await?;
                Ok(())
            }
            OutgoingCommand::End => {
                if self.stream.writer().has_stream_header() {
                    let _ = self.stream.writer().write_stream_close().await;
                }
                let _ = self.stream.writer().shutdown().await;
                Err(S2sError::ConnectionClosed)
            }
        }
    }

    fn announce_connected(&self, dialback_key: Option<String>) {
        let _ = self.events.send(ContextCommand::OutStreamConnected {
            remote: self.config.remote_domain.clone(),
            session_id: self.id,
            stream_id: self.stream_id.clone(),
            dialback_key,
        });
    }

    fn forward_verified(&self, stream_id: String, valid: bool) {
        let _ = self.events.send(ContextCommand::OutStreamVerified {
            remote: self.config.remote_domain.clone(),
            stream_id,
            valid,
        });
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    use crate::s2s::testing::{read_until, TestConnection, TlsScript};
    use crate::xml::stream_parser::rusty_xml::RustyXmlStreamParser;
    use crate::xml::{namespaces, Element};
    use crate::xmpp::stanza::Stanza;

    use super::*;

    struct Fixture {
        events: mpsc::UnboundedReceiver<ContextCommand>,
        commands: mpsc::UnboundedSender<OutgoingCommand>,
        far: tokio::io::DuplexStream,
        probe: std::sync::Arc<std::sync::Mutex<crate::s2s::testing::TlsProbe>>,
        keys: DialbackKey,
        session_id: Uuid,
    }

    fn fixture(script: TlsScript) -> Fixture {
        let (connection, far, _script, probe) = TestConnection::pair(script);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let keys = DialbackKey::new(b"outgoing-test-secret");
        let session_id = Uuid::new_v4();

        let session = OutgoingSession::<_, RustyXmlStreamParser<_>>::new(
            connection,
            OutgoingSessionConfig {
                local_domain: "local.test".to_string(),
                remote_domain: "remote.test".to_string(),
                keys: keys.clone(),
            },
            events_tx,
            commands_rx,
            session_id,
        );
        tokio::spawn(session.run());

        Fixture {
            events,
            commands: commands_tx,
            far,
            probe,
            keys,
            session_id,
        }
    }

    fn peer_header(id: &str) -> String {
        format!(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='jabber:server' \
             xmlns:stream='http://etherx.jabber.org/streams' \
             xmlns:db='jabber:server:dialback' \
             from='remote.test' to='local.test' id='{id}' version='1.0'>"
        )
    }

    #[tokio::test]
    async fn dialback_handshake_reaches_online() {
        let mut fx = fixture(TlsScript::default());
        let mut transcript = String::new();

        read_until(&mut fx.far, &mut transcript, "<stream:stream").await;
        assert!(transcript.contains("to=\"remote.test\""));
        assert!(transcript.contains("from=\"local.test\""));

        fx.far.write_all(peer_header("SID-1").as_bytes()).await.unwrap();
        fx.far
            .write_all(b"<stream:features/>")
            .await
            .unwrap();

        let expected_key = fx.keys.generate("local.test", "remote.test", "SID-1");
        read_until(&mut fx.far, &mut transcript, &expected_key).await;
        assert!(transcript.contains("<db:result"));

        match fx.events.recv().await.unwrap() {
            ContextCommand::OutStreamConnected {
                remote,
                session_id,
                stream_id,
                dialback_key,
            } => {
                assert_eq!(remote, "remote.test");
                assert_eq!(session_id, fx.session_id);
                assert_eq!(stream_id.as_deref(), Some("SID-1"));
                assert_eq!(dialback_key.as_deref(), Some(expected_key.as_str()));
            }
            other => panic!("expected connected event, got {other:?}"),
        }

        fx.far
            .write_all(b"<db:result from='remote.test' to='local.test' type='valid'/>")
            .await
            .unwrap();

        match fx.events.recv().await.unwrap() {
            ContextCommand::OutStreamOnline { remote, session_id } => {
                assert_eq!(remote, "remote.test");
                assert_eq!(session_id, fx.session_id);
            }
            other => panic!("expected online event, got {other:?}"),
        }

        let mut message = Element::new("message", Some(namespaces::XMPP_SERVER));
        message.set_attribute("from", None, "user@local.test");
        message.set_attribute("to", None, "peer@remote.test");
        fx.commands
            .send(OutgoingCommand::SendStanza(Stanza::new(message)))
            .unwrap();
        read_until(&mut fx.far, &mut transcript, "<message").await;
    }

    #[tokio::test]
    async fn invalid_dialback_closes_without_online() {
        let mut fx = fixture(TlsScript::default());
        let mut transcript = String::new();

        read_until(&mut fx.far, &mut transcript, "<stream:stream").await;
        fx.far.write_all(peer_header("SID-2").as_bytes()).await.unwrap();
        fx.far.write_all(b"<stream:features/>").await.unwrap();

        read_until(&mut fx.far, &mut transcript, "<db:result").await;
        fx.far
            .write_all(b"<db:result from='remote.test' to='local.test' type='invalid'/>")
            .await
            .unwrap();

        loop {
            match fx.events.recv().await.unwrap() {
                ContextCommand::OutStreamConnected { .. } => continue,
                ContextCommand::OutStreamClosed { remote, session_id } => {
                    assert_eq!(remote, "remote.test");
                    assert_eq!(session_id, fx.session_id);
                    break;
                }
                other => panic!("expected closed event, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn starttls_is_preferred_when_offered() {
        let mut fx = fixture(TlsScript {
            starttls_allowed: true,
            ..TlsScript::default()
        });
        let mut transcript = String::new();

        read_until(&mut fx.far, &mut transcript, "<stream:stream").await;
        fx.far.write_all(peer_header("SID-3").as_bytes()).await.unwrap();
        fx.far
            .write_all(
                b"<stream:features>\
                  <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>\
                  </stream:features>",
            )
            .await
            .unwrap();

        read_until(&mut fx.far, &mut transcript, "<starttls").await;
        fx.far
            .write_all(b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
            .await
            .unwrap();

        // the session restarts its stream on the upgraded transport
        let mut post_tls = String::new();
        read_until(&mut fx.far, &mut post_tls, "<stream:stream").await;
        assert!(fx.probe.lock().unwrap().upgraded);

        fx.far.write_all(peer_header("SID-4").as_bytes()).await.unwrap();
        fx.far.write_all(b"<stream:features/>").await.unwrap();

        // dialback key must be derived from the post-TLS stream id
        let expected_key = fx.keys.generate("local.test", "remote.test", "SID-4");
        read_until(&mut fx.far, &mut post_tls, &expected_key).await;
    }

    #[tokio::test]
    async fn external_is_chosen_on_secure_streams() {
        let mut fx = fixture(TlsScript {
            secure: true,
            authorized: true,
            ..TlsScript::default()
        });
        let mut transcript = String::new();

        read_until(&mut fx.far, &mut transcript, "<stream:stream").await;
        fx.far.write_all(peer_header("SID-5").as_bytes()).await.unwrap();
        fx.far
            .write_all(
                b"<stream:features>\
                  <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
                  <mechanism>EXTERNAL</mechanism>\
                  </mechanisms>\
                  </stream:features>",
            )
            .await
            .unwrap();

        read_until(&mut fx.far, &mut transcript, "<auth").await;
        assert!(transcript.contains("mechanism=\"EXTERNAL\""));

        match fx.events.recv().await.unwrap() {
            ContextCommand::OutStreamConnected { dialback_key, .. } => {
                assert!(dialback_key.is_none());
            }
            other => panic!("expected connected event, got {other:?}"),
        }

        fx.far
            .write_all(b"<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
            .await
            .unwrap();

        // restart on the authenticated stream
        let mut post_auth = String::new();
        read_until(&mut fx.far, &mut post_auth, "<stream:stream").await;
        fx.far.write_all(peer_header("SID-6").as_bytes()).await.unwrap();

        match fx.events.recv().await.unwrap() {
            ContextCommand::OutStreamOnline { remote, .. } => assert_eq!(remote, "remote.test"),
            other => panic!("expected online event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn verify_replies_are_forwarded_during_dialback_wait() {
        let mut fx = fixture(TlsScript::default());
        let mut transcript = String::new();

        read_until(&mut fx.far, &mut transcript, "<stream:stream").await;
        fx.far.write_all(peer_header("SID-7").as_bytes()).await.unwrap();
        fx.far.write_all(b"<stream:features/>").await.unwrap();
        read_until(&mut fx.far, &mut transcript, "<db:result").await;

        // context asks us to carry a verify request while we are still
        // waiting for our own result
        fx.commands
            .send(OutgoingCommand::SendElement(dialback::verify_request(
                "local.test",
                "remote.test",
                "in-sid",
                "claimed-key",
            )))
            .unwrap();
        read_until(&mut fx.far, &mut transcript, "<db:verify").await;

        fx.far
            .write_all(
                b"<db:verify from='remote.test' to='local.test' id='in-sid' type='valid'/>",
            )
            .await
            .unwrap();

        loop {
            match fx.events.recv().await.unwrap() {
                ContextCommand::OutStreamConnected { .. } => continue,
                ContextCommand::OutStreamVerified {
                    remote,
                    stream_id,
                    valid,
                } => {
                    assert_eq!(remote, "remote.test");
                    assert_eq!(stream_id, "in-sid");
                    assert!(valid);
                    break;
                }
                other => panic!("expected verified event, got {other:?}"),
            }
        }
    }
}
