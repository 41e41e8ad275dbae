//! TCP transport for federation streams: a plain socket that can switch to
//! TLS in either role, and the connector that opens outgoing links.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, bail, Error};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dns::SrvResolver;
use crate::settings::Credentials;
use crate::xml::stream_parser::rusty_xml::RustyXmlStreamParser;
use crate::xmpp::cert::PeerCertificate;
use crate::xmpp::stream::Connection;

use super::context::{ContextCommand, OutboundConnector, OutgoingHandle};
use super::dialback::DialbackKey;
use super::outgoing::{OutgoingSession, OutgoingSessionConfig};

enum Socket {
    Plain(TcpStream),
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

enum Role {
    /// Accepted socket; TLS via our acceptor when credentials exist.
    Server,
    /// Dialed socket; TLS towards `servername`.
    Client { servername: String },
}

pub struct TcpConnection {
    socket: Socket,
    role: Role,
    credentials: Option<Credentials>,
}

impl TcpConnection {
    pub fn inbound(socket: TcpStream, credentials: Option<Credentials>) -> Self {
        TcpConnection {
            socket: Socket::Plain(socket),
            role: Role::Server,
            credentials,
        }
    }

    pub fn outbound(socket: TcpStream, credentials: Option<Credentials>, servername: String) -> Self {
        TcpConnection {
            socket: Socket::Plain(socket),
            role: Role::Client { servername },
            credentials,
        }
    }
}

impl Connection for TcpConnection {
    type Upgrade = Pin<Box<dyn Future<Output = Result<TcpConnection, Error>> + Send>>;
    type Renegotiate = std::future::Ready<Result<TcpConnection, Error>>;

    fn upgrade(self) -> Result<Self::Upgrade, Error> {
        let TcpConnection {
            socket,
            role,
            credentials,
        } = self;

        let stream = match socket {
            Socket::Plain(stream) => stream,
            _ => bail!("connection is already secure"),
        };
        let Some(creds) = credentials else {
            bail!("no tls credentials installed");
        };

        match role {
            Role::Server => {
                let acceptor = TlsAcceptor::from(creds.server_config());
                Ok(Box::pin(async move {
                    let tls = acceptor.accept(stream).await?;
                    Ok(TcpConnection {
                        socket: Socket::ServerTls(Box::new(tls)),
                        role: Role::Server,
                        credentials: Some(creds),
                    })
                }))
            }
            Role::Client { servername } => {
                let connector = TlsConnector::from(creds.client_config());
                let name = ServerName::try_from(servername.clone()).map_err(|e| anyhow!(e))?;
                Ok(Box::pin(async move {
                    let tls = connector.connect(name, stream).await?;
                    Ok(TcpConnection {
                        socket: Socket::ClientTls(Box::new(tls)),
                        role: Role::Client { servername },
                        credentials: Some(creds),
                    })
                }))
            }
        }
    }

    fn renegotiate(self, _request_cert: bool) -> Result<Self::Renegotiate, Error> {
        // rustls deliberately has no renegotiation; peers that want EXTERNAL
        // must present their certificate in the initial handshake
        bail!("tls renegotiation is not supported by this transport")
    }

    fn is_starttls_allowed(&self) -> bool {
        matches!(self.socket, Socket::Plain(_)) && self.credentials.is_some()
    }

    fn is_secure(&self) -> bool {
        !matches!(self.socket, Socket::Plain(_))
    }

    fn is_authorized(&self) -> bool {
        match &self.socket {
            Socket::Plain(_) => false,
            // chain validation happened in the handshake; presence of a peer
            // certificate is what distinguishes an anonymous client
            Socket::ServerTls(tls) => tls.get_ref().1.peer_certificates().is_some(),
            Socket::ClientTls(_) => true,
        }
    }

    fn servername(&self) -> Option<String> {
        match (&self.socket, &self.role) {
            (Socket::ServerTls(tls), _) => tls.get_ref().1.server_name().map(|s| s.to_string()),
            (_, Role::Client { servername }) => Some(servername.clone()),
            _ => None,
        }
    }

    fn peer_certificate(&self) -> Option<PeerCertificate> {
        // Name extraction from the DER certificate is not wired up for this
        // transport; inbound peers authenticate via dialback instead of
        // EXTERNAL. See DESIGN.md.
        None
    }
}

impl AsyncRead for TcpConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_read(cx, buf),
            Socket::ServerTls(socket) => Pin::new(socket.as_mut()).poll_read(cx, buf),
            Socket::ClientTls(socket) => Pin::new(socket.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_write(cx, buf),
            Socket::ServerTls(socket) => Pin::new(socket.as_mut()).poll_write(cx, buf),
            Socket::ClientTls(socket) => Pin::new(socket.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_flush(cx),
            Socket::ServerTls(socket) => Pin::new(socket.as_mut()).poll_flush(cx),
            Socket::ClientTls(socket) => Pin::new(socket.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_shutdown(cx),
            Socket::ServerTls(socket) => Pin::new(socket.as_mut()).poll_shutdown(cx),
            Socket::ClientTls(socket) => Pin::new(socket.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Production connector: SRV resolution, TCP dial with target fallback, then
/// an [`OutgoingSession`] over the fresh socket.
pub struct TcpOutboundConnector {
    resolver: Arc<SrvResolver>,
    keys: DialbackKey,
}

impl TcpOutboundConnector {
    pub fn new(resolver: Arc<SrvResolver>, keys: DialbackKey) -> Self {
        TcpOutboundConnector { resolver, keys }
    }

    async fn open(
        resolver: Arc<SrvResolver>,
        credentials: Option<Credentials>,
        remote: &str,
    ) -> Result<TcpConnection, Error> {
        for target in resolver.resolve(remote).await {
            debug!(remote = %remote, host = %target.host, port = target.port, "dialing s2s target");
            match TcpStream::connect((target.host.as_str(), target.port)).await {
                Ok(stream) => {
                    return Ok(TcpConnection::outbound(
                        stream,
                        credentials,
                        remote.to_string(),
                    ));
                }
                Err(error) => {
                    warn!(remote = %remote, host = %target.host, error = %error, "s2s target unreachable");
                }
            }
        }

        bail!("no reachable federation target for {remote}")
    }
}

impl OutboundConnector for TcpOutboundConnector {
    fn spawn(
        &self,
        local_domain: String,
        remote_domain: String,
        credentials: Option<Credentials>,
        events: mpsc::UnboundedSender<ContextCommand>,
        session_id: Uuid,
    ) -> OutgoingHandle {
        let (tx, commands) = mpsc::unbounded_channel();
        let resolver = self.resolver.clone();
        let keys = self.keys.clone();

        tokio::spawn(async move {
            match Self::open(resolver, credentials, &remote_domain).await {
                Ok(connection) => {
                    let config = OutgoingSessionConfig {
                        local_domain,
                        remote_domain,
                        keys,
                    };
                    let session = OutgoingSession::<_, RustyXmlStreamParser<_>>::new(
                        connection, config, events, commands, session_id,
                    );
                    session.run().await;
                }
                Err(error) => {
                    warn!(remote = %remote_domain, error = %error, "could not open outgoing stream");
                    let _ = events.send(ContextCommand::OutStreamClosed {
                        remote: remote_domain,
                        session_id,
                    });
                }
            }
        });

        OutgoingHandle { id: session_id, tx }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialed = TcpStream::connect(addr);
        let accepted = listener.accept();
        let (dialed, accepted) = tokio::join!(dialed, accepted);
        (dialed.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn plain_inbound_socket_is_not_secure() {
        let (_client, server) = socket_pair().await;
        let connection = TcpConnection::inbound(server, None);
        assert!(!connection.is_secure());
        assert!(!connection.is_authorized());
        assert_eq!(connection.servername(), None);
    }

    #[tokio::test]
    async fn starttls_requires_credentials() {
        let (_client, server) = socket_pair().await;
        let connection = TcpConnection::inbound(server, None);
        assert!(!connection.is_starttls_allowed());
        assert!(connection.upgrade().is_err());
    }

    #[tokio::test]
    async fn outbound_socket_reports_dialed_servername() {
        let (client, _server) = socket_pair().await;
        let connection = TcpConnection::outbound(client, None, "remote.test".to_string());
        assert_eq!(connection.servername(), Some("remote.test".to_string()));
    }

    #[tokio::test]
    async fn renegotiation_is_unsupported() {
        let (client, _server) = socket_pair().await;
        let connection = TcpConnection::outbound(client, None, "remote.test".to_string());
        assert!(connection.renegotiate(true).is_err());
    }
}
