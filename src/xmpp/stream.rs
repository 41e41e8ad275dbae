use std::future::Future;

use anyhow::Error;
use tokio::io::{split, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

use crate::xml::{stream_parser::StreamParser, stream_writer::StreamWriter};

use super::cert::PeerCertificate;

/// Transport capability set a session runs over. Implementations wrap a plain
/// or TLS socket; `upgrade` performs the in-band STARTTLS switch and
/// `renegotiate` re-runs the handshake to request a client certificate.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + Sized + 'static {
    type Upgrade: Future<Output = Result<Self, Error>> + Send + 'static;
    type Renegotiate: Future<Output = Result<Self, Error>> + Send + 'static;

    fn upgrade(self) -> Result<Self::Upgrade, Error>;
    fn renegotiate(self, request_cert: bool) -> Result<Self::Renegotiate, Error>;

    fn is_starttls_allowed(&self) -> bool;
    fn is_secure(&self) -> bool;
    /// Peer certificate chain present and validated by the TLS layer.
    fn is_authorized(&self) -> bool;
    fn servername(&self) -> Option<String>;
    fn peer_certificate(&self) -> Option<PeerCertificate>;
}

/// Snapshot of the transport's TLS facts, refreshed whenever the connection
/// is rebuilt. Kept apart from the connection because the stream runs over
/// split halves.
#[derive(Debug, Clone, Default)]
pub struct TlsState {
    pub starttls_allowed: bool,
    pub secure: bool,
    pub authorized: bool,
    pub servername: Option<String>,
    pub peer_certificate: Option<PeerCertificate>,
}

impl TlsState {
    fn of<C: Connection>(connection: &C) -> Self {
        TlsState {
            starttls_allowed: connection.is_starttls_allowed(),
            secure: connection.is_secure(),
            authorized: connection.is_authorized(),
            servername: connection.servername(),
            peer_certificate: connection.peer_certificate(),
        }
    }
}

pub struct XmppStream<C, P>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
{
    tls: TlsState,
    reader: Option<P>,
    writer: Option<StreamWriter<WriteHalf<C>>>,
}

impl<C, P> XmppStream<C, P>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
{
    pub fn new(connection: C) -> Self {
        let tls = TlsState::of(&connection);
        let (reader, writer) = split(connection);
        let reader = Some(P::new(reader));
        let writer = Some(StreamWriter::new(writer));

        Self {
            tls,
            reader,
            writer,
        }
    }

    /// Discard parser and writer state while keeping the transport. Used on
    /// every stream restart: after STARTTLS and after SASL success.
    pub fn reset(&mut self) {
        let reader = self.reader.take().expect("reader present").into_inner();
        let writer = self.writer.take().expect("writer present").into_inner();
        self.reader = Some(P::new(reader));
        self.writer = Some(StreamWriter::new(writer));
    }

    pub fn tls(&self) -> &TlsState {
        &self.tls
    }

    pub fn is_secure(&self) -> bool {
        self.tls.secure
    }

    pub fn is_starttls_allowed(&self) -> bool {
        self.tls.starttls_allowed
    }

    pub fn reader(&mut self) -> &mut P {
        self.reader.as_mut().expect("reader present")
    }

    pub fn writer(&mut self) -> &mut StreamWriter<WriteHalf<C>> {
        self.writer.as_mut().expect("writer present")
    }

    pub async fn upgrade_to_tls(&mut self) -> Result<(), Error> {
        self.rebuild(Connection::upgrade).await
    }

    /// Re-run the TLS handshake asking the peer for a certificate. Used for
    /// SASL EXTERNAL peers that connected without presenting one.
    pub async fn renegotiate(&mut self, request_cert: bool) -> Result<(), Error> {
        self.rebuild(|connection| connection.renegotiate(request_cert))
            .await
    }

    async fn rebuild<F, Fut>(&mut self, operation: F) -> Result<(), Error>
    where
        F: FnOnce(C) -> Result<Fut, Error>,
        Fut: Future<Output = Result<C, Error>>,
    {
        let reader = self.reader.take().expect("reader present").into_inner();
        let writer = self.writer.take().expect("writer present").into_inner();
        let connection = reader.unsplit(writer);

        let connection = operation(connection)?.await?;

        self.tls = TlsState::of(&connection);

        let (reader, writer) = split(connection);
        self.reader = Some(P::new(reader));
        self.writer = Some(StreamWriter::new(writer));

        Ok(())
    }
}
