//! In-memory transport stub shared by the session tests: a duplex pipe that
//! reports scripted TLS facts and records upgrade/renegotiation calls.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf};

use crate::xmpp::cert::PeerCertificate;
use crate::xmpp::stream::Connection;

#[derive(Debug, Default, Clone)]
pub struct TlsScript {
    pub starttls_allowed: bool,
    pub secure: bool,
    pub authorized: bool,
    pub servername: Option<String>,
    pub certificate: Option<PeerCertificate>,
    /// Installed as the peer certificate when a renegotiation requests one.
    pub certificate_on_renegotiate: Option<PeerCertificate>,
}

#[derive(Debug, Default)]
pub struct TlsProbe {
    pub upgraded: bool,
    pub renegotiated: bool,
}

pub struct TestConnection {
    io: DuplexStream,
    script: Arc<Mutex<TlsScript>>,
    probe: Arc<Mutex<TlsProbe>>,
}

impl TestConnection {
    /// Returns the near end wrapped as a `Connection`, the far end for the
    /// test to speak through, and the shared script/probe cells.
    pub fn pair(
        script: TlsScript,
    ) -> (
        TestConnection,
        DuplexStream,
        Arc<Mutex<TlsScript>>,
        Arc<Mutex<TlsProbe>>,
    ) {
        let (near, far) = tokio::io::duplex(16 * 1024);
        let script = Arc::new(Mutex::new(script));
        let probe = Arc::new(Mutex::new(TlsProbe::default()));
        let connection = TestConnection {
            io: near,
            script: script.clone(),
            probe: probe.clone(),
        };
        (connection, far, script, probe)
    }
}

impl AsyncRead for TestConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for TestConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl Connection for TestConnection {
    type Upgrade = std::future::Ready<Result<Self, Error>>;
    type Renegotiate = std::future::Ready<Result<Self, Error>>;

    fn upgrade(self) -> Result<Self::Upgrade, Error> {
        self.probe.lock().unwrap().upgraded = true;
        self.script.lock().unwrap().secure = true;
        Ok(std::future::ready(Ok(self)))
    }

    fn renegotiate(self, request_cert: bool) -> Result<Self::Renegotiate, Error> {
        self.probe.lock().unwrap().renegotiated = true;
        if request_cert {
            let mut script = self.script.lock().unwrap();
            script.certificate = script.certificate_on_renegotiate.take();
        }
        Ok(std::future::ready(Ok(self)))
    }

    fn is_starttls_allowed(&self) -> bool {
        self.script.lock().unwrap().starttls_allowed
    }

    fn is_secure(&self) -> bool {
        self.script.lock().unwrap().secure
    }

    fn is_authorized(&self) -> bool {
        self.script.lock().unwrap().authorized
    }

    fn servername(&self) -> Option<String> {
        self.script.lock().unwrap().servername.clone()
    }

    fn peer_certificate(&self) -> Option<PeerCertificate> {
        self.script.lock().unwrap().certificate.clone()
    }
}

/// Reads from the far end until `collected` contains `needle`, panicking with
/// the transcript when it never shows up.
pub async fn read_until(far: &mut DuplexStream, collected: &mut String, needle: &str) {
    let mut buf = [0u8; 4096];
    for _ in 0..100 {
        if collected.contains(needle) {
            return;
        }
        match tokio::time::timeout(Duration::from_millis(100), far.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => collected.push_str(std::str::from_utf8(&buf[..n]).expect("utf8 output")),
            Ok(Err(error)) => panic!("read error: {error}"),
            Err(_) => {}
        }
    }
    assert!(
        collected.contains(needle),
        "never saw {needle:?} in {collected:?}"
    );
}

/// Asserts the session has written nothing.
pub async fn assert_silent(far: &mut DuplexStream) {
    let mut buf = [0u8; 256];
    match tokio::time::timeout(Duration::from_millis(100), far.read(&mut buf)).await {
        Err(_) => {}
        Ok(Ok(0)) => {}
        Ok(Ok(n)) => panic!(
            "unexpected output: {:?}",
            std::str::from_utf8(&buf[..n]).unwrap_or("<binary>")
        ),
        Ok(Err(error)) => panic!("read error: {error}"),
    }
}
