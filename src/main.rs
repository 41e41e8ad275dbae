use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use federant::dns::SrvResolver;
use federant::router::Router;
use federant::s2s::connection::{TcpConnection, TcpOutboundConnector};
use federant::s2s::context::DomainContext;
use federant::s2s::dialback::DialbackKey;
use federant::s2s::incoming::{IncomingSession, IncomingSessionSettings};
use federant::settings::{Credentials, Settings};
use federant::xml::stream_parser::rusty_xml::RustyXmlStreamParser;

type Error = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "federant", about = "XMPP server-to-server federation daemon")]
struct Cli {
    /// Listen address, overriding the configuration file.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = Settings::init()?;
    let listen = cli.listen.unwrap_or_else(|| settings.listen.clone());

    let credentials = match &settings.tls {
        Some(tls) => Some(Credentials::load(tls)?),
        None => None,
    };
    let keys = match &settings.dialback_secret {
        Some(secret) => DialbackKey::new(secret.as_bytes()),
        None => DialbackKey::generated(),
    };

    let resolver = Arc::new(SrvResolver::from_system_conf()?);
    let connector = Arc::new(TcpOutboundConnector::new(resolver, keys));

    let (stanza_tx, mut stanza_rx) = mpsc::unbounded_channel();
    let mut router = Router::new();
    for domain in &settings.domains {
        let context = DomainContext::spawn(
            domain.clone(),
            stanza_tx.clone(),
            connector.clone(),
            credentials.clone(),
        );
        router.register(context);
    }
    let router = Arc::new(router);

    // stand-in for the hosting application's stanza listener
    tokio::spawn(async move {
        while let Some(stanza) = stanza_rx.recv().await {
            info!(
                name = stanza.element.name(),
                from = stanza.from_attr().unwrap_or(""),
                to = stanza.to_attr().unwrap_or(""),
                "stanza delivered"
            );
        }
    });

    let listener = TcpListener::bind(&listen).await?;
    info!(listen = %listen, domains = ?settings.domains, "federation core listening");

    loop {
        let (socket, peer_addr) = listener.accept().await?;

        let router = router.clone();
        let credentials = credentials.clone();
        let secure_domain = settings.secure_domain;

        tokio::spawn(async move {
            info!(peer = %peer_addr, "inbound s2s connection");
            let connection = TcpConnection::inbound(socket, credentials);
            let session = IncomingSession::<_, RustyXmlStreamParser<_>>::new(
                connection,
                router,
                IncomingSessionSettings { secure_domain },
            );
            session.run().await;
        });
    }
}
