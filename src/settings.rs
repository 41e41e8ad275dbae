use std::sync::Arc;
use std::{fs::File, io::BufReader};

use anyhow::{anyhow, bail, Error};
use rustls_native_certs::load_native_certs;
use rustls_pemfile::{certs, pkcs8_private_keys};
use serde::{Deserialize, Deserializer};
use tokio_rustls::rustls::pki_types::PrivateKeyDer::Pkcs8;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::xmpp::jid::normalize_domain;

#[derive(Debug, Clone, Deserialize)]
pub struct TlsSettings {
    pub certificate_chain: String,
    pub private_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(deserialize_with = "deserialize_domains")]
    pub domains: Vec<String>,
    /// Offer SASL EXTERNAL to secured inbound peers.
    #[serde(default)]
    pub secure_domain: bool,
    /// Dialback HMAC secret; generated per process when absent.
    #[serde(default)]
    pub dialback_secret: Option<String>,
    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

fn default_listen() -> String {
    "0.0.0.0:5269".to_string()
}

impl Settings {
    pub fn init() -> Result<Self, Error> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/defaults").required(false))
            .add_source(config::File::with_name("config/overrides").required(false))
            .add_source(config::Environment::with_prefix("FEDERANT").separator("__"))
            .build()?;

        settings.try_deserialize().map_err(|e| anyhow!(e))
    }
}

fn deserialize_domains<'d, D: Deserializer<'d>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let raw = Vec::<String>::deserialize(deserializer)?;
    Ok(raw.iter().map(|domain| normalize_domain(domain)).collect())
}

/// The process TLS identity: one certificate serving both as our server
/// credential for inbound STARTTLS and as the client credential presented on
/// outgoing streams. Read-only once loaded; every session shares it.
#[derive(Clone)]
pub struct Credentials {
    server: Arc<ServerConfig>,
    client: Arc<ClientConfig>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn load(tls: &TlsSettings) -> Result<Self, Error> {
        let chain = load_certificate_chain(&tls.certificate_chain)?;
        let key = load_private_key(&tls.private_key)?;

        let mut roots = RootCertStore::empty();
        for cert in load_native_certs()? {
            roots.add(cert)?;
        }
        let roots = Arc::new(roots);

        let client_cert_verifier = WebPkiClientVerifier::builder(roots.clone())
            .allow_unauthenticated()
            .build()?;
        let server = ServerConfig::builder()
            .with_client_cert_verifier(client_cert_verifier)
            .with_single_cert(chain.clone(), key.clone_key())?;

        let client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(chain, key)?;

        Ok(Credentials {
            server: Arc::new(server),
            client: Arc::new(client),
        })
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server.clone()
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client.clone()
    }
}

fn load_certificate_chain(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = &mut BufReader::new(File::open(path)?);
    let chain = certs(file).collect::<Result<Vec<_>, _>>()?;
    if chain.is_empty() {
        bail!("no certificates in {path}");
    }
    Ok(chain)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, Error> {
    let file = &mut BufReader::new(File::open(path)?);
    let mut keys = pkcs8_private_keys(file).collect::<Result<Vec<_>, _>>()?;
    if keys.is_empty() {
        bail!("no pkcs8 private key in {path}");
    }
    Ok(Pkcs8(keys.remove(0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_yaml(yaml: &str) -> Result<Settings, Error> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?;
        config.try_deserialize().map_err(|e| anyhow!(e))
    }

    #[test]
    fn minimal_settings() {
        let settings = from_yaml("domains:\n  - example.org\n").unwrap();
        assert_eq!(settings.domains, vec!["example.org"]);
        assert_eq!(settings.listen, "0.0.0.0:5269");
        assert!(!settings.secure_domain);
        assert!(settings.dialback_secret.is_none());
        assert!(settings.tls.is_none());
    }

    #[test]
    fn domains_are_normalized() {
        let settings = from_yaml("domains:\n  - EXAMPLE.Org\n  - Chat.Example.NET.\n").unwrap();
        assert_eq!(settings.domains, vec!["example.org", "chat.example.net"]);
    }

    #[test]
    fn domains_are_required() {
        assert!(from_yaml("listen: 127.0.0.1:5269\n").is_err());
    }

    #[test]
    fn full_settings() {
        let settings = from_yaml(
            "listen: 127.0.0.1:15269\n\
             domains:\n  - example.org\n\
             secure_domain: true\n\
             dialback_secret: hunter2\n\
             tls:\n  certificate_chain: /etc/federant/fullchain.pem\n  private_key: /etc/federant/key.pem\n",
        )
        .unwrap();
        assert_eq!(settings.listen, "127.0.0.1:15269");
        assert!(settings.secure_domain);
        assert_eq!(settings.dialback_secret.as_deref(), Some("hunter2"));
        assert_eq!(
            settings.tls.unwrap().certificate_chain,
            "/etc/federant/fullchain.pem"
        );
    }
}
