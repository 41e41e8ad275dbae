//! SRV-based discovery of federation targets, `_xmpp-server._tcp.<domain>`,
//! with the RFC 6120 fallback to the bare domain on port 5269.

use anyhow::Error;
use hickory_resolver::TokioAsyncResolver;
use tracing::debug;

pub const XMPP_SERVER_PORT: u16 = 5269;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub host: String,
    pub port: u16,
}

pub(crate) struct SrvEntry {
    pub priority: u16,
    pub weight: u16,
    pub host: String,
    pub port: u16,
}

/// Order by priority, higher weight first within a priority, and drop the
/// "." target that RFC 2782 uses to mark the service as absent.
fn into_targets(mut entries: Vec<SrvEntry>) -> Vec<ResolvedTarget> {
    entries.sort_by_key(|entry| (entry.priority, std::cmp::Reverse(entry.weight)));
    entries
        .into_iter()
        .filter(|entry| entry.host != "." && !entry.host.is_empty())
        .map(|entry| ResolvedTarget {
            host: entry.host,
            port: entry.port,
        })
        .collect()
}

pub struct SrvResolver {
    inner: TokioAsyncResolver,
}

impl SrvResolver {
    pub fn from_system_conf() -> Result<Self, Error> {
        let inner = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(SrvResolver { inner })
    }

    /// Candidate targets for a remote domain, best first. Resolution failures
    /// degrade to the bare domain so that SRV-less deployments still federate.
    pub async fn resolve(&self, domain: &str) -> Vec<ResolvedTarget> {
        let query = format!("_xmpp-server._tcp.{domain}.");

        let targets = match self.inner.srv_lookup(query).await {
            Ok(lookup) => {
                let entries = lookup
                    .iter()
                    .map(|record| SrvEntry {
                        priority: record.priority(),
                        weight: record.weight(),
                        host: record
                            .target()
                            .to_utf8()
                            .trim_end_matches('.')
                            .to_string(),
                        port: record.port(),
                    })
                    .collect();
                into_targets(entries)
            }
            Err(error) => {
                debug!(domain = %domain, error = %error, "srv lookup failed");
                Vec::new()
            }
        };

        if targets.is_empty() {
            return vec![ResolvedTarget {
                host: domain.to_string(),
                port: XMPP_SERVER_PORT,
            }];
        }

        targets
    }
}
