//! Peer certificate identity, as surfaced by the transport. The transport
//! hands over name material already extracted from the certificate; matching
//! against the stream's server name happens here.

/// Name material from an X.509 end-entity certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerCertificate {
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
}

impl PeerCertificate {
    /// A certificate that carries no usable identity, as produced by a TLS
    /// layer that completed the handshake without requesting one.
    pub fn is_empty(&self) -> bool {
        self.common_name.is_none() && self.dns_names.is_empty()
    }

    /// TLS server identity check: subjectAltName DNS entries decide when any
    /// are present, the subject CN is consulted only for SAN-less
    /// certificates.
    pub fn matches_name(&self, name: &str) -> bool {
        if !self.dns_names.is_empty() {
            return self
                .dns_names
                .iter()
                .any(|pattern| matches_dns(pattern, name));
        }

        match &self.common_name {
            Some(pattern) => matches_dns(pattern, name),
            None => false,
        }
    }
}

/// Case-insensitive DNS name comparison with wildcard support. A `*` must be
/// the entire leftmost label and matches exactly one label, so
/// `*.example.com` covers `xmpp.example.com` but neither `example.com` nor
/// `a.b.example.com`.
pub fn matches_dns(pattern: &str, name: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    let name = name.trim_end_matches('.').to_ascii_lowercase();

    if let Some(suffix) = pattern.strip_prefix("*.") {
        return match name.split_once('.') {
            Some((label, rest)) => !label.is_empty() && !label.contains('*') && rest == suffix,
            None => false,
        };
    }

    pattern == name
}
