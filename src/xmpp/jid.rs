use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use anyhow::{bail, Error};
use regex::Regex;

/// Case normalization applied to domain labels. Stands in for full nameprep:
/// federation peers in practice differ only in ASCII case.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn from_domain(domain: &str) -> Result<Self, Error> {
        if domain.is_empty() || domain.contains('@') || domain.contains('/') {
            bail!("not a bare domain: \"{domain}\"");
        }

        Ok(Jid {
            local: None,
            domain: normalize_domain(domain),
            resource: None,
        })
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let regex =
            Regex::new(r"^(?:(?P<local>[^@/]+)@)?(?P<domain>[^@/]+)(?:/(?P<resource>.+))?$")
                .expect("static jid pattern");
        match regex.captures(s) {
            Some(captures) => {
                let local = captures.name("local").map(|m| m.as_str().to_string());
                let domain = captures
                    .name("domain")
                    .map(|m| normalize_domain(m.as_str()))
                    .expect("domain group is mandatory");
                let resource = captures.name("resource").map(|m| m.as_str().to_string());

                Ok(Jid {
                    local,
                    domain,
                    resource,
                })
            }
            None => bail!("could not parse JID: \"{s}\""),
        }
    }
}

impl Display for Jid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.local {
            Some(local) => write!(f, "{}@{}", local, self.domain)?,
            None => write!(f, "{}", self.domain)?,
        }
        match &self.resource {
            Some(resource) => write!(f, "/{}", resource)?,
            None => (),
        }
        Ok(())
    }
}
