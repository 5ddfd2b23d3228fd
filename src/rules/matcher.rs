//! Matcher kinds and their evaluation.
//!
//! # Responsibilities
//! - Represent the closed set of matcher kinds
//! - Normalise values (lowercase domains, bare suffixes)
//! - Parse the classical `TYPE,value` line format
//! - Evaluate a matcher against a destination
//!
//! # Design Decisions
//! - Suffix `example.com` matches `example.com` itself and any subdomain
//! - Keyword is a plain substring test on the lowercased domain
//! - Matchers never reorder; precedence comes only from table position

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Connection metadata a routing table is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct Destination {
    pub domain: Option<String>,
    pub ip: Option<IpAddr>,
    /// ISO country code of `ip`, when a GeoIP lookup has been done.
    pub country: Option<String>,
    pub port: Option<u16>,
}

impl Destination {
    pub fn domain(domain: impl Into<String>) -> Self {
        Self {
            domain: Some(domain.into().to_ascii_lowercase()),
            ..Default::default()
        }
    }

    pub fn ip(ip: IpAddr) -> Self {
        Self {
            ip: Some(ip),
            ..Default::default()
        }
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into().to_ascii_uppercase());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

/// A single match condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Matcher {
    /// Exact domain.
    Domain(String),
    /// Domain or any of its subdomains.
    DomainSuffix(String),
    /// Substring of the domain.
    DomainKeyword(String),
    /// Regular expression over the domain.
    DomainRegex(String),
    /// Destination address inside a CIDR block.
    IpCidr(IpNet),
    /// Destination address located in a country.
    #[serde(rename = "geoip")]
    GeoIp(String),
    /// Destination port.
    DstPort(u16),
    /// Catch-all.
    Final,
}

impl Matcher {
    /// Canonical form used by resolution and every compiler.
    pub fn normalized(self) -> Self {
        match self {
            Self::Domain(d) => Self::Domain(d.trim().to_ascii_lowercase()),
            Self::DomainSuffix(d) => {
                Self::DomainSuffix(d.trim().trim_start_matches('.').to_ascii_lowercase())
            }
            Self::DomainKeyword(d) => Self::DomainKeyword(d.trim().to_ascii_lowercase()),
            Self::GeoIp(c) => Self::GeoIp(c.trim().to_ascii_uppercase()),
            Self::IpCidr(net) => Self::IpCidr(net.trunc()),
            other => other,
        }
    }

    /// Classical type keyword (`DOMAIN-SUFFIX`, `GEOIP`, ...).
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Domain(_) => "DOMAIN",
            Self::DomainSuffix(_) => "DOMAIN-SUFFIX",
            Self::DomainKeyword(_) => "DOMAIN-KEYWORD",
            Self::DomainRegex(_) => "DOMAIN-REGEX",
            Self::IpCidr(IpNet::V4(_)) => "IP-CIDR",
            Self::IpCidr(IpNet::V6(_)) => "IP-CIDR6",
            Self::GeoIp(_) => "GEOIP",
            Self::DstPort(_) => "DST-PORT",
            Self::Final => "MATCH",
        }
    }

    /// Value part of the classical form; empty for `Final`.
    pub fn value(&self) -> String {
        match self {
            Self::Domain(v)
            | Self::DomainSuffix(v)
            | Self::DomainKeyword(v)
            | Self::DomainRegex(v)
            | Self::GeoIp(v) => v.clone(),
            Self::IpCidr(net) => net.to_string(),
            Self::DstPort(p) => p.to_string(),
            Self::Final => String::new(),
        }
    }

    pub fn is_domain_based(&self) -> bool {
        matches!(
            self,
            Self::Domain(_) | Self::DomainSuffix(_) | Self::DomainKeyword(_) | Self::DomainRegex(_)
        )
    }

    /// Matchers evaluated against the destination address.
    pub fn is_ip_based(&self) -> bool {
        matches!(self, Self::IpCidr(_) | Self::GeoIp(_))
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Final)
    }

    /// Parse `TYPE,value[,...]`. Fields after the value are ignored.
    pub fn parse_line(line: &str) -> Result<Self, String> {
        let mut fields = line.split(',').map(str::trim);
        let kind = fields.next().unwrap_or_default().to_ascii_uppercase();
        let value = fields.next().unwrap_or_default();

        if kind == "MATCH" || kind == "FINAL" {
            return Ok(Self::Final);
        }
        if value.is_empty() {
            return Err(format!("missing value for '{}'", kind));
        }

        let matcher = match kind.as_str() {
            "DOMAIN" => Self::Domain(value.to_string()),
            "DOMAIN-SUFFIX" => Self::DomainSuffix(value.to_string()),
            "DOMAIN-KEYWORD" => Self::DomainKeyword(value.to_string()),
            "DOMAIN-REGEX" => {
                Regex::new(value).map_err(|e| format!("invalid regex '{}': {}", value, e))?;
                Self::DomainRegex(value.to_string())
            }
            "IP-CIDR" | "IP-CIDR6" => Self::IpCidr(
                value
                    .parse()
                    .map_err(|e| format!("invalid CIDR '{}': {}", value, e))?,
            ),
            "GEOIP" => Self::GeoIp(value.to_string()),
            "DST-PORT" | "DEST-PORT" => Self::DstPort(
                value
                    .parse()
                    .map_err(|e| format!("invalid port '{}': {}", value, e))?,
            ),
            other => return Err(format!("unsupported matcher type '{}'", other)),
        };
        Ok(matcher.normalized())
    }

    /// Evaluate against a destination. `regex` is the pre-compiled form of a
    /// `DomainRegex` value.
    pub fn matches(&self, dest: &Destination, regex: Option<&Regex>) -> bool {
        match self {
            Self::Domain(d) => dest.domain.as_deref() == Some(d.as_str()),
            Self::DomainSuffix(suffix) => dest.domain.as_deref().is_some_and(|host| {
                host == suffix
                    || (host.len() > suffix.len()
                        && host.ends_with(suffix.as_str())
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
            }),
            Self::DomainKeyword(k) => dest.domain.as_deref().is_some_and(|h| h.contains(k.as_str())),
            Self::DomainRegex(_) => match (dest.domain.as_deref(), regex) {
                (Some(host), Some(re)) => re.is_match(host),
                _ => false,
            },
            Self::IpCidr(net) => dest.ip.is_some_and(|ip| net.contains(&ip)),
            Self::GeoIp(code) => dest.country.as_deref() == Some(code.as_str()),
            Self::DstPort(p) => dest.port == Some(*p),
            Self::Final => true,
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Final => f.write_str("MATCH"),
            other => write!(f, "{},{}", other.type_name(), other.value()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_matching() {
        let m = Matcher::DomainSuffix(".Example.com".into()).normalized();
        assert!(m.matches(&Destination::domain("x.example.com"), None));
        assert!(m.matches(&Destination::domain("example.com"), None));
        assert!(!m.matches(&Destination::domain("badexample.com"), None));
        assert!(!m.matches(&Destination::domain("other.com"), None));
    }

    #[test]
    fn test_exact_and_keyword() {
        let exact = Matcher::Domain("ads.example.com".into());
        assert!(exact.matches(&Destination::domain("ADS.example.com"), None));
        assert!(!exact.matches(&Destination::domain("x.ads.example.com"), None));

        let kw = Matcher::DomainKeyword("track".into());
        assert!(kw.matches(&Destination::domain("metrics.tracker.net"), None));
    }

    #[test]
    fn test_ip_matchers() {
        let cidr = Matcher::parse_line("IP-CIDR,10.0.0.0/8,no-resolve").unwrap();
        assert!(cidr.matches(&Destination::ip("10.1.2.3".parse().unwrap()), None));
        assert!(!cidr.matches(&Destination::domain("10.1.2.3"), None));

        let geo = Matcher::parse_line("GEOIP,cn").unwrap();
        let dest = Destination::ip("1.2.3.4".parse().unwrap()).with_country("CN");
        assert!(geo.matches(&dest, None));
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(Matcher::parse_line("MATCH,DIRECT").unwrap(), Matcher::Final);
        assert_eq!(Matcher::parse_line("DEST-PORT,443").unwrap(), Matcher::DstPort(443));
        assert!(Matcher::parse_line("DOMAIN-REGEX,(").is_err());
        assert!(Matcher::parse_line("PROCESS-NAME,curl").is_err());
        assert_eq!(
            Matcher::parse_line("IP-CIDR6,2001:db8::/32").unwrap().type_name(),
            "IP-CIDR6"
        );
    }

    #[test]
    fn test_display_round_trips_classical_form() {
        let m = Matcher::parse_line("DOMAIN-SUFFIX,.Google.com").unwrap();
        assert_eq!(m.to_string(), "DOMAIN-SUFFIX,google.com");
    }
}
