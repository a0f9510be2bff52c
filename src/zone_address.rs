// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Zone-address normalization.
//!
//! Turns a server-block key as written by the operator
//! (`"[transport://]zone[:port]"`, or a CIDR that expands to a reverse zone)
//! into a [`ZoneAddress`] plus its canonical string form.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::ZoneAddressError;

/// Wire transport a zone address is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transport {
    Dns,
    Tls,
    Quic,
    Grpc,
    Https,
    Https3,
}

impl Transport {
    pub fn scheme(self) -> &'static str {
        match self {
            Transport::Dns => "dns",
            Transport::Tls => "tls",
            Transport::Quic => "quic",
            Transport::Grpc => "grpc",
            Transport::Https => "https",
            Transport::Https3 => "https3",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Transport::Dns => 53,
            Transport::Tls => 853,
            Transport::Quic => 853,
            Transport::Grpc => 443,
            Transport::Https => 443,
            Transport::Https3 => 443,
        }
    }
}

impl FromStr for Transport {
    type Err = ZoneAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dns" => Ok(Transport::Dns),
            "tls" => Ok(Transport::Tls),
            "quic" | "doq" => Ok(Transport::Quic),
            "grpc" => Ok(Transport::Grpc),
            "https" => Ok(Transport::Https),
            "https3" | "h3" => Ok(Transport::Https3),
            other => Err(ZoneAddressError::UnknownTransport(other.to_string())),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// An immutable `{transport, zone, port}` record. `listen_hosts` is resolved
/// separately by the `bind` directive during config loading and is not part
/// of this identity (it is folded in by the listener grouper instead).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ZoneAddress {
    pub transport: Transport,
    /// Fully-qualified, lowercase, trailing-dot domain name.
    pub zone: String,
    pub port: u16,
}

impl ZoneAddress {
    /// Parse one server-block key. Returns the zone address plus a
    /// non-fatal warning when the zone fails RFC1035 preferred-syntax
    /// validation (still accepted).
    pub fn parse(key: &str) -> Result<(Self, Option<String>), ZoneAddressError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(ZoneAddressError::Empty);
        }

        // CIDR shorthand expands to a reverse-mapping zone, dns transport.
        if let Some(zone) = cidr_to_reverse_zone(key) {
            return Ok((
                ZoneAddress {
                    transport: Transport::Dns,
                    zone,
                    port: Transport::Dns.default_port(),
                },
                None,
            ));
        }

        let (transport, rest) = match key.split_once("://") {
            Some((scheme, rest)) => (scheme.parse::<Transport>()?, rest),
            None => (Transport::Dns, key),
        };

        // Split zone/port at the last colon that isn't part of an IPv6
        // literal bracket form (zones are domain names, never bracketed).
        let (zone_part, port) = match rest.rsplit_once(':') {
            Some((z, p)) if !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()) => {
                let port: u16 = p
                    .parse()
                    .map_err(|_| ZoneAddressError::InvalidPort(p.to_string()))?;
                (z, port)
            }
            _ => (rest, transport.default_port()),
        };

        let (zone, warning) = normalize_zone(zone_part);

        Ok((
            ZoneAddress {
                transport,
                zone,
                port,
            },
            warning,
        ))
    }

    /// Canonical `"transport://zone.:port"` string form. Re-parsing this
    /// string must yield an equal `ZoneAddress`.
    pub fn canonical(&self) -> String {
        format!("{}://{}:{}", self.transport, self.zone, self.port)
    }

    /// Listener identity: two zone addresses are listener-equal when they
    /// share transport and port (listen-hosts are compared separately by
    /// the caller, since they aren't part of `ZoneAddress`).
    pub fn listener_key(&self, listen_host: &str) -> String {
        format!("{}://{}:{}", self.transport, listen_host, self.port)
    }
}

/// Lowercase and fully-qualify a zone name; the root zone is `"."`.
/// Returns a non-fatal warning string if the result isn't RFC1035
/// preferred syntax.
fn normalize_zone(raw: &str) -> (String, Option<String>) {
    let lower = raw.to_ascii_lowercase();
    let fqdn = if lower == "." || lower.is_empty() {
        ".".to_string()
    } else if lower.ends_with('.') {
        lower
    } else {
        format!("{lower}.")
    };

    if is_preferred_syntax(&fqdn) {
        (fqdn, None)
    } else {
        let warning = format!("zone {fqdn:?} does not conform to RFC1035 preferred syntax");
        (fqdn, Some(warning))
    }
}

/// RFC1035 §2.3.1 preferred name syntax: labels are letters, digits and
/// hyphens, must not start/end with a hyphen, and must start with a letter.
/// The root zone and reverse-mapping `in-addr.arpa`/`ip6.arpa` special forms
/// are always accepted.
fn is_preferred_syntax(fqdn: &str) -> bool {
    if fqdn == "." {
        return true;
    }
    let trimmed = fqdn.trim_end_matches('.');
    trimmed.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            && label.chars().last().is_some_and(|c| c != '-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Translate `"192.168.0.0/24"` / `"2001:db8::/32"` into the matching
/// `in-addr.arpa.` / `ip6.arpa.` zone. Returns `None` if `key` isn't CIDR
/// shorthand.
fn cidr_to_reverse_zone(key: &str) -> Option<String> {
    let (addr_part, prefix_part) = key.split_once('/')?;
    let addr: IpAddr = addr_part.parse().ok()?;
    let prefix_len: u32 = prefix_part.parse().ok()?;

    match addr {
        IpAddr::V4(v4) => {
            if prefix_len == 0 || prefix_len > 32 || prefix_len % 8 != 0 {
                return None;
            }
            let octets = v4.octets();
            let kept = (prefix_len / 8) as usize;
            let mut labels: Vec<String> = octets[..kept]
                .iter()
                .rev()
                .map(|o| o.to_string())
                .collect();
            labels.push("in-addr".to_string());
            labels.push("arpa".to_string());
            Some(format!("{}.", labels.join(".")))
        }
        IpAddr::V6(v6) => {
            if prefix_len == 0 || prefix_len > 128 || prefix_len % 4 != 0 {
                return None;
            }
            let nibbles: Vec<char> = v6
                .segments()
                .iter()
                .flat_map(|seg| format!("{seg:04x}").chars().collect::<Vec<_>>())
                .collect();
            let kept = (prefix_len / 4) as usize;
            let mut labels: Vec<String> = nibbles[..kept]
                .iter()
                .rev()
                .map(|c| c.to_string())
                .collect();
            labels.push("ip6".to_string());
            labels.push("arpa".to_string());
            Some(format!("{}.", labels.join(".")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_per_transport() {
        assert_eq!(Transport::Dns.default_port(), 53);
        assert_eq!(Transport::Tls.default_port(), 853);
        assert_eq!(Transport::Quic.default_port(), 853);
        assert_eq!(Transport::Grpc.default_port(), 443);
        assert_eq!(Transport::Https.default_port(), 443);
        assert_eq!(Transport::Https3.default_port(), 443);
    }

    #[test]
    fn parses_bare_zone() {
        let (za, warn) = ZoneAddress::parse("example.org").unwrap();
        assert_eq!(za.transport, Transport::Dns);
        assert_eq!(za.zone, "example.org.");
        assert_eq!(za.port, 53);
        assert!(warn.is_none());
    }

    #[test]
    fn parses_transport_prefixed_with_port() {
        let (za, _) = ZoneAddress::parse("https://.:8443").unwrap();
        assert_eq!(za.transport, Transport::Https);
        assert_eq!(za.zone, ".");
        assert_eq!(za.port, 8443);
    }

    #[test]
    fn root_zone_is_dot() {
        let (za, _) = ZoneAddress::parse(".").unwrap();
        assert_eq!(za.zone, ".");
    }

    #[test]
    fn idempotent_canonicalization() {
        let (za, _) = ZoneAddress::parse("tls://Example.ORG:853").unwrap();
        let canon = za.canonical();
        let (za2, _) = ZoneAddress::parse(&canon).unwrap();
        assert_eq!(za, za2);
        assert_eq!(canon, za2.canonical());
    }

    #[test]
    fn cidr_expands_to_reverse_zone() {
        let (za, _) = ZoneAddress::parse("192.168.1.0/24").unwrap();
        assert_eq!(za.zone, "1.168.192.in-addr.arpa.");
    }

    #[test]
    fn unknown_transport_is_error() {
        assert!(matches!(
            ZoneAddress::parse("ftp://example.org"),
            Err(ZoneAddressError::UnknownTransport(_))
        ));
    }

    #[test]
    fn non_preferred_syntax_warns_but_accepts() {
        let (za, warn) = ZoneAddress::parse("_dmarc.example.org").unwrap();
        assert_eq!(za.zone, "_dmarc.example.org.");
        assert!(warn.is_some());
    }
}
