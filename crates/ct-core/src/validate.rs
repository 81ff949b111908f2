//! Field-level parsers shared by rule forms and listing parsers.

use crate::error::ValidationError;
use crate::model::NatAddress;
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};

/// Longest interface name the kernel accepts (IFNAMSIZ minus the NUL).
pub const MAX_INTERFACE_LEN: usize = 15;

/// Longest comment the xt_comment match stores.
pub const MAX_COMMENT_LEN: usize = 256;

/// Parses an address or CIDR network. A bare address becomes a host network.
pub fn network(field: &'static str, value: &str) -> Result<IpNet, ValidationError> {
    let value = value.trim();
    if value.contains('/') {
        return value
            .parse::<IpNet>()
            .map_err(|e| ValidationError::InvalidAddress {
                field,
                value: value.to_string(),
                reason: e.to_string(),
            });
    }

    value
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|e| ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

pub fn port(field: &'static str, value: &str) -> Result<u16, ValidationError> {
    let invalid = || ValidationError::InvalidPort {
        field,
        value: value.to_string(),
    };
    let port: u16 = value.trim().parse().map_err(|_| invalid())?;
    port_number(field, port).map_err(|_| invalid())
}

pub fn port_number(field: &'static str, port: u16) -> Result<u16, ValidationError> {
    if port == 0 {
        return Err(ValidationError::InvalidPort {
            field,
            value: port.to_string(),
        });
    }
    Ok(port)
}

/// Checks an interface name; a trailing `+` is the iptables prefix wildcard.
pub fn interface(field: &'static str, name: &str) -> Result<(), ValidationError> {
    let invalid = |reason| ValidationError::InvalidInterface {
        field,
        value: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_INTERFACE_LEN {
        return Err(invalid("name is longer than 15 bytes"));
    }
    if name == "." || name == ".." {
        return Err(invalid("reserved name"));
    }
    let stem = name.strip_suffix('+').unwrap_or(name);
    if stem.contains('+') {
        return Err(invalid("'+' is only allowed as the last character"));
    }
    if name
        .chars()
        .any(|c| !c.is_ascii_graphic() || matches!(c, '/' | ':' | '"' | '\'' | '!' | '*'))
    {
        return Err(invalid("contains a forbidden character"));
    }
    Ok(())
}

pub fn comment(text: &str) -> Result<(), ValidationError> {
    if text.len() > MAX_COMMENT_LEN {
        return Err(ValidationError::InvalidComment("longer than 256 bytes"));
    }
    if text.chars().any(char::is_control) {
        return Err(ValidationError::InvalidComment("contains control characters"));
    }
    if text.contains("*/") {
        return Err(ValidationError::InvalidComment("contains '*/'"));
    }
    Ok(())
}

/// Parses `IP`, `IP:PORT` or `[IPv6]:PORT`.
pub fn nat_address(value: &str) -> Result<NatAddress, ValidationError> {
    let value = value.trim();
    let invalid = |reason: &str| ValidationError::InvalidNatAddress {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    if value.is_empty() {
        return Err(invalid("address is empty"));
    }
    if let Ok(addr) = value.parse::<IpAddr>() {
        return Ok(NatAddress { addr, port: None });
    }
    if let Ok(sock) = value.parse::<SocketAddr>() {
        if sock.port() == 0 {
            return Err(invalid("port must be between 1 and 65535"));
        }
        return Ok(NatAddress {
            addr: sock.ip(),
            port: Some(sock.port()),
        });
    }

    match value.rsplit_once(':') {
        Some((addr, port)) if addr.parse::<IpAddr>().is_ok() => {
            Err(invalid(&format!("invalid port '{}'", port)))
        }
        _ => Err(invalid("expected IP or IP:PORT")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_parsing() {
        assert_eq!(network("source", "10.0.0.0/24").unwrap().to_string(), "10.0.0.0/24");
        assert_eq!(network("source", "10.0.0.1").unwrap().to_string(), "10.0.0.1/32");
        assert_eq!(network("source", "2001:db8::/32").unwrap().to_string(), "2001:db8::/32");

        assert!(network("source", "10.0.0.0/33").is_err());
        assert!(network("source", "invalid/24").is_err());
        assert!(network("source", "300.1.1.1").is_err());
        assert!(network("source", "10.0.0.1; rm -rf /").is_err());
    }

    #[test]
    fn test_port_validation() {
        assert_eq!(port("dport", "22").unwrap(), 22);
        assert_eq!(port("dport", " 65535 ").unwrap(), 65535);

        assert!(port("dport", "0").is_err());
        assert!(port("dport", "65536").is_err());
        assert!(port("dport", "22,80").is_err());
    }

    #[test]
    fn test_interface_validation() {
        assert!(interface("in", "eth0").is_ok());
        assert!(interface("in", "wg+").is_ok());
        assert!(interface("in", "enp0s31f6").is_ok());

        assert!(interface("in", "").is_err());
        assert!(interface("in", "a-very-long-interface").is_err());
        assert!(interface("in", "eth 0").is_err());
        assert!(interface("in", "e+th0").is_err());
        assert!(interface("in", "..").is_err());
        assert!(interface("in", "eth0\"").is_err());
        assert!(interface("in", "eth0:1").is_err());
    }

    #[test]
    fn test_comment_validation() {
        assert!(comment("allow ssh from office").is_ok());
        assert!(comment("quotes \" and $vars are fine").is_ok());

        assert!(comment("line\nbreak").is_err());
        assert!(comment("closes */ early").is_err());
        assert!(comment(&"x".repeat(257)).is_err());
    }

    #[test]
    fn test_nat_address_validation() {
        let with_port = nat_address("10.0.0.5:8080").unwrap();
        assert_eq!(with_port.port, Some(8080));
        assert_eq!(with_port.to_string(), "10.0.0.5:8080");

        let bare = nat_address("192.168.1.1").unwrap();
        assert_eq!(bare.port, None);

        let v6 = nat_address("[2001:db8::1]:443").unwrap();
        assert_eq!(v6.to_string(), "[2001:db8::1]:443");

        assert!(nat_address("").is_err());
        assert!(nat_address("10.0.0.5:0").is_err());
        assert!(nat_address("10.0.0.5:http").is_err());
        assert!(nat_address("example.com:80").is_err());
    }
}
