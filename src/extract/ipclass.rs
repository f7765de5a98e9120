use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Serialize;

/// Classification of a source address against the well-known ranges.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IpClassification {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_name: Option<&'static str>,
    pub is_internal: bool,
}

impl IpClassification {
    fn new(kind: &'static str, range_name: Option<&'static str>, is_internal: bool) -> Self {
        Self {
            kind,
            range_name,
            is_internal,
        }
    }
}

pub fn classify_ip(ip: IpAddr) -> IpClassification {
    match ip {
        IpAddr::V4(v4) => classify_v4(v4),
        IpAddr::V6(v6) => {
            // Unwrap v4-mapped addresses the columnar backend stores.
            match v6.to_ipv4_mapped() {
                Some(v4) => classify_v4(v4),
                None => classify_v6(v6),
            }
        }
    }
}

fn classify_v4(ip: Ipv4Addr) -> IpClassification {
    let octets = ip.octets();
    if ip.is_loopback() {
        return IpClassification::new("loopback", Some("RFC1122 Loopback"), true);
    }
    if ip.is_broadcast() {
        return IpClassification::new("broadcast", Some("Limited Broadcast"), false);
    }
    if ip.is_link_local() {
        return IpClassification::new("link_local", Some("RFC3927 Link-Local"), true);
    }
    if ip.is_multicast() {
        return IpClassification::new("multicast", Some("RFC5771 Multicast"), false);
    }
    match octets {
        [10, ..] => IpClassification::new("private", Some("RFC1918 Class A"), true),
        [172, b, ..] if (16..=31).contains(&b) => {
            IpClassification::new("private", Some("RFC1918 Class B"), true)
        }
        [192, 168, ..] => IpClassification::new("private", Some("RFC1918 Class C"), true),
        [100, b, ..] if (64..=127).contains(&b) => {
            IpClassification::new("cgnat", Some("RFC6598 Shared Address Space"), true)
        }
        [192, 0, 2, _] => IpClassification::new("reserved", Some("TEST-NET-1"), false),
        [198, 51, 100, _] => IpClassification::new("reserved", Some("TEST-NET-2"), false),
        [203, 0, 113, _] => IpClassification::new("reserved", Some("TEST-NET-3"), false),
        [0, ..] => IpClassification::new("reserved", Some("This Network"), false),
        [a, ..] if a >= 240 => IpClassification::new("reserved", Some("RFC1112 Class E"), false),
        _ => IpClassification::new("public", None, false),
    }
}

fn classify_v6(ip: Ipv6Addr) -> IpClassification {
    if ip.is_loopback() {
        return IpClassification::new("loopback", Some("RFC4291 Loopback"), true);
    }
    let segments = ip.segments();
    if segments[0] & 0xfe00 == 0xfc00 {
        return IpClassification::new("private", Some("RFC4193 Unique Local"), true);
    }
    if segments[0] & 0xffc0 == 0xfe80 {
        return IpClassification::new("link_local", Some("RFC4291 Link-Local"), true);
    }
    if segments[0] & 0xff00 == 0xff00 {
        return IpClassification::new("multicast", Some("RFC4291 Multicast"), false);
    }
    if segments[0] == 0x2001 && segments[1] == 0x0db8 {
        return IpClassification::new("reserved", Some("RFC3849 Documentation"), false);
    }
    IpClassification::new("public", None, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(s: &str) -> IpClassification {
        classify_ip(s.parse().unwrap())
    }

    #[test]
    fn rfc1918_class_a() {
        let c = classify("10.0.0.1");
        assert_eq!(c.kind, "private");
        assert_eq!(c.range_name, Some("RFC1918 Class A"));
        assert!(c.is_internal);
    }

    #[test]
    fn public_address() {
        let c = classify("8.8.8.8");
        assert_eq!(c.kind, "public");
        assert_eq!(c.range_name, None);
        assert!(!c.is_internal);
    }

    #[test]
    fn test_net_1() {
        let c = classify("192.0.2.1");
        assert_eq!(c.kind, "reserved");
        assert_eq!(c.range_name, Some("TEST-NET-1"));
    }

    #[test]
    fn other_well_known_ranges() {
        assert_eq!(classify("127.0.0.1").kind, "loopback");
        assert_eq!(classify("169.254.1.1").kind, "link_local");
        assert_eq!(classify("100.64.0.1").kind, "cgnat");
        assert!(classify("100.64.0.1").is_internal);
        assert_eq!(classify("172.16.0.1").range_name, Some("RFC1918 Class B"));
        assert_eq!(classify("192.168.1.1").range_name, Some("RFC1918 Class C"));
        assert_eq!(classify("224.0.0.1").kind, "multicast");
    }

    #[test]
    fn v4_mapped_v6_unwraps() {
        let c = classify("::ffff:10.1.2.3");
        assert_eq!(c.range_name, Some("RFC1918 Class A"));
    }

    #[test]
    fn v6_ranges() {
        assert_eq!(classify("::1").kind, "loopback");
        assert_eq!(classify("fd00::1").kind, "private");
        assert_eq!(classify("fe80::1").kind, "link_local");
        assert_eq!(classify("2001:db8::1").kind, "reserved");
        assert_eq!(classify("2606:4700::1111").kind, "public");
    }
}
