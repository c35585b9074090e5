//! Region Resolver
//!
//! Maps a client address to a region by checking ordered CIDR tables; the
//! first matching range wins. Anything unmatched or unparseable resolves to the
//! default region, so routing never fails.

use crate::core::error::{CacheError, Result};
use crate::core::types::Region;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::debug;

/// Address ranges belonging to one region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoRangeConfig {
    pub region: Region,
    /// CIDR blocks (`203.0.113.0/24`, `2001:db8::/32`) or single addresses
    pub cidrs: Vec<String>,
}

/// Inclusive address range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IpRange<T> {
    start: T,
    end: T,
    region: Region,
}

#[derive(Debug, Clone)]
pub struct RegionResolver {
    v4: Vec<IpRange<u32>>,
    v6: Vec<IpRange<u128>>,
    default_region: Region,
}

impl RegionResolver {
    /// Build the range tables, keeping configuration order
    pub fn new(ranges: &[GeoRangeConfig], default_region: Region) -> Result<Self> {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();

        for group in ranges {
            for cidr in &group.cidrs {
                match parse_cidr(cidr)? {
                    Cidr::V4(start, end) => v4.push(IpRange {
                        start,
                        end,
                        region: group.region,
                    }),
                    Cidr::V6(start, end) => v6.push(IpRange {
                        start,
                        end,
                        region: group.region,
                    }),
                }
            }
        }

        Ok(Self {
            v4,
            v6,
            default_region,
        })
    }

    /// Resolver with no ranges: everything maps to `default_region`
    pub fn with_default(default_region: Region) -> Self {
        Self {
            v4: Vec::new(),
            v6: Vec::new(),
            default_region,
        }
    }

    pub fn default_region(&self) -> Region {
        self.default_region
    }

    /// Resolve a textual address; malformed input yields the default region
    pub fn resolve(&self, ip_address: &str) -> Region {
        match ip_address.trim().parse::<IpAddr>() {
            Ok(addr) => self.resolve_addr(addr),
            Err(_) => {
                debug!(
                    "Unparseable client address '{}', using {}",
                    ip_address, self.default_region
                );
                self.default_region
            }
        }
    }

    pub fn resolve_addr(&self, addr: IpAddr) -> Region {
        let found = match addr {
            IpAddr::V4(v4) => lookup(&self.v4, u32::from(v4)),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => lookup(&self.v4, u32::from(v4)),
                None => lookup(&self.v6, u128::from(v6)),
            },
        };
        found.unwrap_or(self.default_region)
    }
}

fn lookup<T: PartialOrd + Copy>(table: &[IpRange<T>], addr: T) -> Option<Region> {
    table
        .iter()
        .find(|range| range.start <= addr && addr <= range.end)
        .map(|range| range.region)
}

enum Cidr {
    V4(u32, u32),
    V6(u128, u128),
}

fn parse_cidr(text: &str) -> Result<Cidr> {
    let invalid = || CacheError::Configuration(format!("invalid CIDR '{}'", text));

    let (addr, prefix) = match text.trim().split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix.parse::<u32>().map_err(|_| invalid())?)),
        None => (text.trim(), None),
    };

    match addr.parse::<IpAddr>().map_err(|_| invalid())? {
        IpAddr::V4(ip) => {
            let prefix = prefix.unwrap_or(32);
            if prefix > 32 {
                return Err(invalid());
            }
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            let start = u32::from(ip) & mask;
            Ok(Cidr::V4(start, start | !mask))
        }
        IpAddr::V6(ip) => {
            let prefix = prefix.unwrap_or(128);
            if prefix > 128 {
                return Err(invalid());
            }
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
            let start = u128::from(ip) & mask;
            Ok(Cidr::V6(start, start | !mask))
        }
    }
}

/// Built-in range tables.
///
/// Coarse registry allocations, ordered so the narrower national blocks are
/// matched before the continental ones that contain them.
pub fn default_geo_ranges() -> Vec<GeoRangeConfig> {
    let group = |region, cidrs: &[&str]| GeoRangeConfig {
        region,
        cidrs: cidrs.iter().map(|c| c.to_string()).collect(),
    };

    vec![
        group(
            Region::China,
            &[
                "1.80.0.0/12",
                "14.16.0.0/12",
                "36.96.0.0/11",
                "58.16.0.0/13",
                "60.0.0.0/11",
                "111.0.0.0/10",
                "2408::/16",
                "240e::/20",
            ],
        ),
        group(
            Region::MiddleEast,
            &["5.36.0.0/14", "37.224.0.0/11", "94.96.0.0/13", "2a0e:97c0::/29"],
        ),
        group(
            Region::AsiaPacific,
            &[
                "1.0.0.0/8",
                "14.0.0.0/8",
                "27.0.0.0/8",
                "43.0.0.0/8",
                "49.0.0.0/8",
                "101.0.0.0/8",
                "103.0.0.0/8",
                "2400::/12",
            ],
        ),
        group(
            Region::Europe,
            &[
                "2.0.0.0/8",
                "5.0.0.0/8",
                "31.0.0.0/8",
                "37.0.0.0/8",
                "46.0.0.0/8",
                "62.0.0.0/8",
                "77.0.0.0/8",
                "2a00::/12",
            ],
        ),
        group(
            Region::Africa,
            &[
                "41.0.0.0/8",
                "102.0.0.0/8",
                "105.0.0.0/8",
                "196.0.0.0/8",
                "197.0.0.0/8",
                "2c00::/12",
            ],
        ),
        group(
            Region::Americas,
            &[
                "3.0.0.0/8",
                "4.0.0.0/8",
                "8.0.0.0/8",
                "23.0.0.0/8",
                "24.0.0.0/8",
                "63.0.0.0/8",
                "64.0.0.0/8",
                "96.0.0.0/6",
                "177.0.0.0/8",
                "179.0.0.0/8",
                "186.0.0.0/7",
                "189.0.0.0/8",
                "190.0.0.0/8",
                "2600::/12",
                "2800::/12",
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn ipv4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    fn ipv6(segments: [u16; 8]) -> IpAddr {
        IpAddr::V6(Ipv6Addr::from(segments))
    }

    fn resolver() -> RegionResolver {
        RegionResolver::new(&default_geo_ranges(), Region::Americas).unwrap()
    }

    #[test]
    fn test_resolve_default_tables() {
        let resolver = resolver();

        assert_eq!(resolver.resolve("1.1.1.1"), Region::AsiaPacific);
        assert_eq!(resolver.resolve("1.88.0.1"), Region::China);
        assert_eq!(resolver.resolve("5.37.1.1"), Region::MiddleEast);
        assert_eq!(resolver.resolve("5.1.1.1"), Region::Europe);
        assert_eq!(resolver.resolve("41.10.20.30"), Region::Africa);
        assert_eq!(resolver.resolve("8.8.8.8"), Region::Americas);
        assert_eq!(resolver.resolve("2a00:1450::1"), Region::Europe);
    }

    #[test]
    fn test_first_match_wins() {
        let ranges = vec![
            GeoRangeConfig {
                region: Region::Europe,
                cidrs: vec!["10.1.0.0/16".to_string()],
            },
            GeoRangeConfig {
                region: Region::Africa,
                cidrs: vec!["10.0.0.0/8".to_string()],
            },
        ];
        let resolver = RegionResolver::new(&ranges, Region::Americas).unwrap();

        assert_eq!(resolver.resolve("10.1.2.3"), Region::Europe);
        assert_eq!(resolver.resolve("10.2.2.3"), Region::Africa);
    }

    #[test]
    fn test_fallback_to_default() {
        let resolver = resolver();

        assert_eq!(resolver.resolve("not-an-ip"), Region::Americas);
        assert_eq!(resolver.resolve(""), Region::Americas);
        assert_eq!(resolver.resolve("300.1.1.1"), Region::Americas);
        // Private space is in no table
        assert_eq!(resolver.resolve("192.168.1.1"), Region::Americas);
    }

    #[test]
    fn test_ipv4_mapped_ipv6_uses_v4_table() {
        let resolver = resolver();
        assert_eq!(resolver.resolve("::ffff:41.1.2.3"), Region::Africa);
        assert_eq!(
            resolver.resolve_addr(ipv6([0, 0, 0, 0, 0, 0xffff, 0x0808, 0x0808])),
            Region::Americas
        );
    }

    #[test]
    fn test_cidr_boundaries() {
        let ranges = vec![GeoRangeConfig {
            region: Region::Europe,
            cidrs: vec!["203.0.113.0/24".to_string(), "198.51.100.7".to_string()],
        }];
        let resolver = RegionResolver::new(&ranges, Region::Africa).unwrap();

        assert_eq!(resolver.resolve_addr(ipv4(203, 0, 113, 0)), Region::Europe);
        assert_eq!(resolver.resolve_addr(ipv4(203, 0, 113, 255)), Region::Europe);
        assert_eq!(resolver.resolve_addr(ipv4(203, 0, 114, 0)), Region::Africa);
        assert_eq!(resolver.resolve_addr(ipv4(198, 51, 100, 7)), Region::Europe);
        assert_eq!(resolver.resolve_addr(ipv4(198, 51, 100, 8)), Region::Africa);
    }

    #[test]
    fn test_malformed_cidr_is_configuration_error() {
        for bad in ["10.0.0.0/33", "10.0.0/8", "2001:db8::/129", "abc/8", "10.0.0.0/x"] {
            let ranges = vec![GeoRangeConfig {
                region: Region::Europe,
                cidrs: vec![bad.to_string()],
            }];
            assert!(
                matches!(
                    RegionResolver::new(&ranges, Region::Americas),
                    Err(CacheError::Configuration(_))
                ),
                "{} should be rejected",
                bad
            );
        }
    }
}
