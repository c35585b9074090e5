use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Geographic deployment of a regional cache backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    AsiaPacific,
    Europe,
    Americas,
    China,
    MiddleEast,
    Africa,
}

impl Region {
    /// Every region, in declaration order
    pub const ALL: [Region; 6] = [
        Region::AsiaPacific,
        Region::Europe,
        Region::Americas,
        Region::China,
        Region::MiddleEast,
        Region::Africa,
    ];

    /// Stable string form used in configuration, storage payloads and metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AsiaPacific => "asia_pacific",
            Self::Europe => "europe",
            Self::Americas => "americas",
            Self::China => "china",
            Self::MiddleEast => "middle_east",
            Self::Africa => "africa",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Region::ALL
            .into_iter()
            .find(|region| region.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown region '{}'", s))
    }
}

/// Cache tier, ordered by increasing latency and capacity.
///
/// The derived ordering is the lookup precedence: edge first, global last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheLevel {
    #[serde(rename = "l1_edge")]
    Edge,
    #[serde(rename = "l2_regional")]
    Regional,
    #[serde(rename = "l3_global")]
    Global,
}

impl CacheLevel {
    /// Every level in lookup order
    pub const ALL: [CacheLevel; 3] = [CacheLevel::Edge, CacheLevel::Regional, CacheLevel::Global];

    /// Storage-key prefix for this level
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Edge => "l1_edge",
            Self::Regional => "l2_regional",
            Self::Global => "l3_global",
        }
    }

    /// Physical key under which a logical key is stored at this level
    pub fn storage_key(&self, logical_key: &str) -> String {
        format!("{}:{}", self.as_str(), logical_key)
    }

    /// Strip this level's prefix from a physical key
    pub fn logical_key<'a>(&self, storage_key: &'a str) -> Option<&'a str> {
        storage_key
            .strip_prefix(self.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
    }
}

impl fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "l1_edge" | "edge" => Ok(Self::Edge),
            "l2_regional" | "regional" => Ok(Self::Regional),
            "l3_global" | "global" => Ok(Self::Global),
            other => Err(format!("unknown cache level '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_order_matches_lookup_precedence() {
        let mut levels = vec![CacheLevel::Global, CacheLevel::Edge, CacheLevel::Regional];
        levels.sort();
        assert_eq!(levels, CacheLevel::ALL.to_vec());
    }

    #[test]
    fn test_storage_key_format() {
        assert_eq!(
            CacheLevel::Edge.storage_key("user:42:profile"),
            "l1_edge:user:42:profile"
        );
        assert_eq!(
            CacheLevel::Regional.logical_key("l2_regional:user:42"),
            Some("user:42")
        );
        assert_eq!(CacheLevel::Regional.logical_key("l1_edge:user:42"), None);
    }

    #[test]
    fn test_serde_strings_match_as_str() {
        for level in CacheLevel::ALL {
            let json = serde_json::to_string(&level).unwrap();
            assert_eq!(json, format!("\"{}\"", level.as_str()));
        }
        for region in Region::ALL {
            let json = serde_json::to_string(&region).unwrap();
            assert_eq!(json, format!("\"{}\"", region.as_str()));
            assert_eq!(region.as_str().parse::<Region>().unwrap(), region);
        }
    }

    #[test]
    fn test_unknown_names_rejected() {
        assert!("antarctica".parse::<Region>().is_err());
        assert!("l4_orbit".parse::<CacheLevel>().is_err());
        assert_eq!("EDGE".parse::<CacheLevel>().unwrap(), CacheLevel::Edge);
    }
}
