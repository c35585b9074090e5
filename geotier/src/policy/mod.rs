//! Policy Store
//!
//! Named cache policies keyed by content type: which levels an entry is
//! written to, per-level TTL and size ceilings, payload transforms and
//! geo-restrictions. Loaded once at startup and replaced only as a whole.

use crate::config::{CacheConfig, ConfigSource};
use crate::core::error::{CacheError, Result};
use crate::core::types::{CacheLevel, Region};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use tracing::{error, info};

/// Locality rule a target region must satisfy before a policy allows caching there
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum GeoRestriction {
    /// The client address must resolve to the requested region
    SameCountry,
    /// Never cache in this region
    Deny(Region),
    /// Cache only in regions named by `only:` tags
    Only(Region),
}

impl fmt::Display for GeoRestriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SameCountry => f.write_str("same_country"),
            Self::Deny(region) => write!(f, "deny:{}", region),
            Self::Only(region) => write!(f, "only:{}", region),
        }
    }
}

impl FromStr for GeoRestriction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let tag = s.trim();
        if tag.eq_ignore_ascii_case("same_country") || tag.eq_ignore_ascii_case("same_region") {
            return Ok(Self::SameCountry);
        }
        match tag.split_once(':') {
            Some(("deny", region)) => Ok(Self::Deny(region.parse()?)),
            Some(("only", region)) => Ok(Self::Only(region.parse()?)),
            _ => Err(format!("unknown geo-restriction '{}'", tag)),
        }
    }
}

impl TryFrom<String> for GeoRestriction {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<GeoRestriction> for String {
    fn from(value: GeoRestriction) -> Self {
        value.to_string()
    }
}

/// Caching rules for one content type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachePolicy {
    #[serde(default)]
    pub policy_id: String,
    pub name: String,
    pub content_type: String,
    /// Levels written on `set`, in write order
    pub cache_levels: Vec<CacheLevel>,
    /// Level → TTL in seconds
    pub ttl: HashMap<CacheLevel, u64>,
    /// Level → maximum entry size in megabytes
    pub max_size: HashMap<CacheLevel, u64>,
    #[serde(default)]
    pub compression_enabled: bool,
    #[serde(default)]
    pub encryption_enabled: bool,
    #[serde(default)]
    pub geo_restrictions: Vec<GeoRestriction>,
    #[serde(default)]
    pub vary_headers: Vec<String>,
}

impl CachePolicy {
    /// Check the level cross-references
    pub fn validate(&self) -> Result<()> {
        let invalid =
            |reason: String| CacheError::Configuration(format!("policy '{}': {}", self.policy_id, reason));

        if self.policy_id.is_empty() {
            return Err(invalid("policy_id must not be empty".to_string()));
        }
        if self.cache_levels.is_empty() {
            return Err(invalid("cache_levels must not be empty".to_string()));
        }

        for (i, level) in self.cache_levels.iter().enumerate() {
            if self.cache_levels[..i].contains(level) {
                return Err(invalid(format!("level {} listed twice", level)));
            }
            match self.ttl.get(level) {
                None => return Err(invalid(format!("no ttl for level {}", level))),
                Some(0) => return Err(invalid(format!("ttl for level {} must be positive", level))),
                Some(_) => {}
            }
            match self.max_size.get(level) {
                None => return Err(invalid(format!("no max_size for level {}", level))),
                Some(0) => {
                    return Err(invalid(format!("max_size for level {} must be positive", level)));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    /// TTL for a level, if the policy writes to it
    pub fn ttl_secs(&self, level: CacheLevel) -> Option<u64> {
        self.ttl.get(&level).copied()
    }

    /// Size ceiling for a level in bytes
    pub fn max_size_bytes(&self, level: CacheLevel) -> Option<usize> {
        self.max_size
            .get(&level)
            .map(|mb| (*mb as usize).saturating_mul(1024 * 1024))
    }

    /// Check the geo-restrictions for a write.
    ///
    /// `requested` is the region the caller asked for, `client` the region its
    /// address resolved to (if an address was supplied). Returns the first
    /// restriction that is not satisfied.
    pub fn check_geo(&self, requested: Region, client: Option<Region>) -> Option<GeoRestriction> {
        let target = client.unwrap_or(requested);

        let mut allow_list = self
            .geo_restrictions
            .iter()
            .filter_map(|r| match r {
                GeoRestriction::Only(region) => Some(*region),
                _ => None,
            })
            .peekable();
        if allow_list.peek().is_some() && !allow_list.any(|region| region == target) {
            return self
                .geo_restrictions
                .iter()
                .find(|r| matches!(r, GeoRestriction::Only(_)))
                .copied();
        }

        self.geo_restrictions
            .iter()
            .find(|restriction| match restriction {
                GeoRestriction::SameCountry => client != Some(requested),
                GeoRestriction::Deny(region) => *region == target,
                GeoRestriction::Only(_) => false,
            })
            .copied()
    }
}

/// Read-only registry of validated policies
#[derive(Debug, Clone, Default)]
pub struct PolicyStore {
    policies: BTreeMap<String, CachePolicy>,
}

impl PolicyStore {
    /// Load policies from a configuration source, rejecting any invalid definition.
    ///
    /// A file source that does not exist yet is created with the defaults.
    pub fn load(source: &ConfigSource) -> Result<Self> {
        let config = CacheConfig::from_source(source)?;
        Self::from_policies(config.policies)
    }

    /// Like [`PolicyStore::load`], but an invalid policy only rejects itself
    pub fn load_partial(source: &ConfigSource) -> Result<(Self, Vec<String>)> {
        let config = CacheConfig::from_source(source)?;
        Ok(Self::from_policies_partial(config.policies))
    }

    /// Build a store from definitions keyed by policy id
    pub fn from_policies(definitions: BTreeMap<String, CachePolicy>) -> Result<Self> {
        let mut policies = BTreeMap::new();
        for (id, policy) in definitions {
            let policy = normalize(id.clone(), policy)?;
            policies.insert(id, policy);
        }

        info!("Loaded {} cache policies", policies.len());
        Ok(Self { policies })
    }

    /// Build a store keeping only the valid definitions; returns the rejected ids
    pub fn from_policies_partial(definitions: BTreeMap<String, CachePolicy>) -> (Self, Vec<String>) {
        let mut policies = BTreeMap::new();
        let mut rejected = Vec::new();

        for (id, policy) in definitions {
            match normalize(id.clone(), policy) {
                Ok(policy) => {
                    policies.insert(id, policy);
                }
                Err(e) => {
                    error!("Skipping cache policy '{}': {}", id, e);
                    rejected.push(id);
                }
            }
        }

        info!(
            "Loaded {} cache policies ({} rejected)",
            policies.len(),
            rejected.len()
        );
        (Self { policies }, rejected)
    }

    /// Get a policy by id
    pub fn get(&self, policy_id: &str) -> Result<&CachePolicy> {
        self.policies
            .get(policy_id)
            .ok_or_else(|| CacheError::PolicyNotFound(policy_id.to_string()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

fn normalize(id: String, mut policy: CachePolicy) -> Result<CachePolicy> {
    if policy.policy_id.is_empty() {
        policy.policy_id = id.clone();
    } else if policy.policy_id != id {
        return Err(CacheError::Configuration(format!(
            "policy '{}' declares mismatched policy_id '{}'",
            id, policy.policy_id
        )));
    }
    policy.validate()?;
    Ok(policy)
}

/// Built-in policy definitions
pub fn default_policies() -> BTreeMap<String, CachePolicy> {
    use CacheLevel::{Edge, Global, Regional};

    let policy = |id: &str,
                  name: &str,
                  content_type: &str,
                  levels: &[(CacheLevel, u64, u64)],
                  compression_enabled: bool,
                  encryption_enabled: bool,
                  geo_restrictions: Vec<GeoRestriction>,
                  vary_headers: &[&str]| {
        CachePolicy {
            policy_id: id.to_string(),
            name: name.to_string(),
            content_type: content_type.to_string(),
            cache_levels: levels.iter().map(|(level, _, _)| *level).collect(),
            ttl: levels.iter().map(|(level, ttl, _)| (*level, *ttl)).collect(),
            max_size: levels.iter().map(|(level, _, size)| (*level, *size)).collect(),
            compression_enabled,
            encryption_enabled,
            geo_restrictions,
            vary_headers: vary_headers.iter().map(|h| h.to_string()).collect(),
        }
    };

    [
        policy(
            "api_responses",
            "API Responses",
            "application/json",
            &[(Edge, 300, 10), (Regional, 900, 50)],
            true,
            false,
            vec![],
            &["accept-language"],
        ),
        policy(
            "user_data",
            "User Data",
            "application/json",
            &[(Regional, 1800, 20), (Global, 3600, 100)],
            false,
            true,
            vec![GeoRestriction::SameCountry],
            &[],
        ),
        policy(
            "static_content",
            "Static Content",
            "application/octet-stream",
            &[(Edge, 3600, 100), (Regional, 7200, 500), (Global, 86_400, 1000)],
            true,
            false,
            vec![],
            &["accept-encoding"],
        ),
        policy(
            "analytics",
            "Analytics Aggregates",
            "application/json",
            &[(Regional, 600, 50), (Global, 1800, 200)],
            true,
            false,
            vec![GeoRestriction::Deny(Region::China)],
            &[],
        ),
    ]
    .into_iter()
    .map(|policy| (policy.policy_id.clone(), policy))
    .collect()
}
