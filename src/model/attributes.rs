//! Storage Attributes
//!
//! Pools advertise what they can do as a map of attribute offers; storage
//! classes ask for capabilities as a map of attribute requests. A request
//! matches an offer of the same value kind.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Well-known Attribute Names
// =============================================================================

pub const MEDIA: &str = "media";
pub const IOPS: &str = "IOPS";
pub const SNAPSHOTS: &str = "snapshots";
pub const CLONES: &str = "clones";
pub const ENCRYPTION: &str = "encryption";
pub const REPLICATION: &str = "replication";
pub const PROVISIONING_TYPE: &str = "provisioningType";
pub const BACKEND_TYPE: &str = "backendType";
pub const REGION: &str = "region";
pub const ZONE: &str = "zone";
pub const LABELS: &str = "labels";
/// Storage classes spell the labels request as a selector
pub const SELECTOR: &str = "selector";

/// Value kind of a well-known attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    Bool,
    Int,
    String,
    Labels,
}

/// Look up the value kind of a request key
pub fn attribute_kind(name: &str) -> Option<AttributeKind> {
    match name {
        IOPS => Some(AttributeKind::Int),
        SNAPSHOTS | CLONES | ENCRYPTION | REPLICATION => Some(AttributeKind::Bool),
        MEDIA | PROVISIONING_TYPE | BACKEND_TYPE | REGION | ZONE => Some(AttributeKind::String),
        LABELS | SELECTOR => Some(AttributeKind::Labels),
        _ => None,
    }
}

// =============================================================================
// Offers
// =============================================================================

/// A capability advertised by a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Offer {
    Bool { value: bool },
    Int { min: i64, max: i64 },
    String { values: BTreeSet<String> },
    Labels { labels: BTreeMap<String, String> },
}

impl Offer {
    pub fn bool(value: bool) -> Self {
        Offer::Bool { value }
    }

    pub fn int(min: i64, max: i64) -> Self {
        Offer::Int { min, max }
    }

    pub fn string<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Offer::String {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn labels<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Offer::Labels {
            labels: labels.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

/// A capability requested by a storage class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    Bool { value: bool },
    Int { value: i64 },
    String { value: String },
    Labels { selector: BTreeMap<String, String> },
}

impl Request {
    /// Parse a raw storage class parameter into a typed request
    pub fn parse(name: &str, raw: &str) -> Result<Self> {
        let kind = attribute_kind(name).ok_or_else(|| {
            Error::InvalidArgument(format!("unknown storage attribute {}", name))
        })?;
        let raw = raw.trim();

        match kind {
            AttributeKind::Bool => raw
                .parse::<bool>()
                .map(|value| Request::Bool { value })
                .map_err(|_| {
                    Error::InvalidArgument(format!("attribute {} expects a boolean, got {}", name, raw))
                }),
            AttributeKind::Int => raw
                .parse::<i64>()
                .map(|value| Request::Int { value })
                .map_err(|_| {
                    Error::InvalidArgument(format!("attribute {} expects an integer, got {}", name, raw))
                }),
            AttributeKind::String => {
                if raw.is_empty() {
                    return Err(Error::InvalidArgument(format!(
                        "attribute {} expects a non-empty string",
                        name
                    )));
                }
                Ok(Request::String {
                    value: raw.to_string(),
                })
            }
            AttributeKind::Labels => parse_selector(raw).map(|selector| Request::Labels { selector }),
        }
    }

    /// Check this request against a pool offer
    pub fn matches(&self, offer: &Offer) -> bool {
        match (self, offer) {
            (Request::Bool { value }, Offer::Bool { value: offered }) => value == offered,
            (Request::Int { value }, Offer::Int { min, max }) => min <= value && value <= max,
            (Request::String { value }, Offer::String { values }) => values.contains(value),
            (Request::Labels { selector }, Offer::Labels { labels }) => selector
                .iter()
                .all(|(key, value)| labels.get(key) == Some(value)),
            _ => false,
        }
    }
}

/// Parse a `key=value; key2=value2` label selector
fn parse_selector(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut selector = BTreeMap::new();
    for term in raw.split(';').map(str::trim).filter(|t| !t.is_empty()) {
        let (key, value) = term.split_once('=').ok_or_else(|| {
            Error::InvalidArgument(format!("label selector term {} is not key=value", term))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "label selector term {} has an empty key",
                term
            )));
        }
        selector.insert(key.to_string(), value.trim().to_string());
    }
    Ok(selector)
}

/// Parse a full map of raw storage class parameters
pub fn parse_requests(raw: &BTreeMap<String, String>) -> Result<BTreeMap<String, Request>> {
    let mut requests = BTreeMap::new();
    for (name, value) in raw {
        // The selector is offered under the labels key
        let key = if name == SELECTOR { LABELS } else { name.as_str() };
        requests.insert(key.to_string(), Request::parse(name, value)?);
    }
    Ok(requests)
}

/// A pool matches iff every request matches the offer under the same name
pub fn matches_all(requests: &BTreeMap<String, Request>, offers: &BTreeMap<String, Offer>) -> bool {
    requests.iter().all(|(name, request)| {
        offers
            .get(name)
            .map(|offer| request.matches(offer))
            .unwrap_or(false)
    })
}
