use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Property bag evaluated against override conditions. Values are JSON
/// scalars; a per-call context is shallow-merged over the client context.
pub type Context = BTreeMap<String, Value>;

/// One named configuration entry: a base value plus the ordered overrides
/// that may replace it for a matching evaluation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub name: String,
    pub value: Value,
    #[serde(default)]
    pub overrides: Vec<Override>,
}

/// A conditional alternative value. All conditions must match for the
/// override to apply; `name` is diagnostic only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Override {
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub value: Value,
}

/// A node of an override's predicate tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Equals {
        property: String,
        value: Value,
    },
    In {
        property: String,
        value: Value,
    },
    NotIn {
        property: String,
        value: Value,
    },
    LessThan {
        property: String,
        value: Value,
    },
    LessThanOrEqual {
        property: String,
        value: Value,
    },
    GreaterThan {
        property: String,
        value: Value,
    },
    GreaterThanOrEqual {
        property: String,
        value: Value,
    },
    /// Deterministic percentage bucketing of a context property.
    /// `0 <= from <= to <= 100`; an empty range never matches.
    #[serde(rename_all = "camelCase")]
    Segmentation {
        property: String,
        from_percentage: f64,
        to_percentage: f64,
        seed: String,
    },
    And {
        conditions: Vec<Condition>,
    },
    Or {
        conditions: Vec<Condition>,
    },
    Not {
        condition: Box<Condition>,
    },
}

/// A serializable image of the store, suitable for server-side prefetch and
/// client-side hydration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub configs: Vec<Config>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
}

impl Snapshot {
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> crate::Result<Snapshot> {
        Ok(serde_json::from_str(text)?)
    }
}

/// A parsed payload of one replication data frame. Tags this client does
/// not recognize decode to `Unknown` and are skipped, so that servers can
/// introduce new event types without breaking deployed SDKs.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Init { configs: Vec<Config> },
    ConfigChange { config: Config },
    #[serde(other)]
    Unknown,
}

/// Request body sent on every (re)connection. It describes the client's
/// currently-known state so the server can choose between a full `init`
/// and incremental changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayBody {
    pub current_configs: Vec<Config>,
    pub required_configs: Vec<String>,
}
