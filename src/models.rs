//! Flag and segment definitions as delivered by the remote service.
//!
//! Definitions are immutable once constructed. Updates replace a definition wholesale; the
//! repository hands out `Arc`s so readers keep a consistent snapshot while writers swap entries.
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Operator name of the segment-match clause.
pub const SEGMENT_MATCH_OPERATOR: &str = "segmentMatch";

/// A feature flag definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    #[serde(rename = "feature")]
    pub identifier: String,
    pub kind: FlagKind,
    pub state: FlagState,
    #[serde(default)]
    pub variations: Vec<Variation>,
    /// Serving rules. Evaluated in ascending `priority`, regardless of the order received.
    #[serde(default)]
    pub rules: Vec<ServingRule>,
    pub default_serve: Serve,
    pub off_variation: String,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    pub variation_to_target_map: Vec<VariationMap>,
    #[serde(default)]
    pub version: Option<i64>,
}

impl Flag {
    pub fn find_variation(&self, identifier: &str) -> Option<&Variation> {
        self.variations.iter().find(|v| v.identifier == identifier)
    }

    /// Returns `true` if a rule of this flag has a segment-match clause naming `segment`, or a
    /// variation map targets it.
    pub fn references_segment(&self, segment: &str) -> bool {
        let in_rules = self.rules.iter().any(|rule| {
            rule.clauses.iter().any(|clause| {
                clause.op == SEGMENT_MATCH_OPERATOR && clause.values.iter().any(|v| v == segment)
            })
        });
        in_rules
            || self
                .variation_to_target_map
                .iter()
                .any(|map| map.target_segments.iter().any(|s| s == segment))
    }
}

/// Value type of a flag.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagKind {
    #[serde(alias = "bool")]
    #[display(fmt = "boolean")]
    Boolean,
    #[display(fmt = "string")]
    String,
    #[serde(alias = "number")]
    #[display(fmt = "int")]
    Int,
    #[display(fmt = "json")]
    Json,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagState {
    #[display(fmt = "on")]
    On,
    #[display(fmt = "off")]
    Off,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variation {
    pub identifier: String,
    /// Raw value. Interpreted according to the owning flag's [`FlagKind`].
    pub value: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServingRule {
    #[serde(default)]
    pub rule_id: Option<String>,
    pub priority: i32,
    /// AND-combined.
    #[serde(default)]
    pub clauses: Vec<Clause>,
    pub serve: Serve,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clause {
    #[serde(default)]
    pub attribute: String,
    pub op: String,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub negate: bool,
}

/// What a rule (or the default) serves: a fixed variation, or a weighted distribution.
///
/// When both are present, the distribution wins.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Serve {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution: Option<Distribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<String>,
}

impl Serve {
    pub fn variation(identifier: impl Into<String>) -> Serve {
        Serve {
            distribution: None,
            variation: Some(identifier.into()),
        }
    }

    pub fn distribution(distribution: Distribution) -> Serve {
        Serve {
            distribution: Some(distribution),
            variation: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distribution {
    pub bucket_by: String,
    /// Weights are percentages (0-100); they need not sum to exactly 100.
    pub variations: Vec<WeightedVariation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedVariation {
    pub variation: String,
    pub weight: u32,
}

/// A dependency on another flag's served variation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prerequisite {
    pub feature: String,
    /// Variation identifiers of `feature` that satisfy the prerequisite.
    pub variations: Vec<String>,
}

/// Serves `variation` to explicitly listed targets and to members of `target_segments`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariationMap {
    pub variation: String,
    #[serde(default)]
    pub targets: Vec<TargetRef>,
    #[serde(default)]
    pub target_segments: Vec<String>,
}

/// Reference to a target by identifier, as listed in variation maps and segment lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    pub identifier: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl From<&str> for TargetRef {
    fn from(identifier: &str) -> Self {
        TargetRef {
            identifier: identifier.to_owned(),
            name: None,
        }
    }
}

/// A named, reusable group of targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub identifier: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub included: Vec<TargetRef>,
    #[serde(default)]
    pub excluded: Vec<TargetRef>,
    /// Clauses that make a target a member. Any matching clause is enough.
    #[serde(default)]
    pub rules: Vec<Clause>,
    #[serde(default)]
    pub version: Option<i64>,
}

/// Returns `true` if `incoming` must be rejected because the stored version is the same or newer.
///
/// Definitions without a version are always accepted.
pub(crate) fn is_outdated(stored: Option<i64>, incoming: Option<i64>) -> bool {
    match (stored, incoming) {
        (Some(stored), Some(incoming)) => stored >= incoming,
        _ => false,
    }
}
