use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Arbitrary attribute values supplied by the caller.
pub type Attributes = HashMap<String, serde_json::Value>;

/// The evaluation context a flag is evaluated for (e.g., a user or a device).
///
/// Targets are supplied per call and never modified by the client.
///
/// ```
/// # use ff_client::Target;
/// let target = Target::builder("user-42")
///     .name("Alice")
///     .attribute("plan", "enterprise")
///     .build();
/// assert_eq!(target.identifier, "user-42");
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub attributes: Attributes,
    /// Private targets are evaluated normally but never reported to analytics.
    #[serde(default)]
    pub is_private: bool,
    /// Attributes that must not be included in analytics target metadata.
    #[serde(default)]
    pub private_attributes: HashSet<String>,
}

impl Target {
    pub fn new(identifier: impl Into<String>) -> Target {
        Target {
            identifier: identifier.into(),
            ..Default::default()
        }
    }

    pub fn builder(identifier: impl Into<String>) -> TargetBuilder {
        TargetBuilder {
            target: Target::new(identifier),
        }
    }

    /// Returns `false` if the target has no identifier.
    pub fn is_valid(&self) -> bool {
        !self.identifier.is_empty()
    }

    /// Look up an attribute by name.
    ///
    /// Built-in fields (`identifier`, `name`) take precedence over the attribute map. Returns
    /// `None` if the attribute is unknown or null.
    pub fn get_attribute(&self, attribute: &str) -> Option<String> {
        match attribute {
            "identifier" => Some(self.identifier.clone()),
            "name" => Some(self.name.clone()),
            _ => self.attributes.get(attribute).and_then(attribute_to_string),
        }
    }
}

/// Render an attribute value the way clauses compare it: strings verbatim, everything else as
/// its JSON text.
pub(crate) fn attribute_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Builder for [`Target`].
#[derive(Debug, Clone)]
pub struct TargetBuilder {
    target: Target,
}

impl TargetBuilder {
    pub fn name(mut self, name: impl Into<String>) -> TargetBuilder {
        self.target.name = name.into();
        self
    }

    pub fn attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> TargetBuilder {
        self.target.attributes.insert(key.into(), value.into());
        self
    }

    pub fn private(mut self, is_private: bool) -> TargetBuilder {
        self.target.is_private = is_private;
        self
    }

    pub fn private_attribute(mut self, key: impl Into<String>) -> TargetBuilder {
        self.target.private_attributes.insert(key.into());
        self
    }

    pub fn build(self) -> Target {
        self.target
    }
}

#[cfg(test)]
mod tests {
    use super::Target;

    #[test]
    fn builtin_fields_take_precedence() {
        let target = Target::builder("alice")
            .name("Alice")
            .attribute("identifier", "shadowed")
            .attribute("email", "alice@example.com")
            .build();

        assert_eq!(target.get_attribute("identifier").as_deref(), Some("alice"));
        assert_eq!(target.get_attribute("name").as_deref(), Some("Alice"));
        assert_eq!(
            target.get_attribute("email").as_deref(),
            Some("alice@example.com")
        );
    }

    #[test]
    fn non_string_attributes_are_stringified() {
        let target = Target::builder("bob")
            .attribute("age", 42)
            .attribute("beta", true)
            .attribute("nothing", serde_json::Value::Null)
            .build();

        assert_eq!(target.get_attribute("age").as_deref(), Some("42"));
        assert_eq!(target.get_attribute("beta").as_deref(), Some("true"));
        assert_eq!(target.get_attribute("nothing"), None);
        assert_eq!(target.get_attribute("missing"), None);
    }

    #[test]
    fn empty_identifier_is_invalid() {
        assert!(!Target::new("").is_valid());
        assert!(Target::new("x").is_valid());
    }
}
