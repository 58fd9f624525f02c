//! Claim sets decoded from identity-provider tokens.
//!
//! A [`ClaimSet`] is a sum-typed view over a JWT payload. It is rebuilt from
//! a token every time it is needed and never persisted on its own. Accessors
//! for the claims this crate consumes return explicit fallbacks for missing
//! or mistyped values instead of failing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// Claim carrying realm-level role grants (`realm_access.roles`).
pub const REALM_ACCESS_CLAIM: &str = "realm_access";

/// Claim carrying per-client role grants (`resource_access.<client>.roles`).
pub const RESOURCE_ACCESS_CLAIM: &str = "resource_access";

/// Claim injected into login-completion payloads with the caller's realm roles.
pub const REALM_ROLES_CLAIM: &str = "realm_roles";

/// A single claim value.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    List(Vec<ClaimValue>),
    Nested(ClaimSet),
}

impl ClaimValue {
    /// Returns the string payload, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as whole seconds, accepting integer or float encodings.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            _ => None,
        }
    }

    /// Returns the nested claim set, if this is an object.
    #[must_use]
    pub fn as_nested(&self) -> Option<&ClaimSet> {
        match self {
            Self::Nested(set) => Some(set),
            _ => None,
        }
    }

    /// Returns the string members of a list, skipping anything that is not a string.
    #[must_use]
    pub fn as_string_list(&self) -> Option<Vec<String>> {
        match self {
            Self::List(items) => Some(
                items
                    .iter()
                    .filter_map(ClaimValue::as_str)
                    .map(str::to_string)
                    .collect(),
            ),
            _ => None,
        }
    }
}

impl From<Value> for ClaimValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => Self::Nested(ClaimSet::from(map)),
        }
    }
}

impl From<ClaimValue> for Value {
    fn from(value: ClaimValue) -> Self {
        match value {
            ClaimValue::Null => Value::Null,
            ClaimValue::Bool(b) => Value::Bool(b),
            ClaimValue::Number(n) => Value::Number(n),
            ClaimValue::String(s) => Value::String(s),
            ClaimValue::List(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            ClaimValue::Nested(set) => Value::Object(Map::from(set)),
        }
    }
}

impl From<&str> for ClaimValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for ClaimValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<String>> for ClaimValue {
    fn from(items: Vec<String>) -> Self {
        Self::List(items.into_iter().map(Self::String).collect())
    }
}

/// Mapping from claim name to value, as carried by a token payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct ClaimSet {
    claims: BTreeMap<String, ClaimValue>,
}

impl ClaimSet {
    /// Creates an empty claim set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the raw value of a top-level claim.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ClaimValue> {
        self.claims.get(name)
    }

    /// Follows a path of nested object keys, e.g. `["realm_access", "roles"]`.
    #[must_use]
    pub fn get_path(&self, path: &[&str]) -> Option<&ClaimValue> {
        let (last, parents) = path.split_last()?;
        let mut current = self;
        for key in parents {
            current = current.get(key)?.as_nested()?;
        }
        current.get(last)
    }

    /// Inserts or replaces a top-level claim.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ClaimValue>) {
        self.claims.insert(name.into(), value.into());
    }

    /// Returns true if no claims are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Iterates over the claims in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ClaimValue)> {
        self.claims.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns a string claim, treating an empty string as absent.
    #[must_use]
    pub fn non_empty_str(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(ClaimValue::as_str)
            .filter(|s| !s.is_empty())
    }

    /// The stable subject identifier (`sub`).
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.non_empty_str("sub")
    }

    #[must_use]
    pub fn preferred_username(&self) -> Option<&str> {
        self.non_empty_str("preferred_username")
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.non_empty_str("email")
    }

    #[must_use]
    pub fn given_name(&self) -> Option<&str> {
        self.non_empty_str("given_name")
    }

    #[must_use]
    pub fn family_name(&self) -> Option<&str> {
        self.non_empty_str("family_name")
    }

    /// Expiry as epoch seconds (`exp`).
    #[must_use]
    pub fn expires_at(&self) -> Option<i64> {
        self.get("exp").and_then(ClaimValue::as_i64)
    }

    /// Audiences (`aud`), accepting either a single string or a list.
    #[must_use]
    pub fn audiences(&self) -> Vec<String> {
        match self.get("aud") {
            Some(ClaimValue::String(aud)) => vec![aud.clone()],
            Some(value) => value.as_string_list().unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Username with the fixed precedence `preferred_username`, then `email`, then `sub`.
    ///
    /// The same precedence must be used for creating and for looking up local
    /// users, otherwise repeated logins diverge into duplicate accounts.
    #[must_use]
    pub fn resolved_username(&self) -> Option<&str> {
        self.preferred_username()
            .or_else(|| self.email())
            .or_else(|| self.subject())
    }

    /// Realm roles from `realm_access.roles`; empty when any step is missing.
    #[must_use]
    pub fn realm_roles(&self) -> Vec<String> {
        self.get_path(&[REALM_ACCESS_CLAIM, "roles"])
            .and_then(ClaimValue::as_string_list)
            .unwrap_or_default()
    }

    /// Client roles from `resource_access.<client>.roles`; empty when any step is missing.
    #[must_use]
    pub fn resource_roles(&self, client: &str) -> Vec<String> {
        self.get_path(&[RESOURCE_ACCESS_CLAIM, client, "roles"])
            .and_then(ClaimValue::as_string_list)
            .unwrap_or_default()
    }

    /// A top-level list of strings.
    ///
    /// Returns `None` when the claim is absent or not a list, so callers can
    /// tell "no list" apart from "an empty list".
    #[must_use]
    pub fn string_list(&self, name: &str) -> Option<Vec<String>> {
        self.get(name).and_then(ClaimValue::as_string_list)
    }
}

impl From<Map<String, Value>> for ClaimSet {
    fn from(map: Map<String, Value>) -> Self {
        Self {
            claims: map
                .into_iter()
                .map(|(k, v)| (k, ClaimValue::from(v)))
                .collect(),
        }
    }
}

impl From<ClaimSet> for Map<String, Value> {
    fn from(set: ClaimSet) -> Self {
        set.claims
            .into_iter()
            .map(|(k, v)| (k, Value::from(v)))
            .collect()
    }
}

impl FromIterator<(String, ClaimValue)> for ClaimSet {
    fn from_iter<I: IntoIterator<Item = (String, ClaimValue)>>(iter: I) -> Self {
        Self {
            claims: iter.into_iter().collect(),
        }
    }
}
