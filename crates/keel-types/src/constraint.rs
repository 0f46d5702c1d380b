//! Placement constraints
//!
//! Constraints are data: a key, an operator and a value, evaluated against
//! host attributes by one generic matcher. Nothing in the engine hardcodes
//! hostnames or roles.

use crate::Host;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Comparison operator of a constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintOp {
    /// Attribute must equal the value
    Eq,
    /// Attribute must differ from the value (a missing attribute differs)
    Ne,
}

/// Predicate over host attributes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlacementConstraint {
    pub key: String,
    pub op: ConstraintOp,
    pub value: String,
}

impl PlacementConstraint {
    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: ConstraintOp::Eq,
            value: value.into(),
        }
    }

    pub fn ne(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: ConstraintOp::Ne,
            value: value.into(),
        }
    }

    /// Pin to an exact hostname
    pub fn hostname(hostname: impl Into<String>) -> Self {
        Self::eq("node.hostname", hostname)
    }

    /// Evaluate the constraint against a host
    pub fn matches(&self, host: &Host) -> bool {
        let actual = host.attribute(&self.key);
        match self.op {
            ConstraintOp::Eq => actual == Some(self.value.as_str()),
            ConstraintOp::Ne => actual != Some(self.value.as_str()),
        }
    }

    /// The hostname this constraint pins to, if it is an exact-hostname match
    pub fn pinned_hostname(&self) -> Option<&str> {
        match (self.key.as_str(), self.op) {
            ("node.hostname" | "hostname", ConstraintOp::Eq) => Some(self.value.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for PlacementConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            ConstraintOp::Eq => "==",
            ConstraintOp::Ne => "!=",
        };
        write!(f, "{} {} {}", self.key, op, self.value)
    }
}

impl FromStr for PlacementConstraint {
    type Err = String;

    /// Parse `key == value` or `key != value`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, op, value) = if let Some((k, v)) = s.split_once("==") {
            (k, ConstraintOp::Eq, v)
        } else if let Some((k, v)) = s.split_once("!=") {
            (k, ConstraintOp::Ne, v)
        } else {
            return Err(format!("constraint '{}' has no == or != operator", s));
        };

        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            return Err(format!("constraint '{}' is missing a key or value", s));
        }

        Ok(Self {
            key: key.to_string(),
            op,
            value: value.to_string(),
        })
    }
}
