//! Step identifier type
//!
//! Step ids are the strings steps declare in their configuration and in
//! `depends_on` lists. Wrapping them keeps graph APIs from accepting arbitrary
//! strings (type names, keys) by accident.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Unique identifier for a step within one run.
///
/// ```
/// use integrator::graph::StepId;
///
/// let step = StepId::new("fetch-users");
/// assert_eq!(step.as_str(), "fetch-users");
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StepId({})", self.0)
    }
}

impl Borrow<str> for StepId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for StepId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&String> for StepId {
    fn from(s: &String) -> Self {
        Self(s.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_step_id_display() {
        let step = StepId::new("fetch-users");
        assert_eq!(format!("{}", step), "fetch-users");
        assert_eq!(format!("{:?}", step), "StepId(fetch-users)");
    }

    #[test]
    fn test_step_id_borrow_lookup() {
        let mut map = HashMap::new();
        map.insert(StepId::new("a"), 1);

        assert_eq!(map.get("a"), Some(&1));
    }

    #[test]
    fn test_step_id_serializes_as_string() {
        let json = serde_json::to_string(&StepId::new("a")).unwrap();
        assert_eq!(json, "\"a\"");
    }
}
