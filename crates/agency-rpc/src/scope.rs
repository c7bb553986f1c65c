//! Scope sets and the authorization rule.
//!
//! Three scopes are reserved:
//! - `any`: a definition carrying it is open to every connection, logged in or not
//! - `all`: a connection holding it reaches every definition
//! - `service`: a connection holding it may impersonate users and sees
//!   user-targeted notifications for everyone

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const ANY: &str = "any";
pub const ALL: &str = "all";
pub const SERVICE: &str = "service";

/// Set of scope strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scopes(BTreeSet<String>);

impl Scopes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scopes for a definition reachable by everyone.
    pub fn open() -> Self {
        Self::from_iter([ANY])
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.0.contains(scope)
    }

    pub fn insert(&mut self, scope: impl Into<String>) -> bool {
        self.0.insert(scope.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_service(&self) -> bool {
        self.contains(SERVICE)
    }

    /// Whether a connection holding `granted` may use a definition requiring `self`.
    pub fn permits(&self, granted: &Scopes) -> bool {
        scopes_match(self, granted)
    }
}

impl<S: Into<String>> FromIterator<S> for Scopes {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// True iff `definition ∪ {all}` intersects `connection ∪ {any}`.
pub fn scopes_match(definition: &Scopes, connection: &Scopes) -> bool {
    definition.contains(ANY)
        || connection.contains(ALL)
        || definition.iter().any(|scope| connection.contains(scope))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthenticated_reaches_only_any() {
        let anonymous = Scopes::new();
        assert!(scopes_match(&Scopes::open(), &anonymous));
        assert!(!scopes_match(&Scopes::from_iter(["rule"]), &anonymous));
        assert!(!scopes_match(&Scopes::new(), &anonymous));
    }

    #[test]
    fn test_all_reaches_everything() {
        let superuser = Scopes::from_iter([ALL]);
        assert!(scopes_match(&Scopes::from_iter(["rule", "token"]), &superuser));
        assert!(scopes_match(&Scopes::new(), &superuser));
    }

    #[test]
    fn test_intersection_required() {
        let granted = Scopes::from_iter(["execution"]);
        assert!(scopes_match(&Scopes::from_iter(["rule", "execution"]), &granted));
        assert!(!scopes_match(&Scopes::from_iter(["rule"]), &granted));
    }

    #[test]
    fn test_service_is_not_a_wildcard() {
        let service = Scopes::from_iter([SERVICE]);
        assert!(service.is_service());
        assert!(!scopes_match(&Scopes::from_iter(["rule"]), &service));
    }

    #[test]
    fn test_serializes_as_list() {
        let scopes = Scopes::from_iter(["b", "a"]);
        assert_eq!(serde_json::to_string(&scopes).unwrap(), r#"["a","b"]"#);
    }
}
