//! Scope identification and store key derivation.

use std::fmt;

use crate::store::KeyPattern;

/// Length of the random alphabetic suffix appended to every marker name.
pub const MARKER_SUFFIX_LEN: usize = 10;

/// The identity under which requests are counted.
///
/// A scope is either a resource shared by everyone or a resource narrowed to
/// one client. Keys derived from a scope:
///
/// | Scope       | Lock                  | Markers                     |
/// |-------------|-----------------------|-----------------------------|
/// | `Global`    | `{resource}-lock`     | `{resource}-{suffix}`       |
/// | `PerClient` | `{client}-{resource}-lock` | `{client}-{resource}-{suffix}` |
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// One budget for the whole resource.
    Global {
        /// The resource identifier
        resource_id: String,
    },
    /// A separate budget for each client of the resource.
    PerClient {
        /// The resource identifier
        resource_id: String,
        /// The client identifier
        client_id: String,
    },
}

impl Scope {
    /// Scope a resource globally.
    pub fn global(resource_id: impl Into<String>) -> Self {
        Scope::Global {
            resource_id: resource_id.into(),
        }
    }

    /// Scope a resource to a single client.
    pub fn per_client(resource_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Scope::PerClient {
            resource_id: resource_id.into(),
            client_id: client_id.into(),
        }
    }

    /// Build a scope from a resource and an optional client.
    pub fn new(resource_id: impl Into<String>, client_id: Option<impl Into<String>>) -> Self {
        match client_id {
            Some(client_id) => Self::per_client(resource_id, client_id),
            None => Self::global(resource_id),
        }
    }

    /// The resource identifier.
    pub fn resource_id(&self) -> &str {
        match self {
            Scope::Global { resource_id } | Scope::PerClient { resource_id, .. } => resource_id,
        }
    }

    /// The client identifier, if the scope is per client.
    pub fn client_id(&self) -> Option<&str> {
        match self {
            Scope::Global { .. } => None,
            Scope::PerClient { client_id, .. } => Some(client_id),
        }
    }

    /// Name of the lock serializing `log` calls for this scope.
    pub fn lock_name(&self) -> String {
        format!("{}lock", self.marker_prefix())
    }

    /// Pattern covering every marker of this scope.
    pub fn log_pattern(&self) -> KeyPattern {
        KeyPattern::prefix(self.marker_prefix())
    }

    /// Name of a marker carrying the given unique suffix.
    pub fn marker_name(&self, suffix: &str) -> String {
        format!("{}{}", self.marker_prefix(), suffix)
    }

    /// Whether `key` is a marker written for this scope.
    ///
    /// The raw pattern also matches this scope's lock and markers of scopes
    /// whose names extend this one (`"a-*"` matches `"a-b-XXXXXXXXXX"`), so
    /// the suffix must be exactly [`MARKER_SUFFIX_LEN`] ASCII letters.
    pub fn owns_marker(&self, key: &str) -> bool {
        match key.strip_prefix(self.marker_prefix().as_str()) {
            Some(suffix) => {
                suffix.len() == MARKER_SUFFIX_LEN
                    && suffix.bytes().all(|b| b.is_ascii_alphabetic())
            }
            None => false,
        }
    }

    fn marker_prefix(&self) -> String {
        match self {
            Scope::Global { resource_id } => format!("{}-", resource_id),
            Scope::PerClient {
                resource_id,
                client_id,
            } => format!("{}-{}-", client_id, resource_id),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global { resource_id } => write!(f, "{}", resource_id),
            Scope::PerClient {
                resource_id,
                client_id,
            } => write!(f, "{}/{}", client_id, resource_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_key_derivation() {
        let scope = Scope::global("AlarmingSystem");

        assert_eq!(scope.lock_name(), "AlarmingSystem-lock");
        assert_eq!(scope.log_pattern().to_string(), "AlarmingSystem-*");
        assert_eq!(scope.marker_name("abcdeFGHIJ"), "AlarmingSystem-abcdeFGHIJ");
    }

    #[test]
    fn test_per_client_key_derivation() {
        let scope = Scope::per_client("FORGET_PASSWORD", "user@example.com");

        assert_eq!(scope.lock_name(), "user@example.com-FORGET_PASSWORD-lock");
        assert_eq!(
            scope.log_pattern().to_string(),
            "user@example.com-FORGET_PASSWORD-*"
        );
        assert_eq!(
            scope.marker_name("QwErTyUiOp"),
            "user@example.com-FORGET_PASSWORD-QwErTyUiOp"
        );
    }

    #[test]
    fn test_optional_client_selects_variant() {
        assert_eq!(Scope::new("r", None::<String>), Scope::global("r"));
        assert_eq!(Scope::new("r", Some("c")), Scope::per_client("r", "c"));
    }

    #[test]
    fn test_accessors() {
        let scope = Scope::per_client("r", "c");
        assert_eq!(scope.resource_id(), "r");
        assert_eq!(scope.client_id(), Some("c"));
        assert_eq!(Scope::global("r").client_id(), None);
    }

    #[test]
    fn test_owns_marker() {
        let scope = Scope::global("r");

        assert!(scope.owns_marker(&scope.marker_name("abcdefghij")));
        assert!(!scope.owns_marker("r-lock"));
        assert!(!scope.owns_marker("r-abcdefghi"));
        assert!(!scope.owns_marker("r-abcdefghijk"));
        assert!(!scope.owns_marker("r-abcde12345"));
        assert!(!scope.owns_marker("s-abcdefghij"));
    }

    #[test]
    fn test_owns_marker_rejects_longer_scopes() {
        let outer = Scope::global("a");
        let inner = Scope::per_client("b", "a");

        let inner_marker = inner.marker_name("abcdefghij");
        assert!(outer.log_pattern().matches(&inner_marker));
        assert!(!outer.owns_marker(&inner_marker));
        assert!(inner.owns_marker(&inner_marker));
    }

    #[test]
    fn test_display() {
        assert_eq!(Scope::global("r").to_string(), "r");
        assert_eq!(Scope::per_client("r", "c").to_string(), "c/r");
    }
}
