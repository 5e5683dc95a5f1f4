//! Diff engine for tag sets.
//!
//! The diff is minimal: a key is only created when its value differs, and
//! only removed when the engine is allowed to own it.

use std::collections::BTreeSet;

use super::Tags;

/// Tag keys with this prefix are written by the provider itself.
pub const RESERVED_TAG_PREFIX: &str = "aws:";

/// Engine for computing tag diffs.
#[derive(Debug, Clone, Default)]
pub struct TagDiffEngine {
    /// Keys set by other systems that must survive reconciliation.
    externally_managed: BTreeSet<String>,
}

/// Changes required to converge a resource's tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TagDiff {
    /// Keys to create or overwrite, with their desired values.
    pub create: Tags,
    /// Keys to remove.
    pub remove: BTreeSet<String>,
}

impl TagDiffEngine {
    /// Creates an engine with the given externally managed keys.
    #[must_use]
    pub fn new<I>(externally_managed: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            externally_managed: externally_managed.into_iter().collect(),
        }
    }

    /// Returns true if the key belongs to another system.
    #[must_use]
    pub fn is_externally_managed(&self, key: &str) -> bool {
        key.starts_with(RESERVED_TAG_PREFIX) || self.externally_managed.contains(key)
    }

    /// Computes the tag changes that turn `observed` into `desired`.
    #[must_use]
    pub fn diff(&self, desired: &Tags, observed: &Tags) -> TagDiff {
        let create: Tags = desired
            .iter()
            .filter(|(key, value)| observed.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let remove: BTreeSet<String> = observed
            .keys()
            .filter(|key| !desired.contains_key(*key))
            .filter(|key| !self.is_externally_managed(key))
            .cloned()
            .collect();

        TagDiff { create, remove }
    }
}

impl TagDiff {
    /// Returns true if the tags are already converged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.remove.is_empty()
    }

    /// Applies this diff to a tag set, as the provider would.
    pub fn apply_to(&self, tags: &mut Tags) {
        for key in &self.remove {
            tags.remove(key);
        }
        tags.extend(self.create.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

impl std::fmt::Display for TagDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "tags converged");
        }
        let created: Vec<String> = self
            .create
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let removed: Vec<&str> = self.remove.iter().map(String::as_str).collect();
        write!(
            f,
            "create [{}], remove [{}]",
            created.join(", "),
            removed.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_tag_convergence_scenario() {
        let engine = TagDiffEngine::new([String::from("legacy")]);
        let desired = tags(&[("env", "prod"), ("team", "infra")]);
        let observed = tags(&[("env", "staging"), ("legacy", "x")]);

        let diff = engine.diff(&desired, &observed);

        assert_eq!(diff.create, tags(&[("env", "prod"), ("team", "infra")]));
        assert!(diff.remove.is_empty());
    }

    #[test]
    fn test_unmanaged_extra_key_removed() {
        let engine = TagDiffEngine::default();
        let desired = tags(&[("env", "prod")]);
        let observed = tags(&[("env", "prod"), ("stale", "1")]);

        let diff = engine.diff(&desired, &observed);

        assert!(diff.create.is_empty());
        assert_eq!(diff.remove, BTreeSet::from([String::from("stale")]));
    }

    #[test]
    fn test_reserved_prefix_never_removed() {
        let engine = TagDiffEngine::default();
        let observed = tags(&[("aws:autoscaling:groupName", "pool-a")]);

        let diff = engine.diff(&Tags::new(), &observed);

        assert!(diff.is_empty());
    }

    #[test]
    fn test_converged_is_noop() {
        let engine = TagDiffEngine::default();
        let desired = tags(&[("env", "prod"), ("team", "infra")]);

        assert!(engine.diff(&desired, &desired.clone()).is_empty());
    }

    #[test]
    fn test_second_diff_is_empty() {
        let allow = [String::from("legacy"), String::from("owner")];
        let engine = TagDiffEngine::new(allow);
        let cases = [
            (tags(&[]), tags(&[])),
            (tags(&[("a", "1")]), tags(&[])),
            (tags(&[]), tags(&[("a", "1"), ("legacy", "x")])),
            (tags(&[("a", "1"), ("b", "2")]), tags(&[("a", "2"), ("c", "3")])),
            (tags(&[("owner", "me")]), tags(&[("owner", "you"), ("aws:x", "y")])),
            (tags(&[("legacy", "new")]), tags(&[("legacy", "old"), ("d", "4")])),
        ];

        for (desired, observed) in cases {
            let first = engine.diff(&desired, &observed);
            let mut converged = observed.clone();
            first.apply_to(&mut converged);

            let second = engine.diff(&desired, &converged);
            assert!(second.is_empty(), "second diff not empty for {desired:?} / {observed:?}");
        }
    }

    #[test]
    fn test_allow_listed_keys_never_removed() {
        let engine = TagDiffEngine::new([String::from("legacy"), String::from("cost-center")]);
        let observed = tags(&[("legacy", "x"), ("cost-center", "42"), ("old", "1")]);
        let desireds = [
            tags(&[]),
            tags(&[("env", "prod")]),
            tags(&[("legacy", "y")]),
        ];

        for desired in desireds {
            let diff = engine.diff(&desired, &observed);
            assert!(!diff.remove.contains("legacy"));
            assert!(!diff.remove.contains("cost-center"));
            assert!(diff.remove.contains("old"));
        }
    }

    #[test]
    fn test_display() {
        let engine = TagDiffEngine::default();
        let diff = engine.diff(&tags(&[("a", "1")]), &tags(&[("b", "2")]));
        assert_eq!(diff.to_string(), "create [a=1], remove [b]");
    }
}
