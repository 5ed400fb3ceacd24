use serde::{Deserialize, Serialize};

use crate::notification::{Notification, RefUpdate};

pub const BRANCH_REF_PREFIX: &str = "refs/heads/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Git,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitUpdate {
    pub url: String,
    pub branch: String,
}

/// A change request as accepted by the Flux daemon's notify endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub kind: ChangeKind,
    pub source: GitUpdate,
}

impl Change {
    pub fn git_update(url: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Git,
            source: GitUpdate {
                url: url.into(),
                branch: branch.into(),
            },
        }
    }

    fn from_ref_update(url: &str, update: &RefUpdate) -> Self {
        Self::git_update(url, branch_name(&update.ref_name))
    }
}

/// Strip the literal `refs/heads/` prefix. Anything else, tags included,
/// passes through untouched.
pub fn branch_name(ref_name: &str) -> &str {
    ref_name.strip_prefix(BRANCH_REF_PREFIX).unwrap_or(ref_name)
}

impl Notification {
    /// One change per ref update, lazily, in unspecified order.
    pub fn changes(&self) -> impl Iterator<Item = Change> + '_ {
        self.ref_updates()
            .map(move |update| Change::from_ref_update(&self.url, update))
    }
}

pub fn translate(notification: &Notification) -> Vec<Change> {
    notification.changes().collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;
    use crate::notification::{RefUpdateEvent, UpdateType};

    fn notification(url: &str, refs: &[&str]) -> Notification {
        let ref_updates = refs
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    RefUpdate {
                        ref_name: name.to_string(),
                        update_type: UpdateType::UpdateFastForward,
                        old_id: "c7a2".to_string(),
                        new_id: "f007".to_string(),
                    },
                )
            })
            .collect::<HashMap<_, _>>();
        Notification {
            url: url.to_string(),
            ref_update_event: RefUpdateEvent {
                email: String::new(),
                ref_updates,
            },
            ..Default::default()
        }
    }

    #[test]
    fn strips_only_the_heads_prefix() {
        assert_eq!(branch_name("refs/heads/master"), "master");
        assert_eq!(branch_name("refs/heads/feature/x"), "feature/x");
        assert_eq!(branch_name("refs/tags/v1.0"), "refs/tags/v1.0");
        assert_eq!(branch_name("master"), "master");
        assert_eq!(branch_name("refs/heads"), "refs/heads");
        assert_eq!(branch_name(" refs/heads/master"), " refs/heads/master");
        assert_eq!(branch_name("refs/heads/refs/heads/x"), "refs/heads/x");
    }

    #[test]
    fn single_update_becomes_one_change() {
        let n = notification("https://example/repo", &["refs/heads/master"]);
        assert_eq!(
            translate(&n),
            vec![Change::git_update("https://example/repo", "master")]
        );
    }

    #[test]
    fn empty_notification_yields_nothing() {
        let n = notification("https://example/repo", &[]);
        assert!(translate(&n).is_empty());
    }

    #[test]
    fn multiple_updates_share_the_url() {
        let n = notification("u", &["refs/heads/a", "refs/tags/v1", "refs/heads/b"]);
        let mut branches: Vec<_> = translate(&n)
            .into_iter()
            .inspect(|c| assert_eq!(c.source.url, "u"))
            .map(|c| c.source.branch)
            .collect();
        branches.sort();
        assert_eq!(branches, vec!["a", "b", "refs/tags/v1"]);
    }

    #[test]
    fn serializes_for_the_notify_endpoint() {
        let json = serde_json::to_value(Change::git_update("https://example/repo", "master")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "kind": "git",
                "source": { "url": "https://example/repo", "branch": "master" }
            })
        );
    }

    proptest! {
        #[test]
        fn heads_prefix_yields_suffix(suffix in "[a-zA-Z0-9._/-]{1,40}") {
            let ref_name = format!("refs/heads/{suffix}");
            let n = notification("https://example/repo", &[ref_name.as_str()]);
            let changes = translate(&n);
            prop_assert_eq!(changes.len(), 1);
            prop_assert_eq!(&changes[0].source.branch, &suffix);
        }

        #[test]
        fn one_change_per_update(names in proptest::collection::hash_set("[a-z]{1,8}", 0..16)) {
            let refs: Vec<String> = names.iter().map(|n| format!("refs/heads/{n}")).collect();
            let refs: Vec<&str> = refs.iter().map(String::as_str).collect();
            let n = notification("u", &refs);
            let mut branches: Vec<String> = translate(&n).into_iter().map(|c| c.source.branch).collect();
            branches.sort();
            let mut expected: Vec<String> = names.into_iter().collect();
            expected.sort();
            prop_assert_eq!(branches, expected);
        }

        #[test]
        fn non_heads_refs_pass_through(name in "refs/(tags|notes|changes)/[a-z0-9]{1,12}") {
            prop_assert_eq!(branch_name(&name), name.as_str());
        }
    }
}
