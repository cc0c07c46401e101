/* SCION Forward Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/


use std::{sync::Arc, thread};

use scion_forward_proxy::{
    policy::{PathSelector, PolicyError, PolicyLanguage, PolicyStore},
    transport::{IsdAsn, PathId, PathInfo},
};

fn candidates() -> Vec<PathInfo> {
    ["41", "42", "43"]
        .iter()
        .map(|id| PathInfo {
            id: PathId::from(*id),
            hops: vec![IsdAsn::new(1, 0xff00_0000_0111), IsdAsn::new(1, 0xff00_0000_0110)],
        })
        .collect()
}

fn rules(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|r| r.to_string()).collect()
}

#[test]
fn unknown_identity_reads_empty_state() {
    let store = PolicyStore::default();
    assert!(store.get_policy("nobody").is_empty());
    assert!(store.path_usage("nobody").is_empty());
    // Default selection picks the transport's first path.
    let paths = candidates();
    let chosen = store.selector("nobody").select(&paths).expect("default path");
    assert_eq!(chosen.id.as_str(), "41");
}

#[test]
fn set_policy_is_observable_and_scoped_to_identity() {
    let store = PolicyStore::default();
    store
        .set_policy("alice", rules(&["+ 42", "-"]))
        .expect("valid policy");

    assert_eq!(store.get_policy("alice"), rules(&["+ 42", "-"]));
    assert!(store.get_policy("bob").is_empty());

    let paths = candidates();
    let chosen = store.selector("alice").select(&paths).expect("allowed path");
    assert_eq!(chosen.id.as_str(), "42");
    assert_eq!(
        store.selector("bob").select(&paths).map(|p| p.id.as_str()),
        Some("41")
    );
}

#[test]
fn deny_rest_blocks_unlisted_paths() {
    let store = PolicyStore::default();
    store
        .set_policy("alice", rules(&["+ 99", "-"]))
        .expect("valid policy");
    assert!(store.selector("alice").select(&candidates()).is_none());
}

#[test]
fn rejected_policy_keeps_previous_one() {
    let store = PolicyStore::default();
    store
        .set_policy("alice", rules(&["+ 43"]))
        .expect("valid policy");

    let err = store
        .set_policy("alice", rules(&["* 42"]))
        .expect_err("invalid rule");
    assert!(matches!(err, PolicyError::InvalidRule { .. }));
    assert_eq!(store.get_policy("alice"), rules(&["+ 43"]));
}

#[test]
fn policy_document_must_be_a_string_array() {
    assert_eq!(
        PolicyStore::parse_document(br#"["+ 42", "-"]"#).expect("document"),
        rules(&["+ 42", "-"])
    );
    assert!(matches!(
        PolicyStore::parse_document(b"blub"),
        Err(PolicyError::InvalidDocument(_))
    ));
    assert!(PolicyStore::parse_document(br#"{"rules": []}"#).is_err());
}

#[test]
fn usage_counts_accumulate_per_path() {
    let store = PolicyStore::default();
    let path = PathId::from("42");
    store.record_path_usage("alice", &path);
    store.record_path_usage("alice", &path);
    store.record_path_usage("alice", &PathId::from("43"));

    let usage = store.path_usage("alice");
    assert_eq!(usage.get("42"), Some(&2));
    assert_eq!(usage.get("43"), Some(&1));
    assert!(store.path_usage("bob").is_empty());
}

#[test]
fn concurrent_usage_updates_are_not_lost() {
    let store = PolicyStore::default();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            thread::spawn(move || {
                for _ in 0..250 {
                    store.record_path_usage("alice", &PathId::from("42"));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker finished");
    }
    assert_eq!(store.path_usage("alice").get("42"), Some(&2000));
}

/// A language that only knows "first" and "last".
#[derive(Debug)]
struct EndsLanguage;

#[derive(Debug)]
struct Ends(bool);

impl PathSelector for Ends {
    fn select<'a>(&self, paths: &'a [PathInfo]) -> Option<&'a PathInfo> {
        if self.0 {
            paths.last()
        } else {
            paths.first()
        }
    }
}

impl PolicyLanguage for EndsLanguage {
    fn compile(&self, rules: &[String]) -> Result<Arc<dyn PathSelector>, PolicyError> {
        match rules.first().map(String::as_str) {
            Some("last") => Ok(Arc::new(Ends(true))),
            Some("first") | None => Ok(Arc::new(Ends(false))),
            Some(other) => Err(PolicyError::InvalidRule {
                rule: other.to_string(),
                reason: "expected first or last".into(),
            }),
        }
    }
}

#[test]
fn store_compiles_with_pluggable_language() {
    let store = PolicyStore::new(Arc::new(EndsLanguage));
    store
        .set_policy("alice", rules(&["last"]))
        .expect("valid for this language");
    assert!(store.set_policy("alice", rules(&["+ 42"])).is_err());

    let paths = candidates();
    assert_eq!(
        store.selector("alice").select(&paths).map(|p| p.id.as_str()),
        Some("43")
    );
}
