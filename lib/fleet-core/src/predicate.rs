//! Event filters applied before work is enqueued
//!
//! A predicate sees the previous state of an object (if known) and its new
//! state, and decides whether the change is worth a reconcile. Predicates
//! compose with [`all_of`].

use kube::api::DynamicObject;
use serde_json::Value;
use std::sync::Arc;

pub type Predicate = Arc<dyn Fn(Option<&DynamicObject>, &DynamicObject) -> bool + Send + Sync>;

/// Accepts objects in one of `namespaces`; an empty list accepts all
pub fn namespace_in(namespaces: Vec<String>) -> Predicate {
    Arc::new(move |_, new| {
        namespaces.is_empty()
            || new
                .metadata
                .namespace
                .as_ref()
                .is_some_and(|ns| namespaces.contains(ns))
    })
}

/// Accepts objects carrying the label `key`
pub fn has_label(key: impl Into<String>) -> Predicate {
    let key = key.into();
    Arc::new(move |_, new| {
        new.metadata
            .labels
            .as_ref()
            .is_some_and(|labels| labels.contains_key(&key))
    })
}

fn spec_of(object: &DynamicObject) -> Option<&Value> {
    object.data.get("spec")
}

/// Accepts creations, deletions in progress and spec changes.
///
/// The generation is compared when both sides carry one; otherwise the spec
/// content itself. Status-only updates are dropped.
pub fn spec_changed() -> Predicate {
    Arc::new(|old, new| {
        let Some(old) = old else {
            return true;
        };
        if old.metadata.deletion_timestamp != new.metadata.deletion_timestamp
            || old.metadata.finalizers != new.metadata.finalizers
        {
            return true;
        }
        match (old.metadata.generation, new.metadata.generation) {
            (Some(before), Some(after)) => before != after,
            _ => spec_of(old) != spec_of(new),
        }
    })
}

/// Accepts changes whose status differs, for watching children whose
/// progress feeds the owner's aggregate
pub fn status_changed() -> Predicate {
    Arc::new(|old, new| match old {
        None => true,
        Some(old) => old.data.get("status") != new.data.get("status"),
    })
}

/// Accepts a change if any predicate does
pub fn any_of(predicates: Vec<Predicate>) -> Predicate {
    Arc::new(move |old, new| predicates.iter().any(|p| p(old, new)))
}

/// Accepts a change only if every predicate does
pub fn all_of(predicates: Vec<Predicate>) -> Predicate {
    Arc::new(move |old, new| predicates.iter().all(|p| p(old, new)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(namespace: &str, generation: i64, replicas: i64, ready: i64) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "apps.fleet.dev/v1alpha1",
            "kind": "DesiredTopology",
            "metadata": {
                "name": "web",
                "namespace": namespace,
                "generation": generation,
                "labels": {"fleet.dev/topology": "web"}
            },
            "spec": {"replicas": replicas},
            "status": {"ready": ready}
        }))
        .unwrap()
    }

    #[test]
    fn test_namespace_filter() {
        let filter = namespace_in(vec!["shop".to_string()]);
        assert!(filter(None, &object("shop", 1, 1, 0)));
        assert!(!filter(None, &object("other", 1, 1, 0)));
        assert!(namespace_in(vec![])(None, &object("other", 1, 1, 0)));
    }

    #[test]
    fn test_label_presence() {
        assert!(has_label("fleet.dev/topology")(None, &object("shop", 1, 1, 0)));
        assert!(!has_label("fleet.dev/cluster")(None, &object("shop", 1, 1, 0)));
    }

    #[test]
    fn test_status_only_updates_are_dropped() {
        let changed = spec_changed();
        let before = object("shop", 1, 1, 0);
        assert!(changed(None, &before));
        assert!(!changed(Some(&before), &object("shop", 1, 1, 1)));
        assert!(changed(Some(&before), &object("shop", 2, 3, 0)));
        assert!(status_changed()(Some(&before), &object("shop", 1, 1, 1)));
    }

    #[test]
    fn test_composition() {
        let filter = all_of(vec![namespace_in(vec!["shop".to_string()]), spec_changed()]);
        let before = object("shop", 1, 1, 0);
        assert!(!filter(Some(&before), &object("shop", 1, 1, 1)));
        assert!(filter(Some(&before), &object("shop", 2, 2, 0)));
        assert!(!filter(None, &object("other", 1, 1, 0)));

        let either = any_of(vec![spec_changed(), status_changed()]);
        assert!(either(Some(&before), &object("shop", 1, 1, 1)));
        assert!(!either(Some(&before), &before));
    }
}
