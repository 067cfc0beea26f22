//! Unit tests for action canonicalization.

use fleet_review::ledger::canonicalize;
use serde_json::json;

#[test]
fn field_order_does_not_affect_the_canonical_form() {
    let a = json!({"b": 1, "a": 2});
    let b = json!({"a": 2, "b": 1});
    assert_eq!(canonicalize(&a), canonicalize(&b));
}

#[test]
fn nested_objects_are_sorted_recursively() {
    let a = json!({"op": "comment", "args": {"body": "x", "author": "y"}});
    let b = json!({"args": {"author": "y", "body": "x"}, "op": "comment"});
    assert_eq!(canonicalize(&a), canonicalize(&b));
}

#[test]
fn canonical_form_is_compact() {
    let value = json!({"a": 1, "b": [1, 2, 3]});
    let canonical = canonicalize(&value);
    assert!(!canonical.contains(' '), "whitespace must be normalized away");
    assert_eq!(canonical, r#"{"a":1,"b":[1,2,3]}"#);
}

#[test]
fn distinct_values_stay_distinct() {
    let a = json!({"op": "close", "target": "issue#1"});
    let b = json!({"op": "close", "target": "issue#2"});
    assert_ne!(canonicalize(&a), canonicalize(&b));
}

#[test]
fn array_order_is_semantic_and_preserved() {
    let a = json!([1, 2]);
    let b = json!([2, 1]);
    assert_ne!(canonicalize(&a), canonicalize(&b));
}

#[test]
fn canonical_form_round_trips_through_json() {
    let value = json!({"z": {"y": [true, null, "s"]}, "a": 1.5});
    let canonical = canonicalize(&value);
    let reparsed: serde_json::Value = serde_json::from_str(&canonical).expect("valid JSON");
    assert_eq!(canonicalize(&reparsed), canonical);
}
