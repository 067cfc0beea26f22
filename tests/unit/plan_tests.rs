//! Unit tests for plan parsing and action targets.

use fleet_review::models::plan::{ActionOp, ActionTarget, GhAction, Plan};
use fleet_review::models::state::{ItemKind, ItemOutcome};

#[test]
fn action_target_parses_issue_and_pr_forms() {
    let target: ActionTarget = "issue#12".parse().expect("issue target");
    assert_eq!(target.kind, ItemKind::Issue);
    assert_eq!(target.number, 12);

    let target: ActionTarget = "pr#3".parse().expect("pr target");
    assert_eq!(target.kind, ItemKind::Pr);
    assert_eq!(target.number, 3);
}

#[test]
fn malformed_targets_are_rejected() {
    for raw in ["branch#1", "issue#", "issue12", "pr#-3", "issue#1 ", ""] {
        assert!(
            raw.parse::<ActionTarget>().is_err(),
            "'{raw}' must not parse"
        );
    }
}

#[test]
fn action_target_round_trips_through_display() {
    let target: ActionTarget = "pr#42".parse().expect("parse");
    assert_eq!(target.to_string(), "pr#42");
}

#[test]
fn gh_action_keeps_operation_args_flattened() {
    let action: GhAction = serde_json::from_str(
        r#"{"op": "comment", "target": "issue#7", "body": "Fixed in review."}"#,
    )
    .expect("parse");
    assert_eq!(action.op, ActionOp::Comment);
    assert_eq!(action.target.number, 7);
    assert_eq!(
        action.args.get("body").and_then(serde_json::Value::as_str),
        Some("Fixed in review.")
    );
}

#[test]
fn plan_parses_with_items_and_actions() {
    let text = r#"{
        "schema_version": 1,
        "repo": "acme/widgets",
        "items": [
            {"type": "issue", "number": 7, "outcome": "fixed", "notes": "patched"},
            {"type": "pr", "number": 9, "outcome": "skipped"}
        ],
        "gh_actions": [
            {"op": "close", "target": "issue#7"},
            {"op": "label", "target": "pr#9", "label": "needs-rebase"}
        ],
        "git": {}
    }"#;
    let plan = Plan::from_json_str(text).expect("parse");
    assert_eq!(plan.repo, "acme/widgets");
    assert_eq!(plan.items.len(), 2);
    assert_eq!(plan.items[0].outcome, ItemOutcome::Fixed);
    assert_eq!(plan.items[1].notes, "", "notes default to empty");
    assert_eq!(plan.gh_actions.len(), 2);
    assert_eq!(plan.gh_actions[1].op, ActionOp::Label);
}

#[test]
fn plan_without_actions_is_valid() {
    let plan = Plan::from_json_str(r#"{"schema_version": 1, "repo": "acme/widgets"}"#)
        .expect("minimal plan");
    assert!(plan.items.is_empty());
    assert!(plan.gh_actions.is_empty());
}

#[test]
fn malformed_plan_is_rejected() {
    assert!(Plan::from_json_str("{").is_err());
    assert!(Plan::from_json_str(r#"{"repo": "acme/widgets"}"#).is_err());
}
