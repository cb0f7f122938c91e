//! Integration tests for reconciliation rule management and rule-based matching.

mod common;

use axum::http::StatusCode;
use common::{decimal, spawn_app};
use rust_decimal_macros::dec;
use serde_json::json;

fn rent_rule() -> serde_json::Value {
    json!({
        "name": "Monthly rent",
        "priority": 10,
        "conditions": { "descriptionPattern": "rent", "amountMin": "1000", "amountMax": "2000" },
        "actions": { "category": "rent-income", "autoMatch": true, "tolerance": "50" }
    })
}

#[tokio::test]
async fn rule_crud_round_trip() {
    let app = spawn_app();

    let (status, created) = app.post("/reconciliation/rules", rent_rule()).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["name"], "Monthly rent");
    assert_eq!(created["isActive"], true);
    let uri = format!("/reconciliation/rules/{}", created["ruleId"].as_str().unwrap());

    let (status, fetched) = app.get(&uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["ruleId"], created["ruleId"]);

    let mut changed = rent_rule();
    changed["name"] = json!("Rent (updated)");
    changed["isActive"] = json!(false);
    let (status, updated) = app
        .send("PUT", &uri, Some(common::OWNER), Some(changed))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["name"], "Rent (updated)");
    assert_eq!(updated["isActive"], false);
    assert_eq!(updated["createdAt"], created["createdAt"]);

    let (status, _) = app.send("DELETE", &uri, Some(common::OWNER), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = app.get(&uri).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn rules_are_listed_in_priority_order() {
    let app = spawn_app();
    for (name, priority) in [("third", 30), ("first", 1), ("second", 20)] {
        app.post(
            "/reconciliation/rules",
            json!({ "name": name, "priority": priority }),
        )
        .await;
    }

    let (status, rules) = app.get("/reconciliation/rules").await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = rules
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn malformed_pattern_is_rejected() {
    let app = spawn_app();
    let (status, body) = app
        .post(
            "/reconciliation/rules",
            json!({ "name": "broken", "conditions": { "descriptionPattern": "(rent" } }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn rules_of_another_owner_are_invisible() {
    let app = spawn_app();
    let (_, created) = app.post("/reconciliation/rules", rent_rule()).await;
    let uri = format!("/reconciliation/rules/{}", created["ruleId"].as_str().unwrap());

    let (status, _) = app.send("GET", &uri, Some("owner-2"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, listed) = app
        .send("GET", "/reconciliation/rules", Some("owner-2"), None)
        .await;
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn auto_match_rule_binds_within_its_tolerance() {
    let app = spawn_app();
    let payment = app.seed_payment("1500.00", "2025-03-03").await;
    app.post("/reconciliation/rules", rent_rule()).await;

    let body = app
        .import(json!([{
            "externalId": "tx-7",
            "date": "2025-03-01",
            "amount": "1485.00",
            "description": "RENT MARCH"
        }]))
        .await;

    let txn = &body["transactions"][0];
    assert_eq!(txn["matchType"], "rule");
    assert_eq!(txn["status"], "partial_match");
    assert_eq!(decimal(&txn["matchConfidence"]), dec!(99));
    assert_eq!(txn["matchedPaymentId"], payment.payment_id.to_string());
    assert_eq!(txn["category"], "rent-income");
    assert_eq!(txn["discrepancy"]["type"], "partial");
}

#[tokio::test]
async fn inactive_rules_do_not_match() {
    let app = spawn_app();
    app.seed_payment("1500.00", "2025-03-03").await;
    let mut rule = rent_rule();
    rule["isActive"] = json!(false);
    app.post("/reconciliation/rules", rule).await;

    let body = app
        .import(json!([{
            "externalId": "tx-8",
            "date": "2025-03-01",
            "amount": "1485.00",
            "description": "RENT MARCH"
        }]))
        .await;

    let txn = &body["transactions"][0];
    assert_eq!(txn["status"], "unmatched");
    assert!(txn["category"].is_null());
}
