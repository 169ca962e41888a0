#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use common::{PAGE, Workspace, is_empty_or_missing, read};
use serde_json::{Value, json};
use tplforge_engine::ErrorCode;

fn landing_blueprint() -> Value {
    json!({
        "template": "landing",
        "steps": [
            {
                "op": "fill_slot",
                "target": "app/page.tsx",
                "slot": "hero",
                "content": "<h1>Launch day</h1>"
            },
            {
                "op": "rewrite_theme",
                "tokens": { "--primary": "hsl(262 83% 58%)", "radius": "0.75rem" }
            },
            {
                "op": "insert_component",
                "target": "app/page.tsx",
                "anchor": "header",
                "symbol": "Banner",
                "id": "banner",
                "import": { "source": "@/components/banner" }
            }
        ]
    })
}

#[tokio::test]
async fn runs_every_step_against_the_fresh_tree() {
    let ws = Workspace::new().validating();
    ws.publish_landing("landing");
    let dest = ws.dest("site1");

    let envelope = ws.engine.run_blueprint(&landing_blueprint(), &dest, false).await;

    let value = envelope.to_json();
    assert_eq!(value["ok"], true, "{value}");
    assert_eq!(value["data"]["version"], "1.2.0");
    assert_eq!(value["data"]["steps"].as_array().unwrap().len(), 3);
    assert_eq!(value["data"]["steps"][1]["files_written"], json!(["app/globals.css"]));
    assert_eq!(
        envelope
            .changed_files()
            .iter()
            .filter(|f| *f == "app/page.tsx")
            .count(),
        1
    );

    let page = read(&dest, "app/page.tsx");
    assert!(page.contains("<h1>Launch day</h1>"));
    assert!(page.contains("<Banner data-anchor=\"banner\" />"));
    assert!(page.contains("import { Banner } from \"@/components/banner\";"));
    let css = read(&dest, "app/globals.css");
    assert!(css.contains("--primary: 262 83% 58%;"));
    assert!(css.contains("--radius: 0.75rem;"));
}

#[tokio::test]
async fn simulated_run_reports_and_leaves_dest_alone() {
    let ws = Workspace::new().validating();
    ws.publish_landing("landing");
    let dest = ws.dest("site1");

    let envelope = ws.engine.run_blueprint(&landing_blueprint(), &dest, true).await;

    let value = envelope.to_json();
    assert_eq!(value["ok"], true, "{value}");
    assert_eq!(value["simulated"], true);
    assert_eq!(value["data"]["steps"][0]["changed"], true);
    assert!(is_empty_or_missing(&dest));
}

#[tokio::test]
async fn structural_errors_stop_before_any_write() {
    let ws = Workspace::new().validating();
    ws.publish_landing("landing");
    let dest = ws.dest("site1");
    let document = json!({
        "template": "landing",
        "steps": [{ "op": "fill_slot", "target": "app/page.tsx", "content": "x" }]
    });

    let envelope = ws.engine.run_blueprint(&document, &dest, false).await;

    assert_eq!(envelope.error_code(), Some(ErrorCode::ValidationFailed));
    let errors = &envelope.to_json()["error"]["details"]["errors"];
    assert!(
        errors
            .as_array()
            .unwrap()
            .iter()
            .any(|e| e["path"] == "/steps/0"),
        "{errors}"
    );
    assert!(is_empty_or_missing(&dest));
}

#[tokio::test]
async fn failing_step_reports_what_was_already_written() {
    let ws = Workspace::new().validating();
    ws.publish_landing("landing");
    let dest = ws.dest("site1");
    let document = json!({
        "template": "landing",
        "steps": [
            { "op": "fill_slot", "target": "app/page.tsx", "slot": "hero", "content": "<h1>One</h1>" },
            { "op": "fill_slot", "target": "app/page.tsx", "slot": "pricing", "content": "<p>Two</p>" }
        ]
    });

    let envelope = ws.engine.run_blueprint(&document, &dest, false).await;

    let value = envelope.to_json();
    assert_eq!(envelope.error_code(), Some(ErrorCode::SlotNotFound));
    assert_eq!(value["error"]["details"]["step"], 1);
    assert_eq!(value["error"]["details"]["op"], "fill_slot");
    assert_eq!(value["error"]["details"]["available_slots"], json!(["hero"]));
    let written = value["error"]["details"]["changed_files"].as_array().unwrap();
    assert!(written.contains(&json!("app/page.tsx")));
    let page = read(&dest, "app/page.tsx");
    assert_ne!(page, PAGE);
    assert!(page.contains("<h1>One</h1>"));
}

#[tokio::test]
async fn unknown_op_is_rejected_without_a_schema() {
    let ws = Workspace::new();
    let document = json!({ "template": "landing", "steps": [{ "op": "delete_everything" }] });

    let envelope = ws
        .engine
        .run_blueprint(&document, &ws.dest("site1"), false)
        .await;

    assert_eq!(envelope.error_code(), Some(ErrorCode::ValidationFailed));
}
