#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::io::{Cursor, Write};
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;
use tplforge_engine::MirrorOrigin;
use zip::write::FileOptions;

const PAGE: &str = "export default function Page() {\n  return (\n    <main>\n      <Header data-anchor=\"header\" />\n      {/* @slot:start hero */}\n      <h1>Template</h1>\n      {/* @slot:end hero */}\n    </main>\n  );\n}\n";

const GLOBALS: &str = ":root {\n  --primary: 222.2 47.4% 11.2%;\n}\n\n.dark {\n  --background: 222.2 84% 4.9%;\n}\n";

fn landing_zip() -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in [("app/page.tsx", PAGE), ("app/globals.css", GLOBALS)] {
        writer.start_file(name, FileOptions::default()).unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn workspace() -> TempDir {
    let tmp = TempDir::new().unwrap();
    MirrorOrigin::new(tmp.path().join("mirror"))
        .publish("landing", "Landing", "1.0.0", &landing_zip())
        .unwrap();
    tmp
}

fn tplforge(tmp: &Path) -> Command {
    let mut cmd = Command::cargo_bin("tplforge").unwrap();
    cmd.current_dir(tmp)
        .env_remove("RUST_LOG")
        .arg("--cache-root")
        .arg(tmp.join("cache"))
        .arg("--mirror")
        .arg(tmp.join("mirror"));
    cmd
}

fn envelope(output: &[u8]) -> Value {
    serde_json::from_slice(output).expect("stdout is one JSON envelope")
}

fn materialize(tmp: &Path) {
    tplforge(tmp)
        .args(["materialize", "landing"])
        .arg(tmp.join("site"))
        .assert()
        .success();
}

#[test]
fn materialize_prints_a_success_envelope() {
    let tmp = workspace();

    let output = tplforge(tmp.path())
        .args(["materialize", "landing"])
        .arg(tmp.path().join("site"))
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(0));
    let value = envelope(&output.stdout);
    assert_eq!(value["ok"], true);
    assert_eq!(value["data"]["version"], "1.0.0");
    assert!(tmp.path().join("site/app/page.tsx").is_file());
}

#[test]
fn fill_slot_reports_no_change_the_second_time() {
    let tmp = workspace();
    materialize(tmp.path());
    let site = tmp.path().join("site");

    for expected in [true, false] {
        let output = tplforge(tmp.path())
            .arg("fill-slot")
            .arg(&site)
            .args(["app/page.tsx", "hero", "--content", "<h1>Hello</h1>"])
            .output()
            .unwrap();
        assert_eq!(output.status.code(), Some(0));
        assert_eq!(envelope(&output.stdout)["changed"], expected);
    }
    let page = std::fs::read_to_string(site.join("app/page.tsx")).unwrap();
    assert!(page.contains("<h1>Hello</h1>"));
}

#[test]
fn unknown_slot_exits_with_input_rejection() {
    let tmp = workspace();
    materialize(tmp.path());

    tplforge(tmp.path())
        .arg("fill-slot")
        .arg(tmp.path().join("site"))
        .args(["app/page.tsx", "footer", "--content", "x"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("SLOT_NOT_FOUND"))
        .stdout(predicate::str::contains("\"hero\""));
}

#[test]
fn theme_and_insert_edit_the_tree() {
    let tmp = workspace();
    materialize(tmp.path());
    let site = tmp.path().join("site");

    tplforge(tmp.path())
        .arg("theme")
        .arg(&site)
        .args(["--set", "primary=#ff0000", "--dark"])
        .assert()
        .success();
    tplforge(tmp.path())
        .arg("insert")
        .arg(&site)
        .args(["app/page.tsx", "header", "--symbol", "Banner", "--id", "banner"])
        .args(["--attr", "tone=\"info\"", "--import-from", "@/components/banner"])
        .assert()
        .success();

    let css = std::fs::read_to_string(site.join("app/globals.css")).unwrap();
    assert!(css.contains(".dark {\n  --background: 222.2 84% 4.9%;\n  --primary: 0 100% 50%;\n}"));
    let page = std::fs::read_to_string(site.join("app/page.tsx")).unwrap();
    assert!(page.starts_with("import { Banner } from \"@/components/banner\";\n"));
    assert!(page.contains("<Banner data-anchor=\"banner\" tone=\"info\" />"));
}

#[test]
fn malformed_blueprint_is_rejected_before_any_write() {
    let tmp = workspace();
    let file = tmp.path().join("blueprint.json");
    std::fs::write(&file, r#"{ "template": "landing", "steps": [{ "op": "explode" }] }"#).unwrap();

    tplforge(tmp.path())
        .arg("blueprint")
        .arg(&file)
        .arg(tmp.path().join("site"))
        .assert()
        .code(2)
        .stdout(predicate::str::contains("VALIDATION_FAILED"));
    assert!(!tmp.path().join("site").exists());
}

#[test]
fn tampered_mirror_exits_with_integrity_failure() {
    let tmp = workspace();
    std::fs::write(tmp.path().join("mirror/landing.archive"), b"not the archive").unwrap();

    tplforge(tmp.path())
        .args(["materialize", "landing"])
        .arg(tmp.path().join("site"))
        .assert()
        .code(3)
        .stdout(predicate::str::contains("INTEGRITY_MISMATCH"));
}

#[test]
fn list_shows_cached_templates() {
    let tmp = workspace();
    materialize(tmp.path());

    let output = tplforge(tmp.path()).arg("list").output().unwrap();

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(envelope(&output.stdout)["data"]["templates"][0]["id"], "landing");
}
