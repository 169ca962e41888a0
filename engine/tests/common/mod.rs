//! Shared fixtures: a temp workspace with a mirror origin and a cache.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tplforge_engine::store::MirrorOrigin;
use tplforge_engine::{Engine, EngineConfig, JsonSchemaValidator};
use zip::write::FileOptions;

pub const PAGE: &str = "import { Header } from \"@/components/header\";\n\nexport default function Page() {\n  return (\n    <main>\n      <Header data-anchor=\"header\" />\n      {/* @slot:start hero */}\n      <h1>Template</h1>\n      {/* @slot:end hero */}\n    </main>\n  );\n}\n";

pub const GLOBALS: &str = "@layer base {\n  :root {\n    --background: 0 0% 100%;\n    --primary: 222.2 47.4% 11.2%;\n  }\n\n  .dark {\n    --background: 222.2 84% 4.9%;\n  }\n}\n";

pub struct Workspace {
    pub tmp: TempDir,
    pub engine: Engine,
    pub mirror: MirrorOrigin,
}

impl Workspace {
    pub fn new() -> Self {
        let tmp = TempDir::new().expect("temp dir");
        let mut config = EngineConfig::default();
        config.cache_root = tmp.path().join("cache");
        config.origin.mirror_dir = Some(tmp.path().join("mirror"));
        config.origin.max_retries = 0;
        let mirror = MirrorOrigin::new(tmp.path().join("mirror"));
        let engine = Engine::from_config(config).expect("engine");
        Self { tmp, engine, mirror }
    }

    /// Same workspace, with blueprints checked against the bundled schema.
    pub fn validating(mut self) -> Self {
        let validator = JsonSchemaValidator::blueprint().expect("schema");
        self.engine = self.engine.with_validator(Arc::new(validator));
        self
    }

    pub fn dest(&self, name: &str) -> PathBuf {
        self.tmp.path().join(name)
    }

    /// Publish the standard landing template under `id`.
    pub fn publish_landing(&self, id: &str) {
        let archive = zip_of(&[
            ("package.json", "{ \"name\": \"landing\" }\n"),
            ("app/", ""),
            ("app/page.tsx", PAGE),
            ("app/globals.css", GLOBALS),
        ]);
        self.mirror
            .publish(id, "Landing", "1.2.0", &archive)
            .expect("publish");
    }
}

pub fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, FileOptions::default()).unwrap();
        } else {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}

pub fn read(dir: &Path, rel: &str) -> String {
    std::fs::read_to_string(dir.join(rel)).unwrap()
}

pub fn is_empty_or_missing(dir: &Path) -> bool {
    !dir.exists() || std::fs::read_dir(dir).unwrap().next().is_none()
}
