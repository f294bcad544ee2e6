use std::fs;
use std::path::Path;

use predicates::prelude::*;
use serde_json::Value;

const GUIDE_MD: &str = "---\ntitle: Guide\n---\n# Intro\nHello world.\n\n## Setup\nRun `npm i`.\n";

fn write(root: &Path, rel: &str, contents: &str) -> anyhow::Result<()> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    Ok(())
}

fn scaffold_site(root: &Path) -> anyhow::Result<()> {
    write(root, "src/app/page.tsx", "export default function Home() {}")?;
    write(root, "src/app/about/page.tsx", "export default function About() {}")?;
    write(root, "src/app/(marketing)/pricing/page.tsx", "export default function P() {}")?;
    write(root, "src/app/blog/[slug]/page.tsx", "export default function Post() {}")?;
    write(root, "src/app/about/layout.tsx", "export default function L() {}")?;
    write(root, "docs/guide.md", GUIDE_MD)?;
    write(root, "public/logo.png", "png")?;
    write(root, "public/sw.js", "self.addEventListener('fetch', () => {});")?;
    write(root, ".next/BUILD_ID", "build-1\n")?;
    write(root, ".next/static/chunks/main-abc.js", "console.log(1)")?;
    Ok(())
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

#[test]
fn manifest_lists_routes_assets_and_documents() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let root = temp.path();
    scaffold_site(root)?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("dexie-offline");
    cmd.args(["manifest", "--root"])
        .arg(root)
        .assert()
        .success()
        .stderr(predicate::str::contains("offline manifest written"));

    let manifest = read_json(&root.join("public/offline-manifest.json"))?;
    let routes = manifest["routes"].as_array().expect("routes");
    for expected in ["/", "/about", "/pricing", "/docs", "/docs/guide"] {
        assert!(
            routes.iter().any(|r| r == expected),
            "missing route {expected}: {routes:?}"
        );
    }
    assert!(!routes.iter().any(|r| r.as_str().is_some_and(|r| r.contains('['))));

    let assets = manifest["assets"].as_array().expect("assets");
    assert!(assets.iter().any(|a| a == "/logo.png"));
    assert!(assets.iter().any(|a| a == "/_next/static/chunks/main-abc.js"));
    assert!(!assets.iter().any(|a| a == "/sw.js"));
    assert!(!assets.iter().any(|a| a == "/offline-manifest.json"));

    let metas = manifest["fullTextMetas"].as_array().expect("fullTextMetas");
    assert_eq!(metas.len(), 1);
    let guide = &metas[0];
    assert_eq!(guide["route"], "/docs/guide");
    assert_eq!(guide["title"], "Guide");
    assert_eq!(guide["mdFileHash"].as_str().map(str::len), Some(64));

    let sections = guide["sections"].as_array().expect("sections");
    assert_eq!(sections.len(), 2);
    assert_eq!(sections[0]["level"], 1);
    assert_eq!(sections[0]["title"], "Intro");
    assert_eq!(sections[0]["slug"], "intro");
    assert!(sections[0]["content"].as_str().unwrap_or_default().contains("Hello world."));
    assert_eq!(sections[1]["level"], 2);
    assert_eq!(sections[1]["title"], "Setup");
    assert_eq!(sections[1]["slug"], "setup");
    assert!(sections[1]["content"].as_str().unwrap_or_default().contains("`npm i`"));

    let index = read_json(&root.join("public/search-index/docs/guide.json"))?;
    assert_eq!(&index, guide);
    assert!(!root.join("public/offline-manifest.json.lock").exists());
    Ok(())
}

#[test]
fn rebuilding_keeps_the_same_routes_and_assets() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let root = temp.path();
    scaffold_site(root)?;

    let mut snapshots = Vec::new();
    for _ in 0..2 {
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("dexie-offline");
        cmd.args(["manifest", "--root"]).arg(root).assert().success();
        let mut manifest = read_json(&root.join("public/offline-manifest.json"))?;
        if let Some(obj) = manifest.as_object_mut() {
            obj.remove("generatedAt");
        }
        snapshots.push(manifest);
    }
    assert_eq!(snapshots[0], snapshots[1]);
    Ok(())
}

#[test]
fn no_full_text_omits_documents() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let root = temp.path();
    scaffold_site(root)?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("dexie-offline");
    cmd.args(["manifest", "--no-full-text", "--root"])
        .arg(root)
        .assert()
        .success();

    let manifest = read_json(&root.join("public/offline-manifest.json"))?;
    assert!(manifest.get("fullTextMetas").is_none());
    assert!(!root.join("public/search-index").exists());
    Ok(())
}

#[test]
fn sections_prints_the_document_record() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    write(temp.path(), "guide.md", GUIDE_MD)?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("dexie-offline");
    cmd.args(["sections", "--input"])
        .arg(temp.path().join("guide.md"))
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""slug": "setup""#))
        .stdout(predicate::str::contains(r#""title": "Guide""#));
    Ok(())
}

#[test]
fn sections_reports_unclosed_front_matter() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    write(temp.path(), "broken.md", "---\ntitle: Broken\n# Heading\n")?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("dexie-offline");
    cmd.args(["sections", "--input"])
        .arg(temp.path().join("broken.md"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("front matter is not closed"));
    Ok(())
}

#[test]
fn rust_log_debug_emits_debug_line_to_stderr() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("dexie-offline");
    cmd.env("RUST_LOG", "debug")
        .args(["manifest", "--root"])
        .arg(temp.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("parsed cli"));
    Ok(())
}
