use super::*;
use std::fs;

fn write_manifest(dir: &Path, text: &str) -> PathBuf {
    let path = dir.join("kestrun.json");
    fs::write(&path, text).unwrap();
    path
}

#[test]
fn test_overrides_take_precedence() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_manifest(
        dir.path(),
        r#"{ "host": { "bind": "127.0.0.1:5000", "min_runspaces": 1, "max_runspaces": 4 } }"#,
    );

    let overrides = Overrides {
        bind: Some("0.0.0.0:9000".parse().unwrap()),
        max_runspaces: Some(8),
        ..Overrides::default()
    };
    let manifest = load_manifest(&path, &overrides).unwrap();
    assert_eq!(manifest.host.bind.port(), 9000);
    assert_eq!(manifest.host.min_runspaces, 1);
    assert_eq!(manifest.host.max_runspaces, 8);
}

#[test]
fn test_manifest_dir() {
    assert_eq!(manifest_dir(Path::new("kestrun.json")), PathBuf::from("."));
    assert_eq!(manifest_dir(Path::new("conf/kestrun.json")), PathBuf::from("conf"));
}

#[test]
fn test_build_host_resolves_script_files() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("scripts")).unwrap();
    fs::write(dir.path().join("scripts/hello.js"), "Response.writeText('hello');").unwrap();
    let path = write_manifest(
        dir.path(),
        r#"{ "routes": [ { "pattern": "/hello", "language": "JavaScript", "file": "scripts/hello.js" } ] }"#,
    );

    let host = build_host(&path, &Overrides::default()).unwrap();
    assert_eq!(host.routes().len(), 1);
}

#[test]
fn test_check_reports_diagnostics() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_manifest(
        dir.path(),
        r#"{ "routes": [
            { "pattern": "/ok", "language": "rhai", "code": "Response.write_text(\"ok\");" },
            { "pattern": "/bad", "language": "rhai", "code": "let x = ;" }
        ] }"#,
    );

    let report = check(&path).unwrap();
    assert!(!report.is_ok());
    assert_eq!(report.routes, 2);
    assert!(!report.diagnostics.is_empty());

    let json = report.to_json();
    assert_eq!(json["ok"], false);
    assert!(json["diagnostics"][0]["line"].is_number());
}

#[test]
fn test_check_passes_clean_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_manifest(
        dir.path(),
        r#"{ "routes": [ { "pattern": "/ok", "language": "js", "code": "Response.writeText('ok');" } ] }"#,
    );

    let report = check(&path).unwrap();
    assert!(report.is_ok());
    assert_eq!(report.to_json()["routes"], 1);
}

#[test]
fn test_missing_manifest_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(check(&dir.path().join("missing.json")).is_err());
}
