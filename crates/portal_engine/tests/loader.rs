use std::fs;
use std::path::Path;

use portal_engine::{DescriptorLoader, LoadError};
use pretty_assertions::assert_eq;

const VALID: &str = r#"(
    id: "records",
    name: "Records Office",
    base_url: "https://records.example",
    login_url: "https://records.example/login",
    query_url: "https://records.example/search?q={query}",
    query: UrlTemplate,
)"#;

#[test]
fn broken_files_are_skipped_and_reported() {
    portal_logging::initialize_for_tests();
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("records.ron"), VALID).unwrap();
    fs::write(dir.path().join("broken.ron"), "( id: ").unwrap();
    fs::write(dir.path().join("renamed.ron"), VALID).unwrap();
    fs::write(dir.path().join("notes.txt"), "not a plugin").unwrap();

    let (registry, report) = DescriptorLoader::load_dir(dir.path()).unwrap();

    assert_eq!(report.loaded, vec!["records".to_string()]);
    assert_eq!(report.skipped.len(), 2);
    assert!(matches!(report.skipped[0], LoadError::Parse { .. }));
    assert!(matches!(
        &report.skipped[1],
        LoadError::IdMismatch { id, .. } if id == "records"
    ));
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.get("records").unwrap().name, "Records Office");
}

#[test]
fn invalid_descriptor_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad-url.ron");
    fs::write(
        &path,
        VALID
            .replace("\"records\"", "\"bad-url\"")
            .replace("https://records.example/login", "not a url"),
    )
    .unwrap();

    assert!(matches!(
        DescriptorLoader::load_file(&path),
        Err(LoadError::Invalid { .. })
    ));
}

#[test]
fn missing_directory_fails_the_load() {
    let dir = tempfile::tempdir().unwrap();
    let err = DescriptorLoader::load_dir(&dir.path().join("absent")).unwrap_err();
    assert!(matches!(err, LoadError::Directory { .. }));
}

#[test]
fn bundled_plugins_load_cleanly() {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../plugins");
    let (registry, report) = DescriptorLoader::load_dir(&dir).unwrap();

    assert!(report.skipped.is_empty(), "{:?}", report.skipped);
    assert!(!registry.is_empty());
    for descriptor in registry.list() {
        assert!(descriptor.validate().is_ok(), "{}", descriptor.id);
    }
}
