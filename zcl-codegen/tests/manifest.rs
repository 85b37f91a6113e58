mod common;

use common::*;
use zcl_codegen::manifest::{template_iterator, HELPER_ALIASES, OUTPUT_OPTIONS};
use zcl_codegen::{read_manifest, GenerationError};
use zcl_config::model::{EntityKind, PackageType};
use zcl_config::package::{
    child_packages, extension_properties, extension_value, option_default, package_options,
};
use zcl_config::FEATURE_LEVEL;

#[test]
fn manifest_records_one_package_per_file() {
    let fixture = Fixture::new();
    let manifest = fixture.manifest("gen-templates.json");

    fixture.read(|db| {
        let package = db.package(manifest).unwrap();
        assert_eq!(package.package_type, PackageType::TemplateManifest);
        assert_eq!(package.version.as_deref(), Some("1.0"));
        assert_eq!(package.category.as_deref(), Some("test"));

        let children = child_packages(db, manifest);
        let count = |t: PackageType| children.iter().filter(|p| p.package_type == t).count();
        // the ignored template is not recorded
        assert_eq!(count(PackageType::Template), 4);
        assert_eq!(count(PackageType::Helper), 1);
        assert_eq!(count(PackageType::Partial), 1);
        assert_eq!(count(PackageType::Override), 1);

        let outputs: Vec<_> = children
            .iter()
            .filter(|p| p.package_type == PackageType::Template)
            .filter_map(|p| p.category.as_deref())
            .collect();
        assert!(outputs.contains(&"endpoint_config.h"));
        assert!(!outputs.contains(&"unused.txt"));

        let partial = children
            .iter()
            .find(|p| p.package_type == PackageType::Partial)
            .unwrap();
        assert_eq!(partial.category.as_deref(), Some("header"));
    });
}

#[test]
fn reloading_an_unchanged_manifest_keeps_its_package() {
    let fixture = Fixture::new();
    let first = fixture.manifest("gen-templates.json");
    let packages = fixture.read(|db| db.packages.len());

    let second = fixture.manifest("gen-templates.json");
    assert_eq!(first, second);
    assert_eq!(fixture.read(|db| db.packages.len()), packages);
}

#[test]
fn manifest_hash_covers_referenced_files() {
    let plan = read_manifest(&template("gen-templates.json")).unwrap();
    let again = read_manifest(&template("gen-templates.json")).unwrap();
    assert_eq!(plan.hash, again.hash);
    assert_eq!(plan.hash.len(), 64);

    let dir = tempfile::tempdir().unwrap();
    let manifest = dir.path().join("manifest.json");
    std::fs::write(
        &manifest,
        r#"{ "name": "t", "templates": [{ "path": "a.zapt", "output": "a.txt" }] }"#,
    )
    .unwrap();
    std::fs::write(dir.path().join("a.zapt"), "first").unwrap();
    let before = read_manifest(&manifest).unwrap();
    std::fs::write(dir.path().join("a.zapt"), "second").unwrap();
    let after = read_manifest(&manifest).unwrap();
    assert_ne!(before.hash, after.hash);
}

#[test]
fn changed_manifest_replaces_its_package() {
    let fixture = Fixture::empty();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manifest.json");
    let write = |output: &str| {
        std::fs::write(
            &path,
            format!(
                r#"{{ "name": "t", "templates": [{{ "path": "a.zapt", "output": "{}" }}] }}"#,
                output
            ),
        )
        .unwrap()
    };
    std::fs::write(dir.path().join("a.zapt"), "text").unwrap();

    write("first.txt");
    let plan = read_manifest(&path).unwrap();
    let first = fixture
        .store
        .transaction(|db| zcl_codegen::record_manifest(db, &plan))
        .unwrap();

    write("second.txt");
    let plan = read_manifest(&path).unwrap();
    let second = fixture
        .store
        .transaction(|db| zcl_codegen::record_manifest(db, &plan))
        .unwrap();

    assert_ne!(first, second);
    fixture.read(|db| {
        assert!(db.package(first).is_err());
        let outputs: Vec<_> = child_packages(db, second)
            .into_iter()
            .filter_map(|p| p.category.clone())
            .collect();
        assert_eq!(outputs, vec!["second.txt".to_string()]);
        assert_eq!(
            db.packages
                .values()
                .filter(|p| p.package_type == PackageType::Template)
                .count(),
            1
        );
    });
}

#[test]
fn options_and_defaults_are_recorded() {
    let fixture = Fixture::new();
    let manifest = fixture.manifest("gen-templates.json");

    fixture.read(|db| {
        let codes: Vec<(&str, &str)> = package_options(db, manifest, "manufacturerCodes")
            .into_iter()
            .map(|o| (o.code.as_str(), o.label.as_str()))
            .collect();
        assert_eq!(codes, vec![("0x1002", "Example Corp"), ("0x1234", "Other Corp")]);
        assert_eq!(option_default(db, manifest, "manufacturerCodes"), Some("0x1002"));

        let generator: Vec<&str> = package_options(db, manifest, "generator")
            .into_iter()
            .map(|o| o.code.as_str())
            .collect();
        assert_eq!(generator, vec!["namespace", "style"]);

        let aliases: Vec<&str> = package_options(db, manifest, HELPER_ALIASES)
            .into_iter()
            .map(|o| o.code.as_str())
            .collect();
        assert_eq!(aliases, vec!["string", "zcl"]);
    });
}

#[test]
fn iterator_is_an_output_option_of_its_template() {
    let fixture = Fixture::new();
    let manifest = fixture.manifest("gen-templates.json");

    fixture.read(|db| {
        for template in child_packages(db, manifest) {
            let expected = match template.category.as_deref() {
                Some("cluster-{name}.txt") => Some("cluster"),
                _ => None,
            };
            assert_eq!(template_iterator(db, template.id), expected);
        }
        assert!(db
            .package_options
            .iter()
            .filter(|o| o.category == OUTPUT_OPTIONS)
            .all(|o| o.code == "iterator"));
    });
}

#[test]
fn extensions_resolve_per_entity_with_global_default() {
    let fixture = Fixture::new();
    let manifest = fixture.manifest("gen-templates.json");

    fixture.read(|db| {
        let properties: Vec<&str> = extension_properties(db, manifest, EntityKind::Cluster)
            .into_iter()
            .map(|e| e.property.as_str())
            .collect();
        assert_eq!(properties, vec!["implementation"]);

        let cluster = |code| extension_value(db, manifest, EntityKind::Cluster, "implementation", code, None);
        assert_eq!(cluster(6), Some("on-off-server"));
        assert_eq!(cluster(8), Some("none"));

        let storage = |code, cluster| {
            extension_value(db, manifest, EntityKind::Attribute, "storage", code, Some(cluster))
        };
        assert_eq!(storage(0, 6), Some("nvm"));
        assert_eq!(storage(0, 8), Some("ram"));
        assert_eq!(storage(0x4000, 6), Some("ram"));

        // the entry without an attribute code is dropped
        assert_eq!(
            db.package_extension_defaults
                .iter()
                .filter(|d| d.package == manifest && d.property == "storage")
                .count(),
            1
        );
    });
}

#[test]
fn extension_problems_become_package_warnings() {
    let fixture = Fixture::new();
    let plan = read_manifest(&template("extension-warnings.json")).unwrap();
    assert_eq!(plan.warnings.len(), 3, "{:?}", plan.warnings);

    let manifest = fixture.manifest("extension-warnings.json");
    let messages = fixture.package_messages(manifest);
    assert_eq!(messages.len(), 3);
    assert!(messages
        .iter()
        .any(|m| m == "Unknown entity type in zcl extensions: widget"));
    assert!(messages
        .iter()
        .any(|m| m == "Invalid file! Failed to load defaults from: missing-defaults.json"));
    assert!(messages
        .iter()
        .any(|m| m == "Invalid file format! Failed to load defaults from: manufacturers.json"));

    // properties with unusable defaults are still declared
    fixture.read(|db| {
        assert_eq!(extension_properties(db, manifest, EntityKind::Command).len(), 2);
        assert_eq!(
            extension_value(db, manifest, EntityKind::Command, "timeout", 0, Some(6)),
            Some("10")
        );
    });
}

#[test]
fn manifest_for_a_newer_generator_is_rejected() {
    match read_manifest(&template("future.json")) {
        Err(GenerationError::FeatureLevel {
            required,
            supported,
            ..
        }) => {
            assert_eq!(required, 999);
            assert_eq!(supported, FEATURE_LEVEL);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn unknown_iterator_is_rejected() {
    let err = read_manifest(&template("bad-iterator.json")).unwrap_err();
    assert!(matches!(err, GenerationError::InvalidManifest { .. }), "{:?}", err);
    assert!(err.to_string().contains("unknown iterator 'endpoint'"));
}

#[test]
fn unknown_helper_group_is_rejected() {
    let err = read_manifest(&template("bad-alias.json")).unwrap_err();
    assert!(err.to_string().contains("builtin:nothing"), "{}", err);
}

#[test]
fn missing_manifest_is_an_io_error() {
    let err = read_manifest(&template("no-such-manifest.json")).unwrap_err();
    assert!(matches!(err, GenerationError::Io { .. }), "{:?}", err);
}
