mod common;

use std::thread;

use common::{resource, Fixture};
use zcl_config::model::NotificationType;
use zcl_config::notification::package_notifications;
use zcl_config::package::{delete_package, find_package};
use zcl_config::session::detach_package;
use zcl_config::*;

fn package_of(fixture: &Fixture, file: &str) -> PackageId {
    fixture.read(|db| find_package(db, &resource(file), None).map(|p| p.id).unwrap())
}

#[test]
fn reloading_a_file_keeps_its_package() {
    let fixture = Fixture::new(&["general.zcl", "custom-a.zcl"]);
    let (packages, clusters) = fixture.read(|db| {
        (
            db.session(fixture.session).unwrap().packages.clone(),
            db.clusters.len(),
        )
    });

    let first = package_of(&fixture, "custom-a.zcl");
    let results = fixture.load(&["custom-a.zcl"]);

    assert_eq!(results.len(), 1);
    assert!(results[0].succeeded);
    assert_eq!(results[0].package_id, Some(first));
    fixture.read(|db| {
        assert_eq!(db.session(fixture.session).unwrap().packages, packages);
        assert_eq!(db.clusters.len(), clusters);
    });
}

#[test]
fn parse_failures_do_not_stop_the_batch() {
    let fixture = Fixture::new(&[]);
    let results = fixture.load(&["broken.zcl", "general.zcl", "does-not-exist.zcl"]);

    assert!(!results[0].succeeded);
    assert!(results[0].package_id.is_none());
    assert!(results[0]
        .err
        .as_deref()
        .is_some_and(|e| e.contains("Failed to parse")));
    assert!(results[1].succeeded);
    assert!(!results[2].succeeded);
    assert_eq!(
        fixture.read(|db| db.session(fixture.session).unwrap().packages.len()),
        1
    );
}

#[test]
fn cluster_code_conflicts_name_both_files() {
    let fixture = Fixture::new(&["general.zcl", "custom-a.zcl", "custom-b.zcl"]);
    let a = resource("custom-a.zcl").display().to_string();
    let b = resource("custom-b.zcl").display().to_string();

    let errors = fixture.errors();
    let cluster: Vec<_> = errors
        .iter()
        .filter(|m| m.contains("Cluster code conflict"))
        .collect();
    assert_eq!(cluster.len(), 1, "{:?}", errors);
    assert!(cluster[0].contains(&a) && cluster[0].contains(&b));
    assert!(errors.iter().any(|m| m.contains("Command code conflict")));
    assert!(errors.iter().any(|m| m.contains("Attribute code conflict")));

    let severities: Vec<u8> = fixture
        .notifications()
        .iter()
        .filter(|n| n.kind == NotificationType::Error)
        .map(|n| n.severity)
        .collect();
    assert!(severities.iter().all(|s| *s == 1));
}

#[test]
fn deleting_a_package_clears_its_conflicts() {
    let fixture = Fixture::new(&["general.zcl", "custom-a.zcl", "custom-b.zcl"]);
    assert!(!fixture.messages_containing("code conflict").is_empty());

    let first = package_of(&fixture, "custom-a.zcl");
    fixture.write(|db| delete_package(db, first));

    assert!(fixture.messages_containing("code conflict").is_empty());
    fixture.read(|db| {
        assert!(db.package(first).is_err());
        assert!(!db.clusters.values().any(|c| c.package == first));
        assert!(!db.session(fixture.session).unwrap().packages.contains(&first));
    });
}

#[test]
fn detaching_a_package_clears_its_conflicts() {
    let fixture = Fixture::new(&["custom-a.zcl", "custom-b.zcl"]);
    let second = package_of(&fixture, "custom-b.zcl");
    let session = fixture.session;

    fixture.write(|db| detach_package(db, session, second));

    assert!(fixture.errors().is_empty());
    // still loaded, only no longer part of the session
    assert!(fixture.read(|db| db.package(second).is_ok()));
}

#[test]
fn undefined_types_are_reported_per_session_and_package() {
    let fixture = Fixture::new(&["general.zcl", "undefined-type.zcl"]);
    let path = resource("undefined-type.zcl").display().to_string();
    let expected = format!(
        "Undefined Data Type: Attribute mystery in {} has type MissingType which is not defined",
        path
    );

    assert_eq!(fixture.errors(), vec![expected.clone()]);

    let package = package_of(&fixture, "undefined-type.zcl");
    let messages: Vec<String> = fixture.read(|db| {
        package_notifications(db, package)
            .into_iter()
            .map(|n| n.message.clone())
            .collect()
    });
    assert_eq!(messages, vec![expected]);
}

#[test]
fn known_types_are_not_reported() {
    let fixture = Fixture::new(&["general.zcl"]);
    assert!(fixture.errors().is_empty(), "{:?}", fixture.errors());
}

#[test]
fn unknown_device_type_clusters_are_reported() {
    let fixture = Fixture::new(&["general.zcl", "unresolved-device.zcl"]);
    let package = package_of(&fixture, "unresolved-device.zcl");

    let messages: Vec<String> = fixture.read(|db| {
        package_notifications(db, package)
            .into_iter()
            .map(|n| n.message.clone())
            .collect()
    });
    assert_eq!(
        messages,
        vec!["Device type Widget references unknown cluster: Nonexistent"]
    );
}

#[test]
fn unknown_device_type_clusters_can_be_pruned() {
    common::init_logging();
    let store = Store::new();
    let paths = [resource("general.zcl"), resource("unresolved-device.zcl")];
    let results = load_definition_files(
        &store,
        &paths,
        &LoadOptions {
            prune_unresolved_clusters: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(results.iter().all(|r| r.succeeded));

    store
        .read(|db| {
            let widget = db.device_types.values().find(|d| d.name == "Widget").unwrap();
            let clusters: Vec<_> = db
                .device_type_clusters_of(widget.id)
                .map(|r| r.cluster_name.clone())
                .collect();
            assert_eq!(clusters, vec!["Identify"]);
            assert!(db.notifications.is_empty());
            Ok(())
        })
        .unwrap();
}

#[test]
fn references_resolve_across_files() {
    let fixture = Fixture::new(&["general.zcl"]);
    let add_group = fixture.command("Groups", "AddGroup");
    let response = fixture.command("Groups", "AddGroupResponse");

    fixture.read(|db| {
        let command = db.command(add_group).unwrap();
        assert_eq!(command.response, Some(response));
        assert_eq!(command.args.len(), 2);
        assert_eq!(command.args[1].name, "groupName");
        assert_eq!(command.args[1].max_length, Some(16));
    });
}

#[test]
fn concurrent_loads_of_the_same_file_share_a_package() {
    common::init_logging();
    let store = Store::new();
    let path = resource("general.zcl");

    let ids: Vec<Option<PackageId>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    load_definition_files(&store, &[&path], &LoadOptions::default()).unwrap()[0]
                        .package_id
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(ids.iter().all(|id| id.is_some() && *id == ids[0]));
    store
        .read(|db| {
            assert_eq!(db.packages.len(), 1);
            assert_eq!(
                db.clusters.values().filter(|c| c.name == "OnOff").count(),
                1
            );
            Ok(())
        })
        .unwrap();
}
