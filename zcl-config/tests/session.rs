mod common;

use common::{resource, Fixture};
use zcl_config::impexp::{
    export_session, export_session_to_file, import_session, import_session_from_file,
};
use zcl_config::model::Reporting;
use zcl_config::session::{
    destroy_session, insert_endpoint, key_value, set_attribute_default, set_key_value,
    set_reporting,
};
use zcl_config::validation::{validate_attribute_default, validate_endpoint};
use zcl_config::FEATURE_LEVEL;
use zcl_data_model::Side;

#[test]
fn export_marks_the_session_clean() {
    let fixture = Fixture::new(&["general.zcl"]);
    let session = fixture.session;
    fixture.endpoint(1, &["OnOffLight"]);
    fixture.write(|db| set_key_value(db, session, "commissioningMode", "on"));
    assert!(fixture.read(|db| db.session(session).unwrap().dirty));

    let file = fixture.write(|db| export_session(db, session, "zcl-config tests"));

    assert!(!fixture.read(|db| db.session(session).unwrap().dirty));
    assert_eq!(file.feature_level, FEATURE_LEVEL);
    assert_eq!(file.creator, "zcl-config tests");
    assert_eq!(file.packages, vec![resource("general.zcl")]);
    assert_eq!(file.key_value_pairs.len(), 1);
    assert_eq!(file.endpoint_types.len(), 1);
    assert_eq!(file.endpoints.len(), 1);
    assert_eq!(file.endpoints[0].endpoint_id, 1);
    assert_eq!(file.endpoint_types[0].device_types[0].code, 0x0100);
    assert!(file.endpoint_types[0]
        .clusters
        .iter()
        .any(|c| c.name == "OnOff" && c.side == Side::Server && c.enabled));
}

#[test]
fn import_recreates_the_configuration() {
    let fixture = Fixture::new(&["general.zcl", "provisional.zcl"]);
    let session = fixture.session;
    let (et, _) = fixture.endpoint(3, &["OnOffLight"]);
    let on_time = fixture.attribute("OnOff", "onTime");
    let on_off = fixture.attribute("OnOff", "onOff");
    let scenes = fixture.cluster("ScenesManagement");
    let reporting = Reporting {
        min_interval: 5,
        max_interval: 60,
        reportable_change: 1,
    };
    fixture.write(|db| {
        set_key_value(db, session, "commissioningMode", "on")?;
        set_attribute_default(db, et, on_time, "0x10")?;
        set_reporting(db, et, on_off, Some(reporting))?;
        zcl_config::session::set_cluster_state(db, et, scenes, Side::Server, true)
    });
    let original = fixture.messages();

    let file = fixture.write(|db| export_session(db, session, "test"));
    let imported = fixture.write(|db| import_session(db, &file, "copy"));

    fixture.read(|db| {
        let row = db.session(imported).unwrap();
        assert!(!row.dirty);
        assert_eq!(row.packages, db.session(session).unwrap().packages);
        assert_eq!(
            key_value(db, imported, "commissioningMode").unwrap(),
            Some("on")
        );

        let types: Vec<_> = db.endpoint_types_of(imported).collect();
        assert_eq!(types.len(), 1);
        let copy = types[0].id;
        assert_eq!(
            db.endpoint_type_attributes
                .get(&(copy, on_time))
                .and_then(|a| a.default_value.as_deref()),
            Some("0x10")
        );
        assert_eq!(
            db.endpoint_type_reportable_attributes
                .get(&(copy, on_off))
                .map(|r| r.reporting),
            Some(reporting)
        );
        assert!(db.is_cluster_enabled(copy, scenes, Side::Server));

        let endpoints: Vec<_> = db.endpoints_of(imported).map(|e| e.identifier).collect();
        assert_eq!(endpoints, vec![3]);
    });

    // the consistency pass ran for the new session
    let copied: Vec<String> = fixture.read(|db| {
        zcl_config::notification::session_notifications(db, imported)
            .into_iter()
            .map(|n| n.message.clone())
            .collect()
    });
    assert_eq!(copied, original);
}

#[test]
fn import_reports_unknown_entities() {
    let fixture = Fixture::new(&["general.zcl"]);
    let session = fixture.session;
    fixture.endpoint(1, &["OnOffLight"]);
    let mut file = fixture.write(|db| export_session(db, session, "test"));
    file.packages.push(resource("never-loaded.zcl"));
    file.endpoint_types[0].clusters[0].code = 0xBEEF;

    let imported = fixture.write(|db| import_session(db, &file, "copy"));

    let messages: Vec<String> = fixture.read(|db| {
        zcl_config::notification::session_notifications(db, imported)
            .into_iter()
            .map(|n| n.message.clone())
            .collect()
    });
    assert!(messages
        .iter()
        .any(|m| m.contains("never-loaded.zcl") && m.contains("is not loaded")));
    assert!(messages
        .iter()
        .any(|m| m.contains("is not defined by the loaded packages")));
}

#[test]
fn session_files_round_trip_through_disk() {
    let fixture = Fixture::new(&["general.zcl"]);
    let session = fixture.session;
    fixture.endpoint(1, &["OnOffLight"]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");

    fixture.write(|db| export_session_to_file(db, session, "test", &path));
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert!(json["writeTime"].as_u64().is_some());
    assert!(json["endpointTypes"].is_array());
    assert!(json["keyValuePairs"].is_array());

    let imported = fixture.write(|db| import_session_from_file(db, &path, "from disk"));
    assert_eq!(
        fixture.read(|db| db.endpoints_of(imported).count()),
        1
    );
}

#[test]
fn destroying_a_session() {
    let fixture = Fixture::new(&["general.zcl", "custom-a.zcl", "custom-b.zcl"]);
    let session = fixture.session;
    let (et, _) = fixture.endpoint(1, &["OnOffLight"]);
    assert!(!fixture.notifications().is_empty());

    fixture.write(|db| destroy_session(db, session));

    fixture.read(|db| {
        assert!(db.session(session).is_err());
        assert!(db.endpoint_type(et).is_err());
        assert!(db.endpoints.is_empty());
        assert!(db.endpoint_type_attributes.keys().all(|(t, _)| *t != et));
        // packages stay loaded
        assert_eq!(db.packages.len(), 3);
    });
}

#[test]
fn endpoint_and_attribute_validation() {
    let fixture = Fixture::new(&["general.zcl"]);
    let session = fixture.session;
    let (et, first) = fixture.endpoint(5, &["OnOffLight"]);
    let second = fixture.write(|db| insert_endpoint(db, session, 5, et, 0, 0x0104));
    let zero = fixture.write(|db| insert_endpoint(db, session, 0, et, 0, 0x0104));

    fixture.read(|db| {
        let issues = validate_endpoint(db, first).unwrap();
        assert_eq!(issues.endpoint_id, vec!["Duplicate EndpointIds Exist"]);
        assert!(validate_endpoint(db, second).unwrap().network_id.is_empty());
        assert_eq!(
            validate_endpoint(db, zero).unwrap().endpoint_id,
            vec!["0 is not a valid endpointId"]
        );
    });

    let off_wait = fixture.attribute("OnOff", "offWaitTime");
    assert!(fixture
        .read(|db| validate_attribute_default(db, et, off_wait).unwrap())
        .default_value
        .is_empty());
    fixture.write(|db| set_attribute_default(db, et, off_wait, "0xFFFF"));
    assert_eq!(
        fixture
            .read(|db| validate_attribute_default(db, et, off_wait).unwrap())
            .default_value,
        vec!["Out of range"]
    );
}
