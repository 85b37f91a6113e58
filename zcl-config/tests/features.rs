mod common;

use common::Fixture;
use zcl_config::feature::ElementUpdate;
use zcl_config::resolver::feature_map_value;
use zcl_config::session::{set_attribute_state, set_cluster_state};
use zcl_config::{toggle_feature, Error};
use zcl_data_model::Side;

const LIGHTING_PREFIX: &str =
    "Check Feature Compliance on endpoint: 1, cluster: OnOff, feature: Lighting (bit 0 in featureMap attribute)";

fn update(kind: &'static str, name: &str, enabled: bool) -> ElementUpdate {
    ElementUpdate {
        kind,
        name: name.into(),
        enabled,
    }
}

#[test]
fn disabling_a_mandatory_feature() {
    let fixture = Fixture::new(&["general.zcl"]);
    let (et, endpoint) = fixture.endpoint(1, &["OnOffLight"]);
    let on_off = fixture.cluster("OnOff");
    let on_time = fixture.attribute("OnOff", "onTime");
    assert_eq!(fixture.read(|db| feature_map_value(db, et, on_off, Side::Server)), 1);

    let outcome = fixture.write(|db| toggle_feature(db, endpoint, on_off, Side::Server, "LT", false));

    assert!(!outcome.disable_change);
    assert!(outcome.display_warning);
    assert_eq!(
        outcome.warnings,
        vec![format!(
            "{} should be enabled, as it is mandatory for device type: OnOffLight",
            LIGHTING_PREFIX
        )]
    );
    assert_eq!(outcome.feature_map, 0);
    assert_eq!(
        outcome.updated,
        vec![
            update("attribute", "globalSceneControl", false),
            update("attribute", "onTime", false),
            update("attribute", "offWaitTime", false),
            update("attribute", "startUpOnOff", false),
            update("command", "OffWithEffect", false),
            update("command", "OnWithRecallGlobalScene", false),
        ]
    );

    fixture.read(|db| {
        assert!(!db.is_attribute_included(et, on_time));
        assert_eq!(feature_map_value(db, et, on_off, Side::Server), 0);
    });
    assert_eq!(
        fixture.messages_containing("Check Feature Compliance"),
        vec![format!(
            "{} should be enabled, as it is mandatory for device type: OnOffLight",
            LIGHTING_PREFIX
        )]
    );

    let outcome = fixture.write(|db| toggle_feature(db, endpoint, on_off, Side::Server, "LT", true));
    assert!(!outcome.display_warning);
    assert_eq!(outcome.feature_map, 1);
    assert_eq!(outcome.updated.len(), 6);
    assert!(outcome.updated.iter().all(|u| u.enabled));
    assert!(fixture.messages().is_empty(), "{:?}", fixture.messages());
}

#[test]
fn enabling_an_optional_feature_disables_unsupported_elements() {
    let fixture = Fixture::new(&["general.zcl"]);
    let (_, endpoint) = fixture.endpoint(1, &["OnOffLight"]);
    let on_off = fixture.cluster("OnOff");

    let outcome =
        fixture.write(|db| toggle_feature(db, endpoint, on_off, Side::Server, "OFFONLY", true));

    assert!(!outcome.disable_change);
    assert!(outcome.warnings.is_empty());
    assert_eq!(outcome.feature_map, 0b101);
    assert_eq!(
        outcome.updated,
        vec![update("command", "On", false), update("command", "Toggle", false)]
    );
    // Toggle is still required by the device type
    assert_eq!(
        fixture.messages(),
        vec!["Check Spec Compliance on endpoint: 1, device type: OnOffLight, cluster: OnOff, command: Toggle needs to be enabled"]
    );
}

#[test]
fn unknown_feature_dependencies_refuse_the_toggle() {
    let fixture = Fixture::new(&["general.zcl"]);
    let (et, endpoint) = fixture.endpoint(1, &["OnOffLight"]);
    let on_off = fixture.cluster("OnOff");

    let outcome = fixture.write(|db| toggle_feature(db, endpoint, on_off, Side::Server, "DF", true));

    assert!(outcome.disable_change);
    assert!(outcome.display_warning);
    assert!(outcome.updated.is_empty());
    assert_eq!(
        outcome.warnings,
        vec!["Check Feature Compliance on endpoint: 1, cluster: OnOff, feature: DeadFrontBehavior (bit 1 in featureMap attribute) cannot be enabled as its conformance depends on non device type features OFFONLY with unknown values"]
    );
    assert_eq!(fixture.read(|db| feature_map_value(db, et, on_off, Side::Server)), 1);
}

#[test]
fn described_elements_refuse_the_toggle() {
    let fixture = Fixture::new(&["general.zcl"]);
    let (et, endpoint) = fixture.endpoint(1, &["DimmableLight"]);
    let level = fixture.cluster("LevelControl");
    assert_eq!(fixture.read(|db| feature_map_value(db, et, level, Side::Server)), 0b11);

    let outcome = fixture.write(|db| toggle_feature(db, endpoint, level, Side::Server, "FQ", true));

    assert!(outcome.disable_change);
    assert_eq!(
        outcome.warnings,
        vec!["Check Feature Compliance on endpoint: 1, cluster: LevelControl, feature: Frequency (bit 2 in featureMap attribute) cannot be enabled as attribute currentFrequency depend on the feature and their conformance are too complex to parse."]
    );
    assert_eq!(fixture.read(|db| feature_map_value(db, et, level, Side::Server)), 0b11);
}

#[test]
fn features_of_clusters_without_device_type_features() {
    let fixture = Fixture::new(&["general.zcl"]);
    let (et, endpoint) = fixture.endpoint(1, &["OnOffLight"]);
    let groups = fixture.cluster("Groups");
    fixture.write(|db| set_cluster_state(db, et, groups, Side::Server, true));

    let outcome = fixture.write(|db| toggle_feature(db, endpoint, groups, Side::Server, "GN", true));

    assert!(!outcome.disable_change);
    assert_eq!(outcome.feature_map, 1);
    assert!(outcome.updated.is_empty());
}

#[test]
fn toggle_errors() {
    let fixture = Fixture::new(&["general.zcl"]);
    let (_, endpoint) = fixture.endpoint(1, &["OnOffLight"]);
    let on_off = fixture.cluster("OnOff");
    let identify = fixture.cluster("Identify");

    let err = fixture
        .store
        .transaction(|db| toggle_feature(db, endpoint, on_off, Side::Server, "XX", true))
        .unwrap_err();
    assert!(matches!(err, Error::FeatureCodeNotFound { .. }));

    let err = fixture
        .store
        .transaction(|db| toggle_feature(db, endpoint, identify, Side::Server, "LT", true))
        .unwrap_err();
    assert!(matches!(err, Error::FeatureCodeNotFound { .. } | Error::NoFeatureMap(_)));
}

#[test]
fn element_warnings_name_the_device_type() {
    let fixture = Fixture::new(&["element-conformance.zcl"]);
    let (et, _) = fixture.endpoint(1, &["AlarmPanel"]);
    let first = fixture.attribute("Alarms", "first");

    fixture.write(|db| set_attribute_state(db, et, first, false));

    let mut messages = fixture.messages_containing("Check Feature Compliance");
    messages.sort();
    assert_eq!(
        messages,
        vec![
            "Check Feature Compliance on endpoint: 1, cluster: Alarms, attribute: first has mandatory conformance to AL and should be enabled when feature: AL is enabled for device type: AlarmPanel.",
            "Check Feature Compliance on endpoint: 1, cluster: Alarms, attribute: second has mandatory conformance to first and should be disabled when element: first is disabled for device type: AlarmPanel.",
        ]
    );
}
