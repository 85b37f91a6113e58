//! Toggling cluster features of an endpoint.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{info, warn};
use zcl_data_model::conformance::{self, Conformance};
use zcl_data_model::Side;

use crate::consistency::{self, cluster_elements, element_terms, feature_prefix, ElementRef};
use crate::error::{Error, Result};
use crate::ids::*;
use crate::resolver::{feature_map_value, required_features, RequiredFeature};
use crate::session;
use crate::store::{Db, Tables};

/// An element switched on or off as a consequence of a feature toggle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElementUpdate {
    pub kind: &'static str,
    pub name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureToggleOutcome {
    /// The toggle was refused and nothing changed
    pub disable_change: bool,
    pub display_warning: bool,
    pub warnings: Vec<String>,
    pub updated: Vec<ElementUpdate>,
    /// FeatureMap value after the call
    pub feature_map: u64,
}

/// Turns the feature `code` of a cluster side on or off for an endpoint.
///
/// Elements whose conformance mentions the feature are brought in line with
/// it. The toggle is refused when the feature conformance depends on
/// features the device types do not list, or when an element mentioning the
/// feature has a conformance that only a description can settle.
pub fn toggle_feature(
    db: &mut Db,
    endpoint: EndpointId,
    cluster: ClusterId,
    side: Side,
    code: &str,
    enabled: bool,
) -> Result<FeatureToggleOutcome> {
    db.transaction(|db| toggle(db, endpoint, cluster, side, code, enabled))
}

fn toggle(
    db: &mut Tables,
    endpoint: EndpointId,
    cluster: ClusterId,
    side: Side,
    code: &str,
    enabled: bool,
) -> Result<FeatureToggleOutcome> {
    let endpoint_row = db.endpoint(endpoint)?.clone();
    let et = endpoint_row.endpoint_type;
    let cluster_name = db.cluster(cluster)?.name.clone();
    let feature = db
        .cluster_features(cluster)
        .into_iter()
        .find(|f| f.code == code)
        .cloned()
        .ok_or_else(|| Error::FeatureCodeNotFound {
            cluster,
            code: code.to_string(),
        })?;
    let feature_map = db
        .feature_map_attribute(cluster, side)
        .map(|a| a.id)
        .ok_or(Error::NoFeatureMap(cluster))?;

    let current = feature_map_value(db, et, cluster, side);
    let value = if enabled {
        current | (1 << feature.bit)
    } else {
        current & !(1 << feature.bit)
    };

    let mut listed = required_features(db, et, cluster);
    if listed.is_empty() {
        let device_types = device_type_names(db, et);
        listed = db
            .cluster_features(cluster)
            .into_iter()
            .map(|f| RequiredFeature {
                feature: f.clone(),
                conformance: f.conformance.clone(),
                device_types: device_types.clone(),
            })
            .collect();
    }
    let data = match listed.iter().find(|r| r.feature.id == feature.id) {
        Some(data) => data.clone(),
        None => RequiredFeature {
            conformance: feature.conformance.clone(),
            feature: feature.clone(),
            device_types: device_type_names(db, et),
        },
    };

    let mut features: BTreeMap<String, bool> = listed
        .iter()
        .map(|r| (r.feature.code.clone(), value & (1 << r.feature.bit) != 0))
        .collect();
    features.insert(feature.code.clone(), enabled);

    let elements = cluster_elements(db, et, cluster, side);
    let terms = element_terms(&features, &elements);
    let prefix = feature_prefix(endpoint_row.identifier, &cluster_name, &data);

    let mut refused = Vec::new();
    let missing = conformance::missing_terms(&data.conformance, &terms);
    if !missing.is_empty() {
        refused.push(format!(
            "{} cannot be enabled as its conformance depends on non device type features {} with unknown values",
            prefix,
            missing.join(", ")
        ));
    }

    let described: Vec<_> = elements
        .iter()
        .filter(|e| conformance::has_desc(&e.conformance) && conformance::has_term(&e.conformance, code))
        .collect();
    if !described.is_empty() {
        let names = |kind: &str| {
            described
                .iter()
                .filter(|e| e.kind == kind)
                .map(|e| e.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let parts: Vec<String> = ["attribute", "command", "event"]
            .into_iter()
            .filter_map(|kind| {
                let names = names(kind);
                (!names.is_empty()).then(|| format!("{} {}", kind, names))
            })
            .collect();
        refused.push(format!(
            "{} cannot be enabled as {} depend on the feature and their conformance are too complex to parse.",
            prefix,
            parts.join(", ")
        ));
    }

    if !refused.is_empty() {
        for message in &refused {
            warn!("{}", message);
        }
        return Ok(FeatureToggleOutcome {
            disable_change: true,
            display_warning: true,
            warnings: refused,
            updated: Vec::new(),
            feature_map: current,
        });
    }

    let warning = consistency::feature_state_warning(&prefix, &data, &features);

    let mut updated = Vec::new();
    for element in elements
        .iter()
        .filter(|e| conformance::has_term(&e.conformance, code))
    {
        let target = match conformance::evaluate(&element.conformance, &terms) {
            Conformance::Mandatory if !element.enabled => true,
            Conformance::NotSupported if element.enabled => false,
            _ => continue,
        };
        match element.target {
            ElementRef::Attribute(id) => db.upsert_attribute_state(et, id, target)?,
            ElementRef::Command(id) => db.upsert_command_state(et, id, side, target),
            ElementRef::Event(id) => db.upsert_event_state(et, id, target),
        }
        updated.push(ElementUpdate {
            kind: element.kind,
            name: element.name.clone(),
            enabled: target,
        });
    }

    let state = db.attribute_state_mut(et, feature_map)?;
    state.included = true;
    state.default_value = Some(value.to_string());
    info!(%endpoint, cluster = %cluster_name, feature = code, enabled, value, "feature toggled");

    session::mark_dirty(db, endpoint_row.session)?;
    consistency::refresh_endpoint_type(db, et)?;

    Ok(FeatureToggleOutcome {
        disable_change: false,
        display_warning: warning.is_some(),
        warnings: warning.into_iter().collect(),
        updated,
        feature_map: value,
    })
}

fn device_type_names(db: &Tables, et: EndpointTypeId) -> Vec<String> {
    db.endpoint_types
        .get(&et)
        .map(|t| {
            t.device_type_refs()
                .iter()
                .filter_map(|d| db.device_types.get(d))
                .map(|d| d.name.clone())
                .collect()
        })
        .unwrap_or_default()
}
