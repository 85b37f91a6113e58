//! Default enablement of an endpoint type from its device types.

use std::collections::BTreeMap;

use tracing::{debug, warn};
use zcl_data_model::conformance::{try_evaluate, Conformance};
use zcl_data_model::Side;

use crate::consistency::{cluster_elements, element_terms, ElementRef};
use crate::error::{Error, Result};
use crate::ids::*;
use crate::model::{DeviceTypeClusterRow, FeatureRow, Reporting};
use crate::store::{Db, Tables};

/// A cluster feature some device type of an endpoint type lists.
#[derive(Debug, Clone, PartialEq)]
pub struct RequiredFeature {
    pub feature: FeatureRow,
    /// Device type conformance, `M` when listed without one
    pub conformance: String,
    pub device_types: Vec<String>,
}

/// Features of `cluster` listed by the device types of `et`, ordered by bit.
pub fn required_features(db: &Tables, et: EndpointTypeId, cluster: ClusterId) -> Vec<RequiredFeature> {
    let Some(endpoint_type) = db.endpoint_types.get(&et) else {
        return Vec::new();
    };

    let mut result: Vec<RequiredFeature> = Vec::new();
    for device_type in endpoint_type.device_type_refs() {
        let Some(device) = db.device_types.get(&device_type) else {
            continue;
        };
        let requirements = db
            .device_type_clusters_of(device_type)
            .filter(|r| r.cluster == Some(cluster))
            .flat_map(|r| r.features.iter());
        for requirement in requirements {
            let Some(feature) = requirement.feature.and_then(|f| db.features.get(&f)) else {
                continue;
            };
            match result.iter_mut().find(|r| r.feature.id == feature.id) {
                Some(existing) => {
                    if !existing.device_types.contains(&device.name) {
                        existing.device_types.push(device.name.clone());
                    }
                }
                None => result.push(RequiredFeature {
                    feature: feature.clone(),
                    conformance: requirement
                        .conformance
                        .clone()
                        .unwrap_or_else(|| "M".to_string()),
                    device_types: vec![device.name.clone()],
                }),
            }
        }
    }
    result.sort_by_key(|r| r.feature.bit);
    result
}

/// Parses a decimal or `0x` prefixed hexadecimal number.
pub fn parse_number(value: &str) -> Option<u64> {
    let value = value.trim();
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Current FeatureMap value of a cluster side of an endpoint type.
pub fn feature_map_value(db: &Tables, et: EndpointTypeId, cluster: ClusterId, side: Side) -> u64 {
    let Some(attribute) = db.feature_map_attribute(cluster, side) else {
        return 0;
    };
    db.endpoint_type_attributes
        .get(&(et, attribute.id))
        .and_then(|state| state.default_value.as_deref())
        .or(attribute.default.as_deref())
        .and_then(parse_number)
        .unwrap_or(0)
}

/// Feature codes of a cluster mapped to their bit in `value`.
pub fn feature_terms(features: &[&FeatureRow], value: u64) -> BTreeMap<String, bool> {
    features
        .iter()
        .map(|f| (f.code.clone(), value & (1 << f.bit) != 0))
        .collect()
}

/// Enables the clusters, attributes, commands, events and features the
/// device types of `et` call for. Runs in a single transaction.
pub fn set_endpoint_defaults(db: &mut Db, et: EndpointTypeId) -> Result<()> {
    db.transaction(|db| resolve(db, et))
}

fn resolve(db: &mut Tables, et: EndpointTypeId) -> Result<()> {
    let endpoint_type = db.endpoint_type(et)?.clone();

    let mut requirements: Vec<DeviceTypeClusterRow> = Vec::new();
    for device_type in endpoint_type.device_type_refs() {
        let device = db.device_type(device_type)?;
        let rows: Vec<_> = db.device_type_clusters_of(device_type).cloned().collect();
        if let Some(missing) = rows.iter().find(|r| r.cluster.is_none()) {
            let err = Error::UnresolvedDeviceType {
                device_type: device.name.clone(),
                cluster: missing.cluster_name.clone(),
            };
            warn!("{}", err);
            continue;
        }
        requirements.extend(rows);
    }

    for requirement in &requirements {
        if let Some(cluster) = requirement.cluster {
            for side in requirement.sides() {
                db.upsert_cluster_state(et, cluster, side, true);
            }
        }
    }

    for requirement in &requirements {
        for attribute in &requirement.attributes {
            if let Some(id) = attribute.attribute {
                db.upsert_attribute_state(et, id, true)?;
                if attribute.is_reportable {
                    db.upsert_reportable(et, id, Reporting::default());
                }
            }
        }
        for command in requirement.commands.iter().filter_map(|c| c.command) {
            for side in requirement.sides() {
                enable_command(db, et, command, side)?;
            }
        }
    }

    for (cluster, side) in db.enabled_clusters(et) {
        let terms = feature_defaults(db, et, cluster);
        let features = db.cluster_features(cluster);
        if !features.is_empty() {
            let value: u64 = features
                .iter()
                .filter(|f| terms.get(&f.code).copied().unwrap_or(false))
                .map(|f| 1u64 << f.bit)
                .sum();
            if let Some(feature_map) = db.feature_map_attribute(cluster, side).map(|a| a.id) {
                let state = db.attribute_state_mut(et, feature_map)?;
                state.included = true;
                state.default_value = Some(value.to_string());
                debug!(%et, %cluster, %side, value, "feature map");
            }
        }

        // element conformance may name other elements, so enable until settled
        loop {
            let elements = cluster_elements(db, et, cluster, side);
            let element_terms = element_terms(&terms, &elements);
            let pending: Vec<ElementRef> = elements
                .iter()
                .filter(|e| !e.enabled && is_mandatory(&e.conformance, &element_terms))
                .map(|e| e.target)
                .collect();
            if pending.is_empty() {
                break;
            }
            for target in pending {
                match target {
                    ElementRef::Attribute(id) => db.upsert_attribute_state(et, id, true)?,
                    ElementRef::Command(id) => enable_command(db, et, id, side)?,
                    ElementRef::Event(id) => db.upsert_event_state(et, id, true),
                }
            }
        }
    }

    Ok(())
}

/// Malformed expressions are left to the consistency pass to report.
fn is_mandatory(conformance: &str, terms: &BTreeMap<String, bool>) -> bool {
    matches!(try_evaluate(conformance, terms), Ok(Conformance::Mandatory))
}

/// Enables a command, and the response of an incoming command along with it.
fn enable_command(db: &mut Tables, et: EndpointTypeId, command: CommandId, side: Side) -> Result<()> {
    let row = db.command(command)?;
    let response = row.is_incoming_on(side).then_some(row.response).flatten();
    db.upsert_command_state(et, command, side, true);
    if let Some(response) = response {
        db.upsert_command_state(et, response, side, true);
    }
    Ok(())
}

/// Feature values a fresh endpoint type starts with.
///
/// Feature conformance may reference other features, so values are
/// re-evaluated until they no longer change.
fn feature_defaults(db: &Tables, et: EndpointTypeId, cluster: ClusterId) -> BTreeMap<String, bool> {
    let features = db.cluster_features(cluster);
    let required = required_features(db, et, cluster);
    let mut terms = feature_terms(&features, 0);

    for _ in 0..=features.len() {
        let mut changed = false;
        for feature in &features {
            let conformance = required
                .iter()
                .find(|r| r.feature.id == feature.id)
                .map_or(feature.conformance.as_str(), |r| r.conformance.as_str());
            let enabled = is_mandatory(conformance, &terms);
            if terms.insert(feature.code.clone(), enabled) != Some(enabled) {
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    terms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers() {
        assert_eq!(parse_number("12"), Some(12));
        assert_eq!(parse_number("0x1F"), Some(31));
        assert_eq!(parse_number(" 0XfF "), Some(255));
        assert_eq!(parse_number("-1"), None);
        assert_eq!(parse_number("abc"), None);
    }
}
