//! Session export and import.
//!
//! Entities are written by code rather than row id, so a file can be
//! imported into a store that loaded the same packages in another order.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zcl_data_model::Side;

use crate::consistency;
use crate::error::{Error, Result};
use crate::ids::*;
use crate::model::{EndpointTypeDevice, NotificationScope, Origin, Reporting, Rule};
use crate::notification::{self, Draft};
use crate::package::find_package;
use crate::session;
use crate::store::{Db, Tables};
use crate::FEATURE_LEVEL;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFile {
    /// Seconds since the unix epoch
    pub write_time: u64,
    pub creator: String,
    pub feature_level: u32,
    pub key_value_pairs: Vec<KeyValue>,
    #[serde(default)]
    pub packages: Vec<PathBuf>,
    pub endpoint_types: Vec<EndpointTypeRecord>,
    #[serde(default)]
    pub endpoints: Vec<EndpointRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointTypeRecord {
    /// Index referenced by [`EndpointRecord::endpoint_type_id`]
    pub endpoint_type_id: u64,
    pub name: String,
    pub device_types: Vec<DeviceRecord>,
    pub clusters: Vec<ClusterRecord>,
    pub attributes: Vec<AttributeRecord>,
    pub commands: Vec<CommandRecord>,
    #[serde(default)]
    pub events: Vec<EventRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: Option<String>,
    pub code: u64,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRecord {
    pub name: String,
    pub code: u64,
    pub manufacturer_code: Option<u64>,
    pub side: Side,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeRecord {
    pub name: String,
    pub cluster_code: u64,
    pub code: u64,
    pub side: Side,
    pub included: bool,
    pub default_value: Option<String>,
    pub reporting: Option<Reporting>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub name: String,
    pub cluster_code: u64,
    pub code: u64,
    pub source: Side,
    /// Cluster side the command is enabled on
    pub side: Side,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub name: String,
    pub cluster_code: u64,
    pub code: u64,
    pub included: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRecord {
    pub endpoint_type_id: u64,
    pub endpoint_id: u32,
    pub network_id: u16,
    pub profile_id: u16,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn cluster_code(db: &Tables, cluster: Option<ClusterId>) -> Option<u64> {
    cluster.and_then(|c| db.clusters.get(&c)).map(|c| c.code)
}

/// Captures a session. The session is marked clean afterwards.
pub fn export_session(db: &mut Tables, session: SessionId, creator: &str) -> Result<SessionFile> {
    let row = db.session(session)?;
    let key_value_pairs = row
        .key_values
        .iter()
        .map(|(key, value)| KeyValue {
            key: key.clone(),
            value: value.clone(),
        })
        .collect();
    let packages = row
        .packages
        .iter()
        .filter_map(|p| db.packages.get(p))
        .map(|p| p.path.clone())
        .collect();

    let mut endpoint_types = Vec::new();
    let mut index = std::collections::BTreeMap::new();
    for (position, endpoint_type) in db.endpoint_types_of(session).enumerate() {
        let et = endpoint_type.id;
        index.insert(et, position as u64);

        let device_types = endpoint_type
            .devices
            .iter()
            .map(|d| DeviceRecord {
                name: d
                    .device_type
                    .and_then(|id| db.device_types.get(&id))
                    .map(|d| d.name.clone()),
                code: d.code,
                version: d.version,
            })
            .collect();

        let clusters = db
            .endpoint_type_clusters
            .values()
            .filter(|c| c.endpoint_type == et)
            .filter_map(|c| {
                let cluster = db.clusters.get(&c.cluster)?;
                Some(ClusterRecord {
                    name: cluster.name.clone(),
                    code: cluster.code,
                    manufacturer_code: cluster.manufacturer_code,
                    side: c.side,
                    enabled: c.enabled,
                })
            })
            .collect();

        let attributes = db
            .endpoint_type_attributes
            .values()
            .filter(|a| a.endpoint_type == et)
            .filter_map(|a| {
                let attribute = db.attributes.get(&a.attribute)?;
                Some(AttributeRecord {
                    name: attribute.name.clone(),
                    cluster_code: cluster_code(db, attribute.cluster)?,
                    code: attribute.code,
                    side: attribute.side,
                    included: a.included,
                    default_value: a.default_value.clone(),
                    reporting: db
                        .endpoint_type_reportable_attributes
                        .get(&(et, a.attribute))
                        .map(|r| r.reporting),
                })
            })
            .collect();

        let commands = db
            .endpoint_type_commands
            .values()
            .filter(|c| c.endpoint_type == et)
            .filter_map(|c| {
                let command = db.commands.get(&c.command)?;
                Some(CommandRecord {
                    name: command.name.clone(),
                    cluster_code: cluster_code(db, command.cluster)?,
                    code: command.code,
                    source: command.source,
                    side: c.side,
                    enabled: c.enabled,
                })
            })
            .collect();

        let events = db
            .endpoint_type_events
            .values()
            .filter(|e| e.endpoint_type == et)
            .filter_map(|e| {
                let event = db.events.get(&e.event)?;
                Some(EventRecord {
                    name: event.name.clone(),
                    cluster_code: cluster_code(db, event.cluster)?,
                    code: event.code,
                    included: e.included,
                })
            })
            .collect();

        endpoint_types.push(EndpointTypeRecord {
            endpoint_type_id: position as u64,
            name: endpoint_type.name.clone(),
            device_types,
            clusters,
            attributes,
            commands,
            events,
        });
    }

    let endpoints = db
        .endpoints_of(session)
        .filter_map(|e| {
            Some(EndpointRecord {
                endpoint_type_id: *index.get(&e.endpoint_type)?,
                endpoint_id: e.identifier,
                network_id: e.network,
                profile_id: e.profile,
            })
        })
        .collect();

    let file = SessionFile {
        write_time: now(),
        creator: creator.to_string(),
        feature_level: FEATURE_LEVEL,
        key_value_pairs,
        packages,
        endpoint_types,
        endpoints,
    };
    session::set_dirty(db, session, false)?;
    Ok(file)
}

pub fn export_session_to_file(
    db: &mut Tables,
    session: SessionId,
    creator: &str,
    path: &Path,
) -> Result<()> {
    let file = export_session(db, session, creator)?;
    let json = serde_json::to_string_pretty(&file)?;
    fs::write(path, json).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!(%session, path = %path.display(), "session exported");
    Ok(())
}

/// Creates a new session from an exported one.
///
/// Recorded enablement rows are applied as they are, without resolving
/// device type defaults again. Anything that cannot be matched against the
/// loaded packages is reported as a session notification.
pub fn import_session(db: &mut Db, file: &SessionFile, key: &str) -> Result<SessionId> {
    db.transaction(|db| {
        let session = session::create_session(db, key);
        let mut problems = Vec::new();

        for path in &file.packages {
            match find_package(db, path, None).map(|p| p.id) {
                Some(package) => session::attach_package(db, session, package)?,
                None => {
                    warn!(path = %path.display(), "package of imported session is not loaded");
                    problems.push(Draft::warning(format!(
                        "Package {} referenced by the imported session is not loaded",
                        path.display()
                    )));
                }
            }
        }
        for kv in &file.key_value_pairs {
            session::set_key_value(db, session, &kv.key, &kv.value)?;
        }

        let packages = db.session(session)?.packages.clone();

        let mut types = std::collections::BTreeMap::new();
        for record in &file.endpoint_types {
            let devices = record
                .device_types
                .iter()
                .map(|d| EndpointTypeDevice {
                    device_type: db
                        .device_types
                        .values()
                        .find(|t| packages.contains(&t.package) && t.code == d.code)
                        .map(|t| t.id),
                    code: d.code,
                    version: d.version,
                })
                .collect();

            let et: EndpointTypeId = db.next_id();
            db.endpoint_types.insert(
                et,
                crate::model::EndpointType {
                    id: et,
                    session,
                    name: record.name.clone(),
                    devices,
                },
            );
            types.insert(record.endpoint_type_id, et);

            for c in &record.clusters {
                match find_cluster(db, &packages, c) {
                    Some(cluster) => db.upsert_cluster_state(et, cluster, c.side, c.enabled),
                    None => problems.push(missing(&record.name, "cluster", &c.name)),
                }
            }

            for a in &record.attributes {
                let Some(attribute) = find_attribute(db, &packages, a) else {
                    problems.push(missing(&record.name, "attribute", &a.name));
                    continue;
                };
                let state = db.attribute_state_mut(et, attribute)?;
                state.included = a.included;
                state.default_value = a.default_value.clone();
                if let Some(reporting) = a.reporting {
                    db.upsert_reportable(et, attribute, reporting);
                }
            }

            for c in &record.commands {
                match find_command(db, &packages, c) {
                    Some(command) => db.upsert_command_state(et, command, c.side, c.enabled),
                    None => problems.push(missing(&record.name, "command", &c.name)),
                }
            }

            for e in &record.events {
                match find_event(db, &packages, e) {
                    Some(event) => db.upsert_event_state(et, event, e.included),
                    None => problems.push(missing(&record.name, "event", &e.name)),
                }
            }
        }

        for record in &file.endpoints {
            let Some(et) = types.get(&record.endpoint_type_id).copied() else {
                problems.push(Draft::warning(format!(
                    "Endpoint {} references unknown endpoint type {}",
                    record.endpoint_id, record.endpoint_type_id
                )));
                continue;
            };
            let id = db.next_id();
            db.endpoints.insert(
                id,
                crate::model::Endpoint {
                    id,
                    session,
                    endpoint_type: et,
                    identifier: record.endpoint_id,
                    network: record.network_id,
                    profile: record.profile_id,
                },
            );
        }

        notification::reconcile(
            db,
            NotificationScope::Session(session),
            Origin {
                rule: Rule::Import,
                endpoint: None,
                package: None,
            },
            problems,
        );
        consistency::refresh_session(db, session)?;
        session::set_dirty(db, session, false)?;
        info!(%session, endpoint_types = file.endpoint_types.len(), "session imported");
        Ok(session)
    })
}

fn find_cluster(db: &Tables, packages: &[PackageId], record: &ClusterRecord) -> Option<ClusterId> {
    db.clusters
        .values()
        .find(|r| {
            packages.contains(&r.package)
                && r.code == record.code
                && r.manufacturer_code == record.manufacturer_code
        })
        .map(|r| r.id)
}

fn find_attribute(
    db: &Tables,
    packages: &[PackageId],
    record: &AttributeRecord,
) -> Option<AttributeId> {
    db.attributes
        .values()
        .find(|r| {
            packages.contains(&r.package)
                && r.code == record.code
                && r.side == record.side
                && cluster_code(db, r.cluster) == Some(record.cluster_code)
        })
        .map(|r| r.id)
}

fn find_command(db: &Tables, packages: &[PackageId], record: &CommandRecord) -> Option<CommandId> {
    db.commands
        .values()
        .find(|r| {
            packages.contains(&r.package)
                && r.code == record.code
                && r.source == record.source
                && cluster_code(db, r.cluster) == Some(record.cluster_code)
        })
        .map(|r| r.id)
}

fn find_event(db: &Tables, packages: &[PackageId], record: &EventRecord) -> Option<EventId> {
    db.events
        .values()
        .find(|r| {
            packages.contains(&r.package)
                && r.code == record.code
                && cluster_code(db, r.cluster) == Some(record.cluster_code)
        })
        .map(|r| r.id)
}

fn missing(endpoint_type: &str, kind: &str, name: &str) -> Draft {
    Draft::warning(format!(
        "Endpoint type {}: {} {} of the imported session is not defined by the loaded packages",
        endpoint_type, kind, name
    ))
}

pub fn import_session_from_file(db: &mut Db, path: &Path, key: &str) -> Result<SessionId> {
    let json = fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: SessionFile = serde_json::from_str(&json)?;
    import_session(db, &file, key)
}
