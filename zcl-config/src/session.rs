//! Sessions, endpoint types and endpoints, and the mutations on their state.
//!
//! Every mutation marks the session dirty and is followed by a consistency
//! pass over the endpoints it affects.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};
use zcl_data_model::Side;

use crate::consistency;
use crate::error::Result;
use crate::ids::*;
use crate::model::{Endpoint, EndpointType, EndpointTypeDevice, Reporting, Session};
use crate::notification;
use crate::resolver;
use crate::store::{Db, Tables};

pub fn create_session(db: &mut Tables, key: impl Into<String>) -> SessionId {
    let id = db.next_id();
    let creation_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let key = key.into();
    info!(%id, %key, "session created");
    db.sessions.insert(
        id,
        Session {
            id,
            key,
            creation_time,
            dirty: false,
            key_values: Default::default(),
            packages: Vec::new(),
        },
    );
    id
}

pub fn find_session<'a>(db: &'a Tables, key: &str) -> Option<&'a Session> {
    db.sessions.values().find(|s| s.key == key)
}

/// Deletes a session with its endpoint types, endpoints, state rows and
/// notifications. Packages stay loaded.
pub fn destroy_session(db: &mut Db, session: SessionId) -> Result<()> {
    db.session(session)?;
    db.transaction(|db| {
        let types: Vec<EndpointTypeId> = db.endpoint_types_of(session).map(|t| t.id).collect();
        for et in types {
            db.clear_endpoint_type_state(et);
            db.endpoint_types.remove(&et);
        }
        db.endpoints.retain(|_, e| e.session != session);
        notification::clear_session(db, session);
        db.sessions.remove(&session);
        info!(%session, "session destroyed");
        Ok(())
    })
}

pub(crate) fn mark_dirty(db: &mut Tables, session: SessionId) -> Result<()> {
    db.session_mut(session)?.dirty = true;
    Ok(())
}

pub fn set_dirty(db: &mut Tables, session: SessionId, dirty: bool) -> Result<()> {
    db.session_mut(session)?.dirty = dirty;
    Ok(())
}

pub fn set_key_value(
    db: &mut Tables,
    session: SessionId,
    key: impl Into<String>,
    value: impl Into<String>,
) -> Result<()> {
    let session = db.session_mut(session)?;
    session.key_values.insert(key.into(), value.into());
    session.dirty = true;
    Ok(())
}

pub fn key_value<'a>(db: &'a Tables, session: SessionId, key: &str) -> Result<Option<&'a str>> {
    Ok(db.session(session)?.key_values.get(key).map(String::as_str))
}

/// Makes a package visible to a session. Attaching twice is a no-op.
pub fn attach_package(db: &mut Tables, session: SessionId, package: PackageId) -> Result<()> {
    db.package(package)?;
    let row = db.session_mut(session)?;
    if !row.packages.contains(&package) {
        debug!(%session, %package, "attaching package");
        row.packages.push(package);
    }
    Ok(())
}

/// Removes a package from a session. Notifications that depended on it are
/// reconciled away.
pub fn detach_package(db: &mut Db, session: SessionId, package: PackageId) -> Result<()> {
    db.transaction(|db| {
        db.session_mut(session)?.packages.retain(|p| *p != package);
        debug!(%session, %package, "detached package");
        consistency::refresh_session(db, session)?;
        Ok(())
    })
}

/// Resolves device type ids into the device tuples of an endpoint type.
pub fn devices_for(db: &Tables, device_types: &[DeviceTypeId]) -> Result<Vec<EndpointTypeDevice>> {
    device_types
        .iter()
        .map(|id| db.device_type(*id).map(EndpointTypeDevice::from))
        .collect()
}

/// Creates an endpoint type and enables its defaults.
pub fn insert_endpoint_type(
    db: &mut Db,
    session: SessionId,
    name: impl Into<String>,
    devices: Vec<EndpointTypeDevice>,
) -> Result<EndpointTypeId> {
    let name = name.into();
    db.transaction(|db| {
        mark_dirty(db, session)?;
        let id = db.next_id();
        db.endpoint_types.insert(
            id,
            EndpointType {
                id,
                session,
                name,
                devices,
            },
        );
        resolver::set_endpoint_defaults(db, id)?;
        info!(%session, %id, "endpoint type created");
        Ok(id)
    })
}

/// Replaces the device types of an endpoint type.
///
/// All derived state is dropped and recomputed from the new device types.
pub fn update_endpoint_type_devices(
    db: &mut Db,
    et: EndpointTypeId,
    devices: Vec<EndpointTypeDevice>,
) -> Result<()> {
    db.transaction(|db| {
        let session = db.endpoint_type(et)?.session;
        db.clear_endpoint_type_state(et);
        if let Some(row) = db.endpoint_types.get_mut(&et) {
            row.devices = devices;
        }
        resolver::set_endpoint_defaults(db, et)?;
        mark_dirty(db, session)?;
        consistency::refresh_endpoint_type(db, et)?;
        Ok(())
    })
}

pub fn delete_endpoint_type(db: &mut Db, et: EndpointTypeId) -> Result<()> {
    db.transaction(|db| {
        let session = db.endpoint_type(et)?.session;
        let endpoints: Vec<EndpointId> = db.endpoints_of_type(et).map(|e| e.id).collect();
        for endpoint in endpoints {
            notification::clear_endpoint(db, endpoint);
            db.endpoints.remove(&endpoint);
        }
        db.clear_endpoint_type_state(et);
        db.endpoint_types.remove(&et);
        mark_dirty(db, session)?;
        Ok(())
    })
}

/// Creates an endpoint. The identifier is not validated here, see
/// [`crate::validation::validate_endpoint`].
pub fn insert_endpoint(
    db: &mut Db,
    session: SessionId,
    identifier: u32,
    et: EndpointTypeId,
    network: u16,
    profile: u16,
) -> Result<EndpointId> {
    db.transaction(|db| {
        db.endpoint_type(et)?;
        mark_dirty(db, session)?;
        let id = db.next_id();
        db.endpoints.insert(
            id,
            Endpoint {
                id,
                session,
                endpoint_type: et,
                identifier,
                network,
                profile,
            },
        );
        consistency::refresh_endpoint(db, id)?;
        info!(%session, %id, identifier, "endpoint created");
        Ok(id)
    })
}

/// Deletes an endpoint and every notification derived for it.
pub fn delete_endpoint(db: &mut Db, endpoint: EndpointId) -> Result<()> {
    db.transaction(|db| {
        let session = db.endpoint(endpoint)?.session;
        let removed = notification::clear_endpoint(db, endpoint);
        db.endpoints.remove(&endpoint);
        mark_dirty(db, session)?;
        debug!(%endpoint, removed, "endpoint deleted");
        Ok(())
    })
}

fn after_mutation(db: &mut Tables, et: EndpointTypeId) -> Result<()> {
    let session = db.endpoint_type(et)?.session;
    mark_dirty(db, session)?;
    consistency::refresh_endpoint_type(db, et)?;
    Ok(())
}

pub fn set_cluster_state(
    db: &mut Db,
    et: EndpointTypeId,
    cluster: ClusterId,
    side: Side,
    enabled: bool,
) -> Result<()> {
    db.transaction(|db| {
        db.cluster(cluster)?;
        db.upsert_cluster_state(et, cluster, side, enabled);
        after_mutation(db, et)
    })
}

pub fn set_attribute_state(
    db: &mut Db,
    et: EndpointTypeId,
    attribute: AttributeId,
    included: bool,
) -> Result<()> {
    db.transaction(|db| {
        db.upsert_attribute_state(et, attribute, included)?;
        after_mutation(db, et)
    })
}

pub fn set_attribute_default(
    db: &mut Db,
    et: EndpointTypeId,
    attribute: AttributeId,
    value: impl Into<String>,
) -> Result<()> {
    let value = value.into();
    db.transaction(|db| {
        db.attribute_state_mut(et, attribute)?.default_value = Some(value);
        after_mutation(db, et)
    })
}

/// Sets the reporting configuration of an attribute, or removes it.
pub fn set_reporting(
    db: &mut Db,
    et: EndpointTypeId,
    attribute: AttributeId,
    reporting: Option<Reporting>,
) -> Result<()> {
    db.transaction(|db| {
        db.attribute(attribute)?;
        match reporting {
            Some(reporting) => db.upsert_reportable(et, attribute, reporting),
            None => {
                db.endpoint_type_reportable_attributes
                    .remove(&(et, attribute));
            }
        }
        after_mutation(db, et)
    })
}

pub fn set_command_state(
    db: &mut Db,
    et: EndpointTypeId,
    command: CommandId,
    side: Side,
    enabled: bool,
) -> Result<()> {
    db.transaction(|db| {
        db.command(command)?;
        db.upsert_command_state(et, command, side, enabled);
        after_mutation(db, et)
    })
}

pub fn set_event_state(db: &mut Db, et: EndpointTypeId, event: EventId, included: bool) -> Result<()> {
    db.transaction(|db| {
        db.event(event)?;
        db.upsert_event_state(et, event, included);
        after_mutation(db, et)
    })
}
