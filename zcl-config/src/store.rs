//! In-memory, transactional row store.
//!
//! All tables live in [`Tables`]. [`Db`] adds nestable transactions on top of
//! them by snapshotting the tables on `begin`. [`Db::transaction`] snapshots
//! only at the outermost level. [`Store`] puts a `Db` behind a lock so it can
//! be shared between threads.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::RwLock;

use tracing::trace;
use zcl_data_model::Side;

use crate::error::{Error, Result};
use crate::ids::*;
use crate::model::*;

#[derive(Debug, Clone, Default)]
pub struct Tables {
    next_id: u64,

    pub packages: BTreeMap<PackageId, Package>,
    pub package_options: Vec<PackageOption>,
    /// Selected option code per (package, category)
    pub package_option_defaults: BTreeMap<(PackageId, String), String>,
    pub package_extensions: Vec<PackageExtension>,
    pub package_extension_defaults: Vec<PackageExtensionDefault>,

    pub clusters: BTreeMap<ClusterId, ClusterRow>,
    pub attributes: BTreeMap<AttributeId, AttributeRow>,
    pub commands: BTreeMap<CommandId, CommandRow>,
    pub events: BTreeMap<EventId, EventRow>,
    pub features: BTreeMap<FeatureId, FeatureRow>,
    pub data_types: BTreeMap<DataTypeId, DataTypeRow>,
    pub device_types: BTreeMap<DeviceTypeId, DeviceTypeRow>,
    pub device_type_clusters: BTreeMap<DeviceTypeClusterId, DeviceTypeClusterRow>,

    pub sessions: BTreeMap<SessionId, Session>,
    pub endpoint_types: BTreeMap<EndpointTypeId, EndpointType>,
    pub endpoint_type_clusters: BTreeMap<(EndpointTypeId, ClusterId, Side), EndpointTypeCluster>,
    pub endpoint_type_attributes: BTreeMap<(EndpointTypeId, AttributeId), EndpointTypeAttribute>,
    pub endpoint_type_reportable_attributes:
        BTreeMap<(EndpointTypeId, AttributeId), EndpointTypeReportableAttribute>,
    pub endpoint_type_commands: BTreeMap<(EndpointTypeId, CommandId, Side), EndpointTypeCommand>,
    pub endpoint_type_events: BTreeMap<(EndpointTypeId, EventId), EndpointTypeEvent>,
    pub endpoints: BTreeMap<EndpointId, Endpoint>,

    pub notifications: BTreeMap<NotificationId, Notification>,
}

impl Tables {
    /// Allocates a fresh row id. Ids are unique across all tables.
    pub fn next_id<I: From<u64>>(&mut self) -> I {
        self.next_id += 1;
        I::from(self.next_id)
    }

    pub fn package(&self, id: PackageId) -> Result<&Package> {
        self.packages.get(&id).ok_or(Error::PackageNotFound(id))
    }

    pub fn session(&self, id: SessionId) -> Result<&Session> {
        self.sessions.get(&id).ok_or(Error::SessionNotFound(id))
    }

    pub fn session_mut(&mut self, id: SessionId) -> Result<&mut Session> {
        self.sessions.get_mut(&id).ok_or(Error::SessionNotFound(id))
    }

    pub fn cluster(&self, id: ClusterId) -> Result<&ClusterRow> {
        self.clusters.get(&id).ok_or(Error::ClusterNotFound(id))
    }

    pub fn attribute(&self, id: AttributeId) -> Result<&AttributeRow> {
        self.attributes.get(&id).ok_or(Error::AttributeNotFound(id))
    }

    pub fn command(&self, id: CommandId) -> Result<&CommandRow> {
        self.commands.get(&id).ok_or(Error::CommandNotFound(id))
    }

    pub fn event(&self, id: EventId) -> Result<&EventRow> {
        self.events.get(&id).ok_or(Error::EventNotFound(id))
    }

    pub fn device_type(&self, id: DeviceTypeId) -> Result<&DeviceTypeRow> {
        self.device_types
            .get(&id)
            .ok_or(Error::DeviceTypeNotFound(id))
    }

    pub fn endpoint_type(&self, id: EndpointTypeId) -> Result<&EndpointType> {
        self.endpoint_types
            .get(&id)
            .ok_or(Error::EndpointTypeNotFound(id))
    }

    pub fn endpoint(&self, id: EndpointId) -> Result<&Endpoint> {
        self.endpoints.get(&id).ok_or(Error::EndpointNotFound(id))
    }

    pub fn cluster_attributes(&self, cluster: ClusterId) -> impl Iterator<Item = &AttributeRow> {
        self.attributes
            .values()
            .filter(move |a| a.cluster == Some(cluster))
    }

    pub fn cluster_commands(&self, cluster: ClusterId) -> impl Iterator<Item = &CommandRow> {
        self.commands
            .values()
            .filter(move |c| c.cluster == Some(cluster))
    }

    pub fn cluster_events(&self, cluster: ClusterId) -> impl Iterator<Item = &EventRow> {
        self.events.values().filter(move |e| e.cluster == Some(cluster))
    }

    /// Features of a cluster, ordered by bit.
    pub fn cluster_features(&self, cluster: ClusterId) -> Vec<&FeatureRow> {
        let mut features: Vec<_> = self
            .features
            .values()
            .filter(|f| f.cluster == cluster)
            .collect();
        features.sort_by_key(|f| f.bit);
        features
    }

    pub fn feature_map_attribute(&self, cluster: ClusterId, side: Side) -> Option<&AttributeRow> {
        self.cluster_attributes(cluster)
            .find(|a| a.code == zcl_data_model::FEATURE_MAP_ATTRIBUTE_CODE && a.side == side)
    }

    pub fn device_type_clusters_of(
        &self,
        device_type: DeviceTypeId,
    ) -> impl Iterator<Item = &DeviceTypeClusterRow> {
        self.device_type_clusters
            .values()
            .filter(move |r| r.device_type == device_type)
    }

    pub fn endpoint_types_of(&self, session: SessionId) -> impl Iterator<Item = &EndpointType> {
        self.endpoint_types
            .values()
            .filter(move |t| t.session == session)
    }

    pub fn endpoints_of(&self, session: SessionId) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values().filter(move |e| e.session == session)
    }

    pub fn endpoints_of_type(
        &self,
        endpoint_type: EndpointTypeId,
    ) -> impl Iterator<Item = &Endpoint> {
        self.endpoints
            .values()
            .filter(move |e| e.endpoint_type == endpoint_type)
    }

    pub fn is_cluster_enabled(&self, et: EndpointTypeId, cluster: ClusterId, side: Side) -> bool {
        self.endpoint_type_clusters
            .get(&(et, cluster, side))
            .is_some_and(|c| c.enabled)
    }

    pub fn is_attribute_included(&self, et: EndpointTypeId, attribute: AttributeId) -> bool {
        self.endpoint_type_attributes
            .get(&(et, attribute))
            .is_some_and(|a| a.included)
    }

    pub fn is_command_enabled(&self, et: EndpointTypeId, command: CommandId, side: Side) -> bool {
        self.endpoint_type_commands
            .get(&(et, command, side))
            .is_some_and(|c| c.enabled)
    }

    pub fn is_event_included(&self, et: EndpointTypeId, event: EventId) -> bool {
        self.endpoint_type_events
            .get(&(et, event))
            .is_some_and(|e| e.included)
    }

    /// Enabled (cluster, side) pairs of an endpoint type.
    pub fn enabled_clusters(&self, et: EndpointTypeId) -> Vec<(ClusterId, Side)> {
        self.endpoint_type_clusters
            .values()
            .filter(|c| c.endpoint_type == et && c.enabled)
            .map(|c| (c.cluster, c.side))
            .collect()
    }

    pub fn upsert_cluster_state(
        &mut self,
        et: EndpointTypeId,
        cluster: ClusterId,
        side: Side,
        enabled: bool,
    ) {
        self.endpoint_type_clusters
            .entry((et, cluster, side))
            .and_modify(|row| row.enabled = enabled)
            .or_insert(EndpointTypeCluster {
                endpoint_type: et,
                cluster,
                side,
                enabled,
            });
    }

    /// Returns the attribute state row, creating it (not included, schema
    /// default) on first reference.
    pub fn attribute_state_mut(
        &mut self,
        et: EndpointTypeId,
        attribute: AttributeId,
    ) -> Result<&mut EndpointTypeAttribute> {
        let default_value = self.attribute(attribute)?.default.clone();
        Ok(self
            .endpoint_type_attributes
            .entry((et, attribute))
            .or_insert(EndpointTypeAttribute {
                endpoint_type: et,
                attribute,
                included: false,
                default_value,
            }))
    }

    pub fn upsert_attribute_state(
        &mut self,
        et: EndpointTypeId,
        attribute: AttributeId,
        included: bool,
    ) -> Result<()> {
        self.attribute_state_mut(et, attribute)?.included = included;
        Ok(())
    }

    pub fn upsert_command_state(
        &mut self,
        et: EndpointTypeId,
        command: CommandId,
        side: Side,
        enabled: bool,
    ) {
        self.endpoint_type_commands
            .entry((et, command, side))
            .and_modify(|row| row.enabled = enabled)
            .or_insert(EndpointTypeCommand {
                endpoint_type: et,
                command,
                side,
                enabled,
            });
    }

    pub fn upsert_event_state(&mut self, et: EndpointTypeId, event: EventId, included: bool) {
        self.endpoint_type_events
            .entry((et, event))
            .and_modify(|row| row.included = included)
            .or_insert(EndpointTypeEvent {
                endpoint_type: et,
                event,
                included,
            });
    }

    pub fn upsert_reportable(
        &mut self,
        et: EndpointTypeId,
        attribute: AttributeId,
        reporting: Reporting,
    ) {
        self.endpoint_type_reportable_attributes
            .entry((et, attribute))
            .and_modify(|row| row.reporting = reporting)
            .or_insert(EndpointTypeReportableAttribute {
                endpoint_type: et,
                attribute,
                reporting,
            });
    }

    /// Drops every enablement row of an endpoint type.
    pub fn clear_endpoint_type_state(&mut self, et: EndpointTypeId) {
        self.endpoint_type_clusters.retain(|k, _| k.0 != et);
        self.endpoint_type_attributes.retain(|k, _| k.0 != et);
        self.endpoint_type_reportable_attributes
            .retain(|k, _| k.0 != et);
        self.endpoint_type_commands.retain(|k, _| k.0 != et);
        self.endpoint_type_events.retain(|k, _| k.0 != et);
    }
}

/// Tables plus the snapshot stack backing nested transactions.
#[derive(Debug, Default)]
pub struct Db {
    tables: Tables,
    snapshots: Vec<Tables>,
}

impl Db {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self) {
        trace!(depth = self.snapshots.len(), "begin");
        self.snapshots.push(self.tables.clone());
    }

    pub fn commit(&mut self) -> Result<()> {
        trace!(depth = self.snapshots.len(), "commit");
        self.snapshots.pop().map(drop).ok_or(Error::NoTransaction)
    }

    pub fn rollback(&mut self) -> Result<()> {
        trace!(depth = self.snapshots.len(), "rollback");
        self.tables = self.snapshots.pop().ok_or(Error::NoTransaction)?;
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        !self.snapshots.is_empty()
    }

    /// Runs `f` between `begin` and `commit`, rolling back if it fails.
    ///
    /// Inside an open transaction `f` joins it instead of taking another
    /// snapshot, and an error rolls back the enclosing transaction.
    pub fn transaction<T>(&mut self, f: impl FnOnce(&mut Db) -> Result<T>) -> Result<T> {
        if self.in_transaction() {
            return f(self);
        }
        self.begin();
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                self.rollback()?;
                Err(e)
            }
        }
    }
}

impl Deref for Db {
    type Target = Tables;

    fn deref(&self) -> &Tables {
        &self.tables
    }
}

impl DerefMut for Db {
    fn deref_mut(&mut self) -> &mut Tables {
        &mut self.tables
    }
}

/// A [`Db`] shareable between threads.
#[derive(Debug, Default)]
pub struct Store {
    db: RwLock<Db>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read<T>(&self, f: impl FnOnce(&Db) -> Result<T>) -> Result<T> {
        let db = self.db.read().map_err(|_| Error::LockPoisoned)?;
        f(&db)
    }

    pub fn transaction<T>(&self, f: impl FnOnce(&mut Db) -> Result<T>) -> Result<T> {
        let mut db = self.db.write().map_err(|_| Error::LockPoisoned)?;
        db.transaction(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(db: &mut Db, key: &str) -> SessionId {
        let id = db.next_id();
        db.sessions.insert(
            id,
            Session {
                id,
                key: key.into(),
                creation_time: 0,
                dirty: false,
                key_values: BTreeMap::new(),
                packages: Vec::new(),
            },
        );
        id
    }

    #[test]
    fn rollback_restores_tables() {
        let mut db = Db::new();
        let kept = session(&mut db, "kept");

        let result: Result<()> = db.transaction(|db| {
            session(db, "dropped");
            Err(Error::SessionNotFound(SessionId(42)))
        });

        assert!(result.is_err());
        assert_eq!(db.sessions.len(), 1);
        assert!(db.sessions.contains_key(&kept));
        assert!(!db.in_transaction());
    }

    #[test]
    fn nested_transactions() {
        let mut db = Db::new();
        db.begin();
        session(&mut db, "outer");
        db.begin();
        session(&mut db, "inner");
        db.rollback().unwrap();
        assert_eq!(db.sessions.len(), 1);
        db.commit().unwrap();
        assert_eq!(db.sessions.len(), 1);
        assert!(matches!(db.commit(), Err(Error::NoTransaction)));
    }

    #[test]
    fn inner_transactions_join_the_outer_one() {
        let mut db = Db::new();
        let result: Result<()> = db.transaction(|db| {
            session(db, "outer");
            db.transaction(|db| {
                assert_eq!(db.snapshots.len(), 1);
                session(db, "inner");
                Ok(())
            })?;
            assert_eq!(db.sessions.len(), 2);
            db.transaction(|db| {
                session(db, "failing");
                Err(Error::SessionNotFound(SessionId(42)))
            })
        });

        assert!(result.is_err());
        assert!(db.sessions.is_empty());
        assert!(!db.in_transaction());
    }

    #[test]
    fn lazily_created_rows_are_unique() {
        let mut db = Db::new();
        let et = EndpointTypeId(1);
        let cluster = ClusterId(2);
        db.upsert_cluster_state(et, cluster, Side::Server, true);
        db.upsert_cluster_state(et, cluster, Side::Server, false);
        db.upsert_cluster_state(et, cluster, Side::Client, true);

        assert_eq!(db.endpoint_type_clusters.len(), 2);
        assert!(!db.is_cluster_enabled(et, cluster, Side::Server));
        assert!(db.is_cluster_enabled(et, cluster, Side::Client));
    }
}
