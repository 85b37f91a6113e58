//! Package rows and the entities they own.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::{debug, info};

use crate::consistency;
use crate::error::Result;
use crate::ids::*;
use crate::model::{EntityKind, Package, PackageExtension, PackageOption, PackageType};
use crate::notification;
use crate::store::{Db, Tables};

/// Finds the package loaded from `path` under `parent`.
pub fn find_package<'a>(
    db: &'a Tables,
    path: &Path,
    parent: Option<PackageId>,
) -> Option<&'a Package> {
    db.packages
        .values()
        .find(|p| p.path == path && p.parent == parent)
}

pub fn packages_of_type(db: &Tables, package_type: PackageType) -> Vec<&Package> {
    db.packages
        .values()
        .filter(|p| p.package_type == package_type)
        .collect()
}

pub fn child_packages(db: &Tables, parent: PackageId) -> Vec<&Package> {
    db.packages
        .values()
        .filter(|p| p.parent == Some(parent))
        .collect()
}

/// Packages whose entities a batch may reference.
///
/// Inside a session this is the batch plus the packages of the session.
/// Without one, every loaded capability library is visible.
pub fn known_packages(
    db: &Tables,
    session: Option<SessionId>,
    batch: &[PackageId],
) -> Result<BTreeSet<PackageId>> {
    let mut known: BTreeSet<PackageId> = batch.iter().copied().collect();
    match session {
        Some(session) => known.extend(db.session(session)?.packages.iter().copied()),
        None => known.extend(
            packages_of_type(db, PackageType::CapabilityLibrary)
                .into_iter()
                .map(|p| p.id),
        ),
    }
    Ok(known)
}

pub fn package_options<'a>(
    db: &'a Tables,
    package: PackageId,
    category: &str,
) -> Vec<&'a PackageOption> {
    db.package_options
        .iter()
        .filter(|o| o.package == package && o.category == category)
        .collect()
}

/// Selected option code of a category, if the manifest declared one.
pub fn option_default<'a>(db: &'a Tables, package: PackageId, category: &str) -> Option<&'a str> {
    db.package_option_defaults
        .get(&(package, category.to_string()))
        .map(String::as_str)
}

pub fn extension_properties(
    db: &Tables,
    package: PackageId,
    entity: EntityKind,
) -> Vec<&PackageExtension> {
    db.package_extensions
        .iter()
        .filter(|e| e.package == package && e.entity == entity)
        .collect()
}

/// Value of an extension property for one entity, falling back to the
/// property's global default.
pub fn extension_value<'a>(
    db: &'a Tables,
    package: PackageId,
    entity: EntityKind,
    property: &str,
    entity_code: u64,
    parent_code: Option<u64>,
) -> Option<&'a str> {
    db.package_extension_defaults
        .iter()
        .find(|d| {
            d.package == package
                && d.entity == entity
                && d.property == property
                && d.entity_code == entity_code
                && (d.parent_code.is_none() || d.parent_code == parent_code)
        })
        .map(|d| d.value.as_str())
        .or_else(|| {
            db.package_extensions
                .iter()
                .find(|e| e.package == package && e.entity == entity && e.property == property)
                .and_then(|e| e.global_default.as_deref())
        })
}

/// Ids of everything a package inserted.
#[derive(Debug, Default)]
pub(crate) struct PackageEntities {
    pub clusters: BTreeSet<ClusterId>,
    pub attributes: BTreeSet<AttributeId>,
    pub commands: BTreeSet<CommandId>,
    pub events: BTreeSet<EventId>,
    pub features: BTreeSet<FeatureId>,
    pub device_types: BTreeSet<DeviceTypeId>,
}

impl PackageEntities {
    fn of(db: &Tables, package: PackageId) -> Self {
        Self {
            clusters: db
                .clusters
                .values()
                .filter(|c| c.package == package)
                .map(|c| c.id)
                .collect(),
            attributes: db
                .attributes
                .values()
                .filter(|a| a.package == package)
                .map(|a| a.id)
                .collect(),
            commands: db
                .commands
                .values()
                .filter(|c| c.package == package)
                .map(|c| c.id)
                .collect(),
            events: db
                .events
                .values()
                .filter(|e| e.package == package)
                .map(|e| e.id)
                .collect(),
            features: db
                .features
                .values()
                .filter(|f| f.package == package)
                .map(|f| f.id)
                .collect(),
            device_types: db
                .device_types
                .values()
                .filter(|d| d.package == package)
                .map(|d| d.id)
                .collect(),
        }
    }
}

/// Removes every row a package inserted, keeping the package row itself.
///
/// References from other packages into the removed rows fall back to their
/// unlinked (by name) state, so a later link pass can resolve them again.
pub(crate) fn delete_package_entities(db: &mut Tables, package: PackageId) {
    let gone = PackageEntities::of(db, package);
    debug!(
        %package,
        clusters = gone.clusters.len(),
        attributes = gone.attributes.len(),
        commands = gone.commands.len(),
        "deleting package entities"
    );

    db.clusters.retain(|id, _| !gone.clusters.contains(id));
    db.attributes.retain(|id, _| !gone.attributes.contains(id));
    db.commands.retain(|id, _| !gone.commands.contains(id));
    db.events.retain(|id, _| !gone.events.contains(id));
    // Features of a removed cluster go with it, whichever package declared them
    db.features
        .retain(|id, f| !gone.features.contains(id) && !gone.clusters.contains(&f.cluster));
    db.data_types.retain(|_, t| t.package != package);
    db.device_types.retain(|id, _| !gone.device_types.contains(id));
    db.device_type_clusters
        .retain(|_, r| !gone.device_types.contains(&r.device_type));

    for attribute in db.attributes.values_mut() {
        if attribute.cluster.is_some_and(|c| gone.clusters.contains(&c)) {
            attribute.cluster = None;
        }
    }
    for command in db.commands.values_mut() {
        if command.cluster.is_some_and(|c| gone.clusters.contains(&c)) {
            command.cluster = None;
        }
        if command.response.is_some_and(|r| gone.commands.contains(&r)) {
            command.response = None;
        }
    }
    for event in db.events.values_mut() {
        if event.cluster.is_some_and(|c| gone.clusters.contains(&c)) {
            event.cluster = None;
        }
    }
    for requirement in db.device_type_clusters.values_mut() {
        if requirement.cluster.is_some_and(|c| gone.clusters.contains(&c)) {
            requirement.cluster = None;
        }
        for attribute in &mut requirement.attributes {
            if attribute.attribute.is_some_and(|a| gone.attributes.contains(&a)) {
                attribute.attribute = None;
            }
        }
        for command in &mut requirement.commands {
            if command.command.is_some_and(|c| gone.commands.contains(&c)) {
                command.command = None;
            }
        }
        for feature in &mut requirement.features {
            if feature.feature.is_some_and(|f| !db.features.contains_key(&f)) {
                feature.feature = None;
            }
        }
    }

    // Enablement rows pointing at removed rows are meaningless now
    let attributes = &db.attributes;
    let commands = &db.commands;
    let events = &db.events;
    let clusters = &db.clusters;
    db.endpoint_type_clusters
        .retain(|(_, c, _), _| clusters.contains_key(c));
    db.endpoint_type_attributes
        .retain(|(_, a), _| attributes.contains_key(a));
    db.endpoint_type_reportable_attributes
        .retain(|(_, a), _| attributes.contains_key(a));
    db.endpoint_type_commands
        .retain(|(_, c, _), _| commands.contains_key(c));
    db.endpoint_type_events
        .retain(|(_, e), _| events.contains_key(e));
    for endpoint_type in db.endpoint_types.values_mut() {
        for device in &mut endpoint_type.devices {
            if device.device_type.is_some_and(|d| gone.device_types.contains(&d)) {
                device.device_type = None;
            }
        }
    }

    db.package_options.retain(|o| o.package != package);
    db.package_option_defaults.retain(|(p, _), _| *p != package);
    db.package_extensions.retain(|e| e.package != package);
    db.package_extension_defaults.retain(|e| e.package != package);
}

/// Deletes a package, its children and everything derived from it.
///
/// Sessions that used the package are re-checked so notifications that
/// depended on it (such as code conflicts) disappear.
pub fn delete_package(db: &mut Db, package: PackageId) -> Result<()> {
    db.package(package)?;
    db.transaction(|db| {
        let children: Vec<PackageId> = child_packages(db, package).iter().map(|p| p.id).collect();
        for child in children {
            delete_package(db, child)?;
        }

        delete_package_entities(db, package);
        notification::clear_package(db, package);
        db.packages.remove(&package);

        let affected: Vec<SessionId> = db
            .sessions
            .values_mut()
            .filter_map(|s| {
                let before = s.packages.len();
                s.packages.retain(|p| *p != package);
                (s.packages.len() != before).then_some(s.id)
            })
            .collect();
        for session in affected {
            consistency::refresh_session(db, session)?;
        }

        info!(%package, "package deleted");
        Ok(())
    })
}
