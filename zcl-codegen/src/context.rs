//! The value templates are rendered against.
//!
//! The context is a plain JSON object built once per generation run from the
//! session's capability libraries and endpoint configuration:
//!
//! | key             | content                                              |
//! |-----------------|------------------------------------------------------|
//! | `session`       | key and key/value pairs                              |
//! | `generator`     | `generator` category options of the manifest         |
//! | `options`       | every option category, as `[{code, label}]`          |
//! | `defaults`      | selected option per category                         |
//! | `clusters`      | every cluster, with attributes, commands and events  |
//! | `deviceTypes`   | every device type                                    |
//! | `enums`, `bitmaps`, `structs` | data types                             |
//! | `endpointTypes` | enabled clusters and members per endpoint type       |
//! | `endpoints`     | endpoint instances, ordered by endpoint identifier   |
//!
//! Extension properties declared by the manifest appear as extra keys on the
//! entities they extend.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Map, Value};
use zcl_config::model::{
    AttributeRow, ClusterRow, CommandRow, DataTypeKind, EntityKind, EventRow, FieldRow,
    PackageType,
};
use zcl_config::package::{extension_properties, extension_value, package_options};
use zcl_config::{ClusterId, EndpointTypeId, PackageId, SessionId, Tables, FEATURE_LEVEL};
use zcl_data_model::{ApiMaturity, Side};

use crate::error::Result;
use crate::manifest::GENERATOR_OPTIONS;

struct Builder<'a> {
    db: &'a Tables,
    packages: BTreeSet<PackageId>,
    manifest: Option<PackageId>,
    endpoint_types: Vec<EndpointTypeId>,
}

fn field(f: &FieldRow) -> Value {
    json!({
        "name": f.name,
        "code": f.code,
        "type": f.type_name,
        "isList": f.is_list,
        "maxLength": f.max_length,
        "isOptional": f.is_optional,
        "isNullable": f.is_nullable,
    })
}

impl Builder<'_> {
    fn extend(&self, value: &mut Value, entity: EntityKind, code: u64, parent: Option<u64>) {
        let (Some(manifest), Value::Object(object)) = (self.manifest, value) else {
            return;
        };
        for extension in extension_properties(self.db, manifest, entity) {
            let property = &extension.property;
            let resolved = extension_value(self.db, manifest, entity, property, code, parent);
            object.insert(
                property.clone(),
                resolved.map_or(Value::Null, |v| Value::String(v.to_string())),
            );
        }
    }

    fn attribute(&self, a: &AttributeRow, cluster_code: u64) -> Value {
        let mut value = json!({
            "name": a.name,
            "code": a.code,
            "side": a.side,
            "type": a.field.type_name,
            "isList": a.field.is_list,
            "maxLength": a.field.max_length,
            "isNullable": a.field.is_nullable,
            "isOptional": a.conformance == "O",
            "isWritable": a.is_writable,
            "isReportable": a.is_reportable,
            "default": a.default,
            "min": a.min,
            "max": a.max,
            "conformance": a.conformance,
            "maturity": a.maturity,
            "description": a.description,
        });
        self.extend(&mut value, EntityKind::Attribute, a.code, Some(cluster_code));
        value
    }

    fn command(&self, c: &CommandRow, cluster_code: u64) -> Value {
        let mut value = json!({
            "name": c.name,
            "code": c.code,
            "source": c.source,
            "isOptional": c.is_optional,
            "isTimed": c.is_timed,
            "isFabricScoped": c.is_fabric_scoped,
            "conformance": c.conformance,
            "responseName": c.response_name,
            "args": c.args.iter().map(field).collect::<Vec<_>>(),
            "maturity": c.maturity,
            "description": c.description,
        });
        self.extend(&mut value, EntityKind::Command, c.code, Some(cluster_code));
        value
    }

    fn event(&self, e: &EventRow, cluster_code: u64) -> Value {
        let mut value = json!({
            "name": e.name,
            "code": e.code,
            "side": e.side,
            "priority": e.priority,
            "isOptional": e.is_optional,
            "conformance": e.conformance,
            "fields": e.fields.iter().map(field).collect::<Vec<_>>(),
            "maturity": e.maturity,
            "description": e.description,
        });
        self.extend(&mut value, EntityKind::Event, e.code, Some(cluster_code));
        value
    }

    fn is_enabled_anywhere(&self, cluster: ClusterId, side: Side) -> bool {
        self.endpoint_types
            .iter()
            .any(|et| self.db.is_cluster_enabled(*et, cluster, side))
    }

    /// A cluster without its members.
    fn cluster_header(&self, c: &ClusterRow) -> Value {
        let mut value = json!({
            "name": c.name,
            "code": c.code,
            "manufacturerCode": c.manufacturer_code,
            "define": c.define,
            "description": c.description,
            "domain": c.domain,
            "revision": c.revision,
            "maturity": c.maturity,
            "isProvisional": c.maturity == ApiMaturity::Provisional,
            "features": self.db.cluster_features(c.id).iter().map(|f| json!({
                "name": f.name,
                "code": f.code,
                "bit": f.bit,
                "conformance": f.conformance,
                "description": f.description,
            })).collect::<Vec<_>>(),
        });
        self.extend(&mut value, EntityKind::Cluster, c.code, None);
        value
    }

    fn cluster(&self, c: &ClusterRow) -> Value {
        let mut value = self.cluster_header(c);
        if let Value::Object(object) = &mut value {
            object.insert(
                "attributes".into(),
                self.db
                    .cluster_attributes(c.id)
                    .map(|a| self.attribute(a, c.code))
                    .collect(),
            );
            object.insert(
                "commands".into(),
                self.db
                    .cluster_commands(c.id)
                    .map(|cmd| self.command(cmd, c.code))
                    .collect(),
            );
            object.insert(
                "events".into(),
                self.db
                    .cluster_events(c.id)
                    .map(|e| self.event(e, c.code))
                    .collect(),
            );
            object.insert(
                "enabled".into(),
                json!({
                    "client": self.is_enabled_anywhere(c.id, Side::Client),
                    "server": self.is_enabled_anywhere(c.id, Side::Server),
                }),
            );
        }
        value
    }

    fn clusters(&self) -> Vec<&ClusterRow> {
        let mut clusters: Vec<&ClusterRow> = self
            .db
            .clusters
            .values()
            .filter(|c| self.packages.contains(&c.package))
            .collect();
        clusters.sort_by_key(|c| (c.code, c.manufacturer_code));
        clusters
    }

    /// An enabled cluster side of an endpoint type, with only the members
    /// enabled on it.
    fn endpoint_type_cluster(&self, et: EndpointTypeId, c: &ClusterRow, side: Side) -> Value {
        let db = self.db;
        let attributes: Vec<Value> = db
            .cluster_attributes(c.id)
            .filter(|a| a.side == side && db.is_attribute_included(et, a.id))
            .map(|a| {
                let mut value = self.attribute(a, c.code);
                if let Value::Object(object) = &mut value {
                    let default_value = db
                        .endpoint_type_attributes
                        .get(&(et, a.id))
                        .and_then(|s| s.default_value.clone());
                    let reporting = db
                        .endpoint_type_reportable_attributes
                        .get(&(et, a.id))
                        .map(|r| {
                            json!({
                                "minInterval": r.reporting.min_interval,
                                "maxInterval": r.reporting.max_interval,
                                "reportableChange": r.reporting.reportable_change,
                            })
                        });
                    object.insert("defaultValue".into(), json!(default_value));
                    object.insert("reporting".into(), json!(reporting));
                }
                value
            })
            .collect();
        let commands: Vec<Value> = db
            .cluster_commands(c.id)
            .filter(|cmd| db.is_command_enabled(et, cmd.id, side))
            .map(|cmd| {
                let mut value = self.command(cmd, c.code);
                if let Value::Object(object) = &mut value {
                    object.insert("isIncoming".into(), json!(cmd.is_incoming_on(side)));
                }
                value
            })
            .collect();
        let events: Vec<Value> = db
            .cluster_events(c.id)
            .filter(|e| e.side == side && db.is_event_included(et, e.id))
            .map(|e| self.event(e, c.code))
            .collect();

        let mut value = self.cluster_header(c);
        if let Value::Object(object) = &mut value {
            object.insert("side".into(), json!(side));
            object.insert("attributes".into(), Value::Array(attributes));
            object.insert("commands".into(), Value::Array(commands));
            object.insert("events".into(), Value::Array(events));
        }
        value
    }

    fn endpoint_types(&self) -> Vec<Value> {
        self.endpoint_types
            .iter()
            .enumerate()
            .filter_map(|(index, et)| self.db.endpoint_types.get(et).map(|row| (index, row)))
            .map(|(index, et)| {
                let device_types: Vec<Value> = et
                    .devices
                    .iter()
                    .map(|d| {
                        let name = d
                            .device_type
                            .and_then(|id| self.db.device_types.get(&id))
                            .map(|row| row.name.clone());
                        json!({"name": name, "code": d.code, "version": d.version})
                    })
                    .collect();

                let mut enabled: Vec<(&ClusterRow, Side)> = self
                    .db
                    .enabled_clusters(et.id)
                    .into_iter()
                    .filter_map(|(id, side)| self.db.clusters.get(&id).map(|c| (c, side)))
                    .collect();
                enabled.sort_by_key(|(c, side)| (c.code, c.manufacturer_code, *side));
                let clusters: Vec<Value> = enabled
                    .into_iter()
                    .map(|(c, side)| self.endpoint_type_cluster(et.id, c, side))
                    .collect();

                json!({
                    "id": et.id,
                    "index": index,
                    "name": et.name,
                    "deviceTypes": device_types,
                    "clusters": clusters,
                })
            })
            .collect()
    }

    fn data_types(&self, kind: DataTypeKind) -> Vec<Value> {
        self.db
            .data_types
            .values()
            .filter(|t| t.kind == kind && self.packages.contains(&t.package))
            .map(|t| {
                let cluster = t
                    .cluster
                    .and_then(|c| self.db.clusters.get(&c))
                    .map(|c| c.name.clone());
                json!({
                    "name": t.name,
                    "cluster": cluster,
                    "baseType": t.base_type,
                    "items": t.items.iter().map(|(name, value)| json!({"name": name, "value": value})).collect::<Vec<_>>(),
                    "fields": t.fields.iter().map(field).collect::<Vec<_>>(),
                })
            })
            .collect()
    }
}

/// Builds the render context of a session.
///
/// `manifest` supplies generator options and extension properties.
pub fn session_context(
    db: &Tables,
    session: SessionId,
    manifest: Option<PackageId>,
) -> Result<Value> {
    let row = db.session(session)?;
    let packages: BTreeSet<PackageId> = row
        .packages
        .iter()
        .copied()
        .filter(|p| {
            db.packages
                .get(p)
                .is_some_and(|p| p.package_type == PackageType::CapabilityLibrary)
        })
        .collect();
    let builder = Builder {
        db,
        packages,
        manifest,
        endpoint_types: db.endpoint_types_of(session).map(|et| et.id).collect(),
    };

    let mut generator = Map::new();
    let mut options: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
    let mut defaults = Map::new();
    if let Some(manifest) = manifest {
        for option in db.package_options.iter().filter(|o| o.package == manifest) {
            options
                .entry(option.category.as_str())
                .or_default()
                .push(json!({"code": option.code, "label": option.label}));
        }
        for option in package_options(db, manifest, GENERATOR_OPTIONS) {
            generator.insert(option.code.clone(), Value::String(option.label.clone()));
        }
        for ((package, category), value) in &db.package_option_defaults {
            if *package == manifest {
                defaults.insert(category.clone(), Value::String(value.clone()));
            }
        }
    }

    let clusters: Vec<Value> = builder
        .clusters()
        .into_iter()
        .map(|c| builder.cluster(c))
        .collect();

    let mut device_types: Vec<Value> = db
        .device_types
        .values()
        .filter(|d| builder.packages.contains(&d.package))
        .map(|d| {
            let mut value = json!({
                "name": d.name,
                "code": d.code,
                "version": d.version,
                "domain": d.domain,
                "description": d.description,
            });
            builder.extend(&mut value, EntityKind::DeviceType, d.code, None);
            value
        })
        .collect();
    device_types.sort_by_key(|d| d.get("code").and_then(Value::as_u64));

    let endpoint_types = builder.endpoint_types();
    let type_index: BTreeMap<EndpointTypeId, (usize, &str)> = builder
        .endpoint_types
        .iter()
        .enumerate()
        .filter_map(|(i, id)| db.endpoint_types.get(id).map(|et| (*id, (i, et.name.as_str()))))
        .collect();
    let mut endpoints: Vec<_> = db.endpoints_of(session).collect();
    endpoints.sort_by_key(|e| e.identifier);
    let endpoints: Vec<Value> = endpoints
        .into_iter()
        .map(|e| {
            let (index, name) = type_index
                .get(&e.endpoint_type)
                .copied()
                .map_or((None, None), |(i, n)| (Some(i), Some(n)));
            json!({
                "endpointId": e.identifier,
                "networkId": e.network,
                "profileId": e.profile,
                "endpointTypeIndex": index,
                "endpointTypeName": name,
            })
        })
        .collect();

    Ok(json!({
        "featureLevel": FEATURE_LEVEL,
        "session": {"key": row.key, "keyValues": row.key_values},
        "generator": generator,
        "options": options,
        "defaults": defaults,
        "clusters": clusters,
        "deviceTypes": device_types,
        "enums": builder.data_types(DataTypeKind::Enum),
        "bitmaps": builder.data_types(DataTypeKind::Bitmap),
        "structs": builder.data_types(DataTypeKind::Struct),
        "endpointTypes": endpoint_types,
        "endpoints": endpoints,
    }))
}
