//! Loading of capability-library files into the store.
//!
//! A load runs in two passes. Every file of a batch is hashed, parsed and
//! its entities inserted with name references left unresolved. Once the whole
//! batch is in, [`linker::link`] resolves the references and the session
//! package checks run.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use zcl_data_model::idl::Span;
use zcl_data_model::{
    Attribute, Bitmap, Cluster, Command, Conformant, Definition, Enum, Event, Struct, StructField,
};

use crate::error::{Error, Result};
use crate::ids::*;
use crate::linker::{self, LinkOptions};
use crate::model::*;
use crate::notification::{self, Draft};
use crate::package::{self, find_package};
use crate::session;
use crate::store::{Db, Store, Tables};

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Session the loaded packages are attached to
    pub session: Option<SessionId>,
    pub category: Option<String>,
    /// Delete device type clusters that reference unknown clusters instead of
    /// reporting them. Used when reconciling custom extension files.
    pub prune_unresolved_clusters: bool,
}

/// Outcome of loading one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResult {
    pub path: PathBuf,
    pub succeeded: bool,
    pub package_id: Option<PackageId>,
    pub err: Option<String>,
}

impl LoadResult {
    fn loaded(path: &Path, package: PackageId) -> Self {
        Self {
            path: path.to_path_buf(),
            succeeded: true,
            package_id: Some(package),
            err: None,
        }
    }

    fn failed(path: &Path, err: impl ToString) -> Self {
        Self {
            path: path.to_path_buf(),
            succeeded: false,
            package_id: None,
            err: Some(err.to_string()),
        }
    }
}

/// SHA-256 of `content`, hex encoded.
pub fn hash_content(content: &[u8]) -> String {
    Sha256::digest(content)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Loads a batch of capability-library files.
///
/// A file that cannot be read or parsed is reported in its [`LoadResult`] and
/// the remaining files are still loaded. Files are parsed without holding the
/// store lock, so independent loads may run concurrently.
pub fn load_definition_files<P: AsRef<Path>>(
    store: &Store,
    paths: &[P],
    options: &LoadOptions,
) -> Result<Vec<LoadResult>> {
    let mut results = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(source) => {
                let err = Error::Io {
                    path: path.to_path_buf(),
                    source,
                };
                warn!("{}", err);
                results.push(LoadResult::failed(path, err));
                continue;
            }
        };
        results.push(load_one(store, path, &content, options)?);
    }

    let batch: Vec<PackageId> = results.iter().filter_map(|r| r.package_id).collect();
    store.transaction(|db| finish_batch(db, &batch, options))?;
    Ok(results)
}

/// Loads a single definition from memory, within an existing store handle.
pub fn load_definition(
    db: &mut Db,
    path: &Path,
    content: &str,
    options: &LoadOptions,
) -> Result<LoadResult> {
    let hash = hash_content(content.as_bytes());
    let result = match unchanged(db, path, &hash) {
        Some(package) => LoadResult::loaded(path, package),
        None => match parse(path, content) {
            Ok(definition) => {
                let package = db.transaction(|db| {
                    Ok(store_definition(db, path, &hash, &definition, options))
                })?;
                LoadResult::loaded(path, package)
            }
            Err(err) => LoadResult::failed(path, err),
        },
    };
    if let Some(package) = result.package_id {
        db.transaction(|db| finish_batch(db, &[package], options))?;
    }
    Ok(result)
}

fn load_one(store: &Store, path: &Path, content: &str, options: &LoadOptions) -> Result<LoadResult> {
    let hash = hash_content(content.as_bytes());

    if let Some(package) = store.read(|db| Ok(unchanged(db, path, &hash)))? {
        debug!(path = %path.display(), %package, "content unchanged, skipping parse");
        return Ok(LoadResult::loaded(path, package));
    }

    let definition = match parse(path, content) {
        Ok(definition) => definition,
        Err(err) => return Ok(LoadResult::failed(path, err)),
    };

    // Another loader may have stored the same file while this one was parsing
    let package =
        store.transaction(|db| Ok(store_definition(db, path, &hash, &definition, options)))?;
    Ok(LoadResult::loaded(path, package))
}

fn unchanged(db: &Tables, path: &Path, hash: &str) -> Option<PackageId> {
    find_package(db, path, None)
        .filter(|p| p.hash == hash)
        .map(|p| p.id)
}

fn parse(path: &Path, content: &str) -> std::result::Result<Definition, String> {
    let name = path.display().to_string();
    Definition::parse_named(&name, Span::new(content)).map_err(|e| {
        warn!(path = %name, line = e.line, "failed to parse definition");
        format!("{} (line {})", e, e.line)
    })
}

/// Stores a parsed definition, reusing the package row of an earlier load of
/// the same path. Returns the package id.
fn store_definition(
    db: &mut Tables,
    path: &Path,
    hash: &str,
    definition: &Definition,
    options: &LoadOptions,
) -> PackageId {
    let package = match find_package(db, path, None).map(|p| (p.id, p.hash == hash)) {
        Some((id, true)) => {
            debug!(path = %path.display(), %id, "already loaded");
            return id;
        }
        Some((id, false)) => {
            info!(path = %path.display(), %id, "content changed, reloading");
            package::delete_package_entities(db, id);
            notification::clear_package(db, id);
            if let Some(row) = db.packages.get_mut(&id) {
                row.hash = hash.to_string();
            }
            id
        }
        None => {
            let id = db.next_id();
            db.packages.insert(
                id,
                Package {
                    id,
                    path: path.to_path_buf(),
                    hash: hash.to_string(),
                    package_type: PackageType::CapabilityLibrary,
                    category: options.category.clone(),
                    parent: None,
                    version: None,
                    description: None,
                },
            );
            info!(path = %path.display(), %id, "new package");
            id
        }
    };

    let mut inserter = Inserter {
        db,
        package,
        duplicates: Vec::new(),
    };
    inserter.definition(definition);
    let duplicates = std::mem::take(&mut inserter.duplicates);
    notification::reconcile(
        db,
        NotificationScope::Package(package),
        Origin {
            rule: Rule::CodeConflict,
            endpoint: None,
            package: Some(package),
        },
        duplicates,
    );

    package
}

fn finish_batch(db: &mut Db, batch: &[PackageId], options: &LoadOptions) -> Result<()> {
    if let Some(session) = options.session {
        for package in batch {
            session::attach_package(db, session, *package)?;
        }
    }
    linker::link(
        db,
        batch,
        &LinkOptions {
            session: options.session,
            prune_unresolved_clusters: options.prune_unresolved_clusters,
        },
    )?;
    if let Some(session) = options.session {
        crate::consistency::refresh_session(db, session)?;
    }
    Ok(())
}

pub(crate) fn field_row(field: &StructField) -> FieldRow {
    FieldRow {
        name: field.field.id.clone(),
        code: field.field.code,
        type_name: field.field.data_type.name.clone(),
        is_list: field.field.data_type.is_list,
        max_length: field.field.data_type.max_length,
        is_optional: field.is_optional,
        is_nullable: field.is_nullable,
    }
}

/// Inserts the entities of one definition under one package.
struct Inserter<'a> {
    db: &'a mut Tables,
    package: PackageId,
    duplicates: Vec<Draft>,
}

impl Inserter<'_> {
    fn definition(&mut self, definition: &Definition) {
        for e in &definition.enums {
            self.enumeration(None, e);
        }
        for b in &definition.bitmaps {
            self.bitmap(None, b);
        }
        for s in &definition.structs {
            self.structure(None, s);
        }
        for cluster in &definition.clusters {
            self.cluster(cluster);
        }
        for extension in &definition.extensions {
            let target = Some(extension.cluster.as_str());
            for s in &extension.structs {
                self.structure(None, s);
            }
            for attribute in &extension.attributes {
                self.attribute(None, target, attribute);
            }
            for command in &extension.commands {
                self.command(None, target, command, &extension.structs);
            }
            for event in &extension.events {
                self.event(None, target, event);
            }
        }
        for device_type in &definition.device_types {
            self.device_type(device_type);
        }
    }

    fn cluster(&mut self, cluster: &Cluster) {
        let id: ClusterId = self.db.next_id();
        self.db.clusters.insert(
            id,
            ClusterRow {
                id,
                package: self.package,
                code: cluster.code,
                manufacturer_code: cluster.manufacturer_code,
                name: cluster.id.clone(),
                description: cluster.doc_comment.clone(),
                domain: cluster.domain.clone(),
                define: cluster.define.clone(),
                revision: cluster.revision,
                maturity: cluster.maturity,
            },
        );

        for e in &cluster.enums {
            self.enumeration(Some(id), e);
        }
        for b in &cluster.bitmaps {
            self.bitmap(Some(id), b);
        }
        for s in &cluster.structs {
            self.structure(Some(id), s);
        }
        for attribute in &cluster.attributes {
            self.attribute(Some(id), None, attribute);
        }
        for command in &cluster.commands {
            self.command(Some(id), None, command, &cluster.structs);
        }
        for event in &cluster.events {
            self.event(Some(id), None, event);
        }
        for feature in &cluster.features {
            let feature_id = self.db.next_id();
            self.db.features.insert(
                feature_id,
                FeatureRow {
                    id: feature_id,
                    package: self.package,
                    cluster: id,
                    name: feature.name.clone(),
                    code: feature.code.clone(),
                    bit: feature.bit,
                    conformance: feature.conformance().to_string(),
                    description: feature.doc_comment.clone(),
                    maturity: feature.maturity,
                },
            );
        }
    }

    fn duplicate(&mut self, kind: &str, name: &str, code: u64, cluster: &str) {
        warn!(kind, name, code, cluster, "duplicate element");
        self.duplicates.push(Draft::error(format!(
            "Duplicate {} found: {} (code 0x{:04X}) in cluster {}",
            kind, name, code, cluster
        )));
    }

    fn attribute(&mut self, cluster: Option<ClusterId>, target: Option<&str>, attribute: &Attribute) {
        let code = attribute.field.field.code;
        let clash = self.db.attributes.values().any(|a| {
            a.package == self.package
                && a.cluster == cluster
                && a.cluster_ref.as_deref() == target
                && a.code == code
                && a.side == attribute.side
        });
        if clash {
            let owner = target.map(str::to_string).or_else(|| {
                cluster.and_then(|c| self.db.clusters.get(&c).map(|c| c.name.clone()))
            });
            self.duplicate("attribute", attribute.name(), code, owner.as_deref().unwrap_or("?"));
            return;
        }

        let id = self.db.next_id();
        self.db.attributes.insert(
            id,
            AttributeRow {
                id,
                package: self.package,
                cluster,
                cluster_ref: target.map(str::to_string),
                code,
                name: attribute.name().to_string(),
                description: attribute.doc_comment.clone(),
                side: attribute.side,
                field: field_row(&attribute.field),
                is_writable: !attribute.is_read_only,
                is_reportable: attribute.is_reportable,
                default: attribute.default.as_ref().map(|d| d.to_string()),
                min: attribute.min,
                max: attribute.max,
                conformance: attribute.conformance().to_string(),
                maturity: attribute.maturity,
            },
        );
    }

    fn command(
        &mut self,
        cluster: Option<ClusterId>,
        target: Option<&str>,
        command: &Command,
        structs: &[Struct],
    ) {
        let clash = self.db.commands.values().any(|c| {
            c.package == self.package
                && c.cluster == cluster
                && c.cluster_ref.as_deref() == target
                && c.code == command.code
                && c.source == command.source
        });
        if clash {
            let owner = target.map(str::to_string).or_else(|| {
                cluster.and_then(|c| self.db.clusters.get(&c).map(|c| c.name.clone()))
            });
            self.duplicate("command", &command.id, command.code, owner.as_deref().unwrap_or("?"));
            return;
        }

        let args = command
            .input
            .as_deref()
            .and_then(|input| structs.iter().find(|s| s.id == input))
            .map(|s| s.fields.iter().map(field_row).collect())
            .unwrap_or_default();

        let id = self.db.next_id();
        self.db.commands.insert(
            id,
            CommandRow {
                id,
                package: self.package,
                cluster,
                cluster_ref: target.map(str::to_string),
                code: command.code,
                name: command.id.clone(),
                description: command.doc_comment.clone(),
                source: command.source,
                is_optional: command.is_optional,
                is_timed: command.is_timed,
                is_fabric_scoped: command.is_fabric_scoped,
                conformance: command.conformance().to_string(),
                response_name: command.response_name().map(str::to_string),
                response: None,
                input: command.input.clone(),
                args,
                maturity: command.maturity,
            },
        );
    }

    fn event(&mut self, cluster: Option<ClusterId>, target: Option<&str>, event: &Event) {
        let id = self.db.next_id();
        self.db.events.insert(
            id,
            EventRow {
                id,
                package: self.package,
                cluster,
                cluster_ref: target.map(str::to_string),
                code: event.code,
                name: event.id.clone(),
                description: event.doc_comment.clone(),
                side: event.side,
                priority: format!("{:?}", event.priority).to_lowercase(),
                is_optional: event.is_optional,
                conformance: event.conformance().to_string(),
                fields: event.fields.iter().map(field_row).collect(),
                maturity: event.maturity,
            },
        );
    }

    fn enumeration(&mut self, cluster: Option<ClusterId>, e: &Enum) {
        let items = e.entries.iter().map(|c| (c.id.clone(), c.code)).collect();
        self.data_type(cluster, &e.id, DataTypeKind::Enum, Some(&e.base_type), items, Vec::new());
    }

    fn bitmap(&mut self, cluster: Option<ClusterId>, b: &Bitmap) {
        let items = b.entries.iter().map(|c| (c.id.clone(), c.code)).collect();
        self.data_type(cluster, &b.id, DataTypeKind::Bitmap, Some(&b.base_type), items, Vec::new());
    }

    fn structure(&mut self, cluster: Option<ClusterId>, s: &Struct) {
        let fields = s.fields.iter().map(field_row).collect();
        self.data_type(cluster, &s.id, DataTypeKind::Struct, None, Vec::new(), fields);
    }

    fn data_type(
        &mut self,
        cluster: Option<ClusterId>,
        name: &str,
        kind: DataTypeKind,
        base_type: Option<&str>,
        items: Vec<(String, u64)>,
        fields: Vec<FieldRow>,
    ) {
        let id = self.db.next_id();
        self.db.data_types.insert(
            id,
            DataTypeRow {
                id,
                package: self.package,
                cluster,
                name: name.to_string(),
                kind,
                base_type: base_type.map(str::to_string),
                items,
                fields,
            },
        );
    }

    fn device_type(&mut self, device_type: &zcl_data_model::DeviceType) {
        let id = self.db.next_id();
        self.db.device_types.insert(
            id,
            DeviceTypeRow {
                id,
                package: self.package,
                code: device_type.code,
                name: device_type.name.clone(),
                version: device_type.version,
                domain: device_type.domain.clone(),
                description: device_type.doc_comment.clone(),
            },
        );

        for requirement in &device_type.clusters {
            let row_id = self.db.next_id();
            self.db.device_type_clusters.insert(
                row_id,
                DeviceTypeClusterRow {
                    id: row_id,
                    device_type: id,
                    cluster_name: requirement.cluster.clone(),
                    cluster: None,
                    include_client: requirement.include_client,
                    include_server: requirement.include_server,
                    lock_client: requirement.lock_client,
                    lock_server: requirement.lock_server,
                    attributes: requirement
                        .attributes
                        .iter()
                        .map(|a| DeviceTypeAttribute {
                            name: a.name.clone(),
                            attribute: None,
                            is_reportable: a.is_reportable,
                        })
                        .collect(),
                    commands: requirement
                        .commands
                        .iter()
                        .map(|c| DeviceTypeCommand {
                            name: c.clone(),
                            command: None,
                        })
                        .collect(),
                    features: requirement
                        .features
                        .iter()
                        .map(|f| DeviceTypeFeature {
                            code: f.code.clone(),
                            feature: None,
                            conformance: f.conformance.clone(),
                        })
                        .collect(),
                },
            );
        }
    }
}
