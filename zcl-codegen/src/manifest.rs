//! Template manifests and the packages they record.
//!
//! Loading is split in two: [`read_manifest`] reads the manifest and every
//! file it references without touching the store, then [`record_manifest`]
//! writes the result as one package with a child package per template,
//! helper, partial and override file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use zcl_config::loader::hash_content;
use zcl_config::model::{
    EntityKind, NotificationScope, Origin, Package, PackageExtension, PackageExtensionDefault,
    PackageOption, PackageType, Rule,
};
use zcl_config::notification::{self, Draft};
use zcl_config::package::{delete_package, find_package};
use zcl_config::{Db, PackageId, Tables, FEATURE_LEVEL};

use crate::error::{GenerationError, Result};
use crate::helpers::{as_integer, HelperGroup, BUILTIN_ALIAS_PREFIX};
use crate::template::display;

/// Option category holding per-template output options.
pub const OUTPUT_OPTIONS: &str = "outputOptions";
/// Option category holding the built-in helper groups a manifest asks for.
pub const HELPER_ALIASES: &str = "helperAliases";
/// Option category passed to templates as `generator`.
pub const GENERATOR_OPTIONS: &str = "generator";
/// The only template iterator: render once per cluster.
pub const CLUSTER_ITERATOR: &str = "cluster";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub required_feature_level: Option<u32>,
    pub templates: Vec<TemplateEntry>,
    #[serde(default)]
    pub helpers: Vec<String>,
    #[serde(default)]
    pub partials: Vec<PartialEntry>,
    #[serde(default, rename = "override")]
    pub override_path: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, OptionSource>,
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
    #[serde(default)]
    pub zcl: BTreeMap<String, BTreeMap<String, ExtensionEntry>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateEntry {
    pub path: String,
    pub output: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ignore: bool,
    #[serde(default)]
    pub iterator: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartialEntry {
    pub name: String,
    pub path: String,
}

/// Option values, inline (`code -> label`) or in a JSON file next to the
/// manifest.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OptionSource {
    Inline(BTreeMap<String, Value>),
    File(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionEntry {
    #[serde(default, rename = "type")]
    pub property_type: Option<String>,
    #[serde(default)]
    pub configurability: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub global_default: Option<Value>,
    #[serde(default)]
    pub defaults: Option<DefaultsSource>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DefaultsSource {
    Inline(Vec<Value>),
    File(String),
}

#[derive(Debug, Clone, PartialEq)]
struct ChildPlan {
    package_type: PackageType,
    path: PathBuf,
    hash: String,
    category: Option<String>,
    description: Option<String>,
    iterator: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct ExtensionPlan {
    extension: PackageExtension,
    defaults: Vec<PackageExtensionDefault>,
}

/// Everything needed to record a manifest, read from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestPlan {
    pub path: PathBuf,
    pub hash: String,
    pub name: String,
    pub version: Option<String>,
    pub category: Option<String>,
    children: Vec<ChildPlan>,
    /// (category, code, label)
    options: Vec<(String, String, String)>,
    defaults: Vec<(String, String)>,
    extensions: Vec<ExtensionPlan>,
    /// Problems that do not prevent loading
    pub warnings: Vec<String>,
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| GenerationError::io(path, e))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = read_text(path)?;
    serde_json::from_str(&content).map_err(|e| GenerationError::json(path, e))
}

fn invalid(path: &Path, message: impl Into<String>) -> GenerationError {
    GenerationError::InvalidManifest {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

/// Content hash of a referenced file, empty when it cannot be read yet.
fn file_hash(path: &Path) -> String {
    match fs::read(path) {
        Ok(content) => hash_content(&content),
        Err(e) => {
            warn!(path = %path.display(), "cannot read template file: {}", e);
            String::new()
        }
    }
}

/// Entity and parent codes of one extension default, by entity kind.
fn default_codes(entity: EntityKind, entry: &Value) -> Option<(u64, Option<u64>)> {
    let code = |key: &str| {
        entry
            .get(key)
            .and_then(as_integer)
            .and_then(|c| u64::try_from(c).ok())
    };
    match entity {
        EntityKind::Cluster => Some((code("clusterCode")?, None)),
        EntityKind::Attribute => Some((code("attributeCode")?, code("clusterCode"))),
        EntityKind::Command => Some((code("commandCode")?, code("clusterCode"))),
        EntityKind::Event => Some((code("eventCode")?, code("clusterCode"))),
        EntityKind::DeviceType => Some((code("device")?, None)),
    }
}

impl ManifestPlan {
    fn child(
        &mut self,
        package_type: PackageType,
        path: PathBuf,
        category: Option<String>,
        description: Option<String>,
    ) -> &mut ChildPlan {
        let hash = file_hash(&path);
        self.children.push(ChildPlan {
            package_type,
            path,
            hash,
            category,
            description,
            iterator: None,
        });
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    fn extension_defaults(
        &mut self,
        base: &Path,
        entity: EntityKind,
        property: &str,
        source: &DefaultsSource,
    ) -> Vec<PackageExtensionDefault> {
        let entries = match source {
            DefaultsSource::Inline(entries) => entries.clone(),
            DefaultsSource::File(file) => match fs::read_to_string(base.join(file)) {
                Err(_) => {
                    self.warnings
                        .push(format!("Invalid file! Failed to load defaults from: {}", file));
                    return Vec::new();
                }
                Ok(content) => match serde_json::from_str::<Vec<Value>>(&content) {
                    Ok(entries) => entries,
                    Err(_) => {
                        self.warnings.push(format!(
                            "Invalid file format! Failed to load defaults from: {}",
                            file
                        ));
                        return Vec::new();
                    }
                },
            },
        };

        entries
            .iter()
            .filter_map(|entry| {
                let Some((entity_code, parent_code)) = default_codes(entity, entry) else {
                    debug!(%entity, property, "skipping extension default without codes");
                    return None;
                };
                Some(PackageExtensionDefault {
                    package: PackageId(0),
                    entity,
                    property: property.to_string(),
                    entity_code,
                    parent_code,
                    value: entry.get("value").map(display).unwrap_or_default(),
                })
            })
            .collect()
    }
}

/// Reads a template manifest and the files it references.
pub fn read_manifest(path: &Path) -> Result<ManifestPlan> {
    let content = read_text(path)?;
    let manifest: Manifest =
        serde_json::from_str(&content).map_err(|e| GenerationError::json(path, e))?;

    let required = manifest.required_feature_level.unwrap_or(0);
    if required > FEATURE_LEVEL {
        return Err(GenerationError::FeatureLevel {
            path: path.to_path_buf(),
            required,
            supported: FEATURE_LEVEL,
        });
    }

    let base = path.parent().unwrap_or(Path::new("."));
    let mut plan = ManifestPlan {
        path: path.to_path_buf(),
        hash: String::new(),
        name: manifest.name.clone(),
        version: manifest.version.clone(),
        category: manifest.category.clone(),
        children: Vec::new(),
        options: Vec::new(),
        defaults: Vec::new(),
        extensions: Vec::new(),
        warnings: Vec::new(),
    };

    for template in &manifest.templates {
        if template.ignore {
            debug!(template = %template.path, "ignored");
            continue;
        }
        if let Some(iterator) = &template.iterator {
            if iterator != CLUSTER_ITERATOR {
                return Err(invalid(
                    path,
                    format!("unknown iterator '{}' for {}", iterator, template.path),
                ));
            }
        }
        let child = plan.child(
            PackageType::Template,
            base.join(&template.path),
            Some(template.output.clone()),
            template.name.clone(),
        );
        child.iterator = template.iterator.clone();
    }

    for helper in &manifest.helpers {
        match helper.strip_prefix(BUILTIN_ALIAS_PREFIX) {
            Some(alias) => {
                let group = HelperGroup::from_str(alias)
                    .map_err(|_| invalid(path, format!("unknown helper group '{}'", helper)))?;
                plan.options
                    .push((HELPER_ALIASES.into(), group.to_string(), helper.clone()));
            }
            None => {
                plan.child(PackageType::Helper, base.join(helper), None, None);
            }
        }
    }

    for partial in &manifest.partials {
        plan.child(
            PackageType::Partial,
            base.join(&partial.path),
            Some(partial.name.clone()),
            None,
        );
    }

    if let Some(override_path) = &manifest.override_path {
        plan.child(PackageType::Override, base.join(override_path), None, None);
    }

    for (category, source) in &manifest.options {
        let values = match source {
            OptionSource::Inline(values) => values.clone(),
            OptionSource::File(file) => read_json(&base.join(file))?,
        };
        for (code, label) in values {
            plan.options.push((category.clone(), code, display(&label)));
        }
    }

    for (category, value) in &manifest.defaults {
        plan.defaults.push((category.clone(), display(value)));
    }

    for (entity, properties) in &manifest.zcl {
        let Ok(kind) = EntityKind::from_str(entity) else {
            plan.warnings
                .push(format!("Unknown entity type in zcl extensions: {}", entity));
            continue;
        };
        for (property, entry) in properties {
            let defaults = match &entry.defaults {
                Some(source) => plan.extension_defaults(base, kind, property, source),
                None => Vec::new(),
            };
            plan.extensions.push(ExtensionPlan {
                extension: PackageExtension {
                    package: PackageId(0),
                    entity: kind,
                    property: property.clone(),
                    property_type: entry.property_type.clone(),
                    configurability: entry.configurability.clone(),
                    label: entry.label.clone(),
                    global_default: entry.global_default.as_ref().map(display),
                },
                defaults,
            });
        }
    }

    let mut hashed = content.into_bytes();
    for child in &plan.children {
        hashed.extend_from_slice(child.hash.as_bytes());
    }
    plan.hash = hash_content(&hashed);
    Ok(plan)
}

fn insert_package(
    db: &mut Tables,
    package_type: PackageType,
    path: &Path,
    hash: &str,
    parent: Option<PackageId>,
) -> PackageId {
    let id = db.next_id();
    db.packages.insert(
        id,
        Package {
            id,
            path: path.to_path_buf(),
            hash: hash.to_string(),
            package_type,
            category: None,
            parent,
            version: None,
            description: None,
        },
    );
    id
}

/// Records a read manifest, replacing an older version loaded from the
/// same path. An unchanged manifest keeps its package.
pub fn record_manifest(db: &mut Db, plan: &ManifestPlan) -> zcl_config::Result<PackageId> {
    if let Some(existing) = find_package(db, &plan.path, None) {
        if existing.hash == plan.hash && existing.package_type == PackageType::TemplateManifest {
            debug!(path = %plan.path.display(), package = %existing.id, "manifest unchanged");
            return Ok(existing.id);
        }
        let stale = existing.id;
        delete_package(db, stale)?;
    }

    db.transaction(|db| {
        let id = insert_package(
            db,
            PackageType::TemplateManifest,
            &plan.path,
            &plan.hash,
            None,
        );
        if let Some(package) = db.packages.get_mut(&id) {
            package.version = plan.version.clone();
            package.category = plan.category.clone();
            package.description = Some(plan.name.clone());
        }

        for child in &plan.children {
            let child_id = insert_package(db, child.package_type, &child.path, &child.hash, Some(id));
            if let Some(package) = db.packages.get_mut(&child_id) {
                package.category = child.category.clone();
                package.description = child.description.clone();
            }
            if let Some(iterator) = &child.iterator {
                db.package_options.push(PackageOption {
                    package: child_id,
                    category: OUTPUT_OPTIONS.into(),
                    code: "iterator".into(),
                    label: iterator.clone(),
                });
            }
        }

        for (category, code, label) in &plan.options {
            db.package_options.push(PackageOption {
                package: id,
                category: category.clone(),
                code: code.clone(),
                label: label.clone(),
            });
        }
        for (category, value) in &plan.defaults {
            db.package_option_defaults
                .insert((id, category.clone()), value.clone());
        }
        for planned in &plan.extensions {
            db.package_extensions.push(PackageExtension {
                package: id,
                ..planned.extension.clone()
            });
            db.package_extension_defaults
                .extend(planned.defaults.iter().map(|d| PackageExtensionDefault {
                    package: id,
                    ..d.clone()
                }));
        }

        notification::reconcile(
            db,
            NotificationScope::Package(id),
            Origin {
                rule: Rule::TemplateManifest,
                endpoint: None,
                package: Some(id),
            },
            plan.warnings.iter().map(Draft::warning),
        );

        info!(
            path = %plan.path.display(),
            package = %id,
            children = plan.children.len(),
            "template manifest loaded"
        );
        Ok(id)
    })
}

/// Reads and records a manifest in one step.
pub fn load_manifest(db: &mut Db, path: &Path) -> Result<PackageId> {
    let plan = read_manifest(path)?;
    Ok(db.transaction(|db| record_manifest(db, &plan))?)
}

/// The iterator a template package renders with, if any.
pub fn template_iterator(db: &Tables, template: PackageId) -> Option<&str> {
    db.package_options
        .iter()
        .find(|o| o.package == template && o.category == OUTPUT_OPTIONS && o.code == "iterator")
        .map(|o| o.label.as_str())
}
