//! Rows of the configuration store.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use zcl_data_model::{ApiMaturity, Conformant, Side};

use crate::ids::*;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum PackageType {
    CapabilityLibrary,
    TemplateManifest,
    Template,
    Helper,
    Partial,
    Override,
    Extension,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub id: PackageId,
    pub path: PathBuf,
    /// SHA-256 of the file content, hex encoded
    pub hash: String,
    pub package_type: PackageType,
    pub category: Option<String>,
    /// Owning manifest for template children
    pub parent: Option<PackageId>,
    pub version: Option<String>,
    pub description: Option<String>,
}

/// One selectable value of an option category declared by a template manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageOption {
    pub package: PackageId,
    pub category: String,
    pub code: String,
    pub label: String,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "camelCase", ascii_case_insensitive)]
pub enum EntityKind {
    Cluster,
    Attribute,
    Command,
    Event,
    DeviceType,
}

/// A property that a template package adds onto existing entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageExtension {
    pub package: PackageId,
    pub entity: EntityKind,
    pub property: String,
    pub property_type: Option<String>,
    pub configurability: Option<String>,
    pub label: Option<String>,
    pub global_default: Option<String>,
}

/// Per-entity value of an extension property.
///
/// Entities are identified by code; attributes and commands also by the
/// code of their cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageExtensionDefault {
    pub package: PackageId,
    pub entity: EntityKind,
    pub property: String,
    pub entity_code: u64,
    pub parent_code: Option<u64>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterRow {
    pub id: ClusterId,
    pub package: PackageId,
    pub code: u64,
    pub manufacturer_code: Option<u64>,
    pub name: String,
    pub description: Option<String>,
    pub domain: Option<String>,
    pub define: Option<String>,
    pub revision: u64,
    pub maturity: ApiMaturity,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldRow {
    pub name: String,
    pub code: u64,
    pub type_name: String,
    pub is_list: bool,
    pub max_length: Option<u64>,
    pub is_optional: bool,
    pub is_nullable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeRow {
    pub id: AttributeId,
    pub package: PackageId,
    /// Owning cluster, `None` until an extension attribute is linked
    pub cluster: Option<ClusterId>,
    /// Name of the cluster an extension attribute attaches to
    pub cluster_ref: Option<String>,
    pub code: u64,
    pub name: String,
    pub description: Option<String>,
    pub side: Side,
    pub field: FieldRow,
    pub is_writable: bool,
    pub is_reportable: bool,
    pub default: Option<String>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub conformance: String,
    pub maturity: ApiMaturity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRow {
    pub id: CommandId,
    pub package: PackageId,
    pub cluster: Option<ClusterId>,
    pub cluster_ref: Option<String>,
    pub code: u64,
    pub name: String,
    pub description: Option<String>,
    /// Side that sends the command
    pub source: Side,
    pub is_optional: bool,
    pub is_timed: bool,
    pub is_fabric_scoped: bool,
    pub conformance: String,
    pub response_name: Option<String>,
    pub response: Option<CommandId>,
    /// Name of the request struct the arguments come from
    pub input: Option<String>,
    pub args: Vec<FieldRow>,
    pub maturity: ApiMaturity,
}

impl CommandRow {
    /// Whether the command is received by the given side of its cluster.
    pub fn is_incoming_on(&self, side: Side) -> bool {
        self.source != side
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    pub id: EventId,
    pub package: PackageId,
    pub cluster: Option<ClusterId>,
    pub cluster_ref: Option<String>,
    pub code: u64,
    pub name: String,
    pub description: Option<String>,
    pub side: Side,
    pub priority: String,
    pub is_optional: bool,
    pub conformance: String,
    pub fields: Vec<FieldRow>,
    pub maturity: ApiMaturity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub id: FeatureId,
    pub package: PackageId,
    pub cluster: ClusterId,
    pub name: String,
    pub code: String,
    pub bit: u8,
    pub conformance: String,
    pub description: Option<String>,
    pub maturity: ApiMaturity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum DataTypeKind {
    Enum,
    Bitmap,
    Struct,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataTypeRow {
    pub id: DataTypeId,
    pub package: PackageId,
    pub cluster: Option<ClusterId>,
    pub name: String,
    pub kind: DataTypeKind,
    pub base_type: Option<String>,
    /// Enum and bitmap entries
    pub items: Vec<(String, u64)>,
    /// Struct fields
    pub fields: Vec<FieldRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTypeRow {
    pub id: DeviceTypeId,
    pub package: PackageId,
    pub code: u64,
    pub name: String,
    pub version: u64,
    pub domain: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTypeAttribute {
    pub name: String,
    pub attribute: Option<AttributeId>,
    pub is_reportable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTypeCommand {
    pub name: String,
    pub command: Option<CommandId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTypeFeature {
    pub code: String,
    pub feature: Option<FeatureId>,
    pub conformance: Option<String>,
}

/// A cluster required by a device type. References are names until linked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTypeClusterRow {
    pub id: DeviceTypeClusterId,
    pub device_type: DeviceTypeId,
    pub cluster_name: String,
    pub cluster: Option<ClusterId>,
    pub include_client: bool,
    pub include_server: bool,
    pub lock_client: bool,
    pub lock_server: bool,
    pub attributes: Vec<DeviceTypeAttribute>,
    pub commands: Vec<DeviceTypeCommand>,
    pub features: Vec<DeviceTypeFeature>,
}

impl DeviceTypeClusterRow {
    pub fn sides(&self) -> impl Iterator<Item = Side> + '_ {
        [
            (self.include_client, Side::Client),
            (self.include_server, Side::Server),
        ]
        .into_iter()
        .filter_map(|(included, side)| included.then_some(side))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub key: String,
    /// Seconds since the unix epoch
    pub creation_time: u64,
    pub dirty: bool,
    pub key_values: BTreeMap<String, String>,
    pub packages: Vec<PackageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointTypeDevice {
    pub device_type: Option<DeviceTypeId>,
    pub code: u64,
    pub version: u64,
}

impl From<&DeviceTypeRow> for EndpointTypeDevice {
    fn from(row: &DeviceTypeRow) -> Self {
        Self {
            device_type: Some(row.id),
            code: row.code,
            version: row.version,
        }
    }
}

/// Devices are stored as one list of tuples, so references, codes and
/// versions can never get out of step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointType {
    pub id: EndpointTypeId,
    pub session: SessionId,
    pub name: String,
    pub devices: Vec<EndpointTypeDevice>,
}

impl EndpointType {
    pub fn primary_device(&self) -> Option<&EndpointTypeDevice> {
        self.devices.first()
    }

    pub fn device_type_refs(&self) -> Vec<DeviceTypeId> {
        self.devices.iter().filter_map(|d| d.device_type).collect()
    }

    pub fn device_codes(&self) -> Vec<u64> {
        self.devices.iter().map(|d| d.code).collect()
    }

    pub fn device_versions(&self) -> Vec<u64> {
        self.devices.iter().map(|d| d.version).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTypeCluster {
    pub endpoint_type: EndpointTypeId,
    pub cluster: ClusterId,
    pub side: Side,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTypeAttribute {
    pub endpoint_type: EndpointTypeId,
    pub attribute: AttributeId,
    pub included: bool,
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reporting {
    pub min_interval: u16,
    pub max_interval: u16,
    pub reportable_change: u64,
}

impl Default for Reporting {
    fn default() -> Self {
        Self {
            min_interval: 1,
            max_interval: 0xFFFE,
            reportable_change: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTypeReportableAttribute {
    pub endpoint_type: EndpointTypeId,
    pub attribute: AttributeId,
    pub reporting: Reporting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTypeCommand {
    pub endpoint_type: EndpointTypeId,
    pub command: CommandId,
    /// Cluster side the command is enabled on
    pub side: Side,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTypeEvent {
    pub endpoint_type: EndpointTypeId,
    pub event: EventId,
    pub included: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: EndpointId,
    pub session: SessionId,
    pub endpoint_type: EndpointTypeId,
    pub identifier: u32,
    pub network: u16,
    pub profile: u16,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum NotificationType {
    Error,
    Warning,
    Info,
}

/// The rule family that derived a notification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Rule {
    CommandResponse,
    ProvisionalCluster,
    FeatureConformance,
    SpecCompliance,
    CodeConflict,
    UndefinedDataType,
    UnresolvedReference,
    /// Problems found while importing a session file
    Import,
    /// Problems found while loading a template manifest
    TemplateManifest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NotificationScope {
    Session(SessionId),
    Package(PackageId),
}

/// What a notification was derived from. Reconciliation replaces all
/// notifications of one origin at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Origin {
    pub rule: Rule,
    pub endpoint: Option<EndpointId>,
    pub package: Option<PackageId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: NotificationId,
    pub scope: NotificationScope,
    pub origin: Origin,
    pub kind: NotificationType,
    pub message: String,
    /// 1 for errors, 2 for everything else
    pub severity: u8,
    pub seen: bool,
}

macro_rules! conformant_row {
    ($($row:ty),*) => {
        $(
            impl Conformant for $row {
                fn name(&self) -> &str {
                    &self.name
                }

                fn raw_conformance(&self) -> Option<&str> {
                    Some(&self.conformance)
                }

                fn is_optional(&self) -> bool {
                    self.conformance == "O"
                }
            }
        )*
    };
}

conformant_row!(AttributeRow, CommandRow, EventRow, FeatureRow);
