use strum::{AsRefStr, Display, EnumString};

pub mod conformance;

#[cfg(feature = "idl")]
pub mod idl;

/// How mature/usable a member of an API is
///
/// Most things should be stable, however while a cluster is developed
/// we expect PROVISIONAL to be set.
#[derive(
    Debug, PartialEq, Copy, Clone, Hash, PartialOrd, Eq, Ord, Default, Display, EnumString, AsRefStr,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ApiMaturity {
    #[default]
    Stable,
    Provisional,
    Internal,
    Deprecated,
}

#[derive(Debug, PartialEq, Copy, Clone, Hash, PartialOrd, Eq, Ord, Default)]
pub enum AccessPrivilege {
    #[default]
    View,
    Operate,
    Manage,
    Administer,
}

#[derive(Debug, PartialEq, Copy, Clone, Hash, PartialOrd, Eq, Ord, Default)]
pub enum EventPriority {
    #[default]
    Debug,
    Info,
    Critical,
}

/// Which end of a cluster an element lives on (or originates from).
#[derive(
    Debug, PartialEq, Copy, Clone, Hash, PartialOrd, Eq, Ord, Default, Display, EnumString, AsRefStr,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Side {
    Client,
    #[default]
    Server,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConstantEntry {
    pub maturity: ApiMaturity,
    pub id: String,
    pub code: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Enum {
    pub doc_comment: Option<String>,
    pub maturity: ApiMaturity,
    pub id: String,
    pub base_type: String,
    pub entries: Vec<ConstantEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bitmap {
    pub doc_comment: Option<String>,
    pub maturity: ApiMaturity,
    pub id: String,
    pub base_type: String,
    pub entries: Vec<ConstantEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataType {
    pub name: String,
    pub is_list: bool,
    pub max_length: Option<u64>,
}

impl DataType {
    pub fn scalar(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_list: false,
            max_length: None,
        }
    }

    pub fn list_of(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_list: true,
            max_length: None,
        }
    }

    pub fn scalar_of_size(name: impl Into<String>, max_length: u64) -> Self {
        Self {
            name: name.into(),
            is_list: false,
            max_length: Some(max_length),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Field {
    pub data_type: DataType,
    pub id: String,
    pub code: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StructField {
    pub field: Field,
    pub maturity: ApiMaturity,
    pub is_optional: bool,
    pub is_nullable: bool,
    pub is_fabric_sensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StructType {
    Regular,
    Request,
    Response(u64), // response with a code
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Struct {
    pub doc_comment: Option<String>,
    pub maturity: ApiMaturity,
    pub struct_type: StructType,
    pub id: String,
    pub fields: Vec<StructField>,
    pub is_fabric_scoped: bool,
}

#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub enum DefaultAttributeValue {
    Number(u64),
    Signed(i64),
    String(String),
    Bool(bool),
}

impl std::fmt::Display for DefaultAttributeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DefaultAttributeValue::Number(n) => write!(f, "{}", n),
            DefaultAttributeValue::Signed(n) => write!(f, "{}", n),
            DefaultAttributeValue::String(s) => write!(f, "{}", s),
            DefaultAttributeValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Elements that carry a conformance expression.
///
/// Elements declared without an explicit expression derive one from their
/// optionality: `O` when optional, `M` otherwise.
pub trait Conformant {
    fn name(&self) -> &str;
    fn raw_conformance(&self) -> Option<&str>;
    fn is_optional(&self) -> bool;

    fn conformance(&self) -> &str {
        match self.raw_conformance() {
            Some(c) if !c.trim().is_empty() => c,
            _ if self.is_optional() => "O",
            _ => "M",
        }
    }
}

impl<T: Conformant + ?Sized> Conformant for &T {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn raw_conformance(&self) -> Option<&str> {
        (**self).raw_conformance()
    }

    fn is_optional(&self) -> bool {
        (**self).is_optional()
    }
}

#[derive(Debug, Clone, PartialEq, PartialOrd, Default)]
pub struct Attribute {
    pub doc_comment: Option<String>,
    pub maturity: ApiMaturity,
    pub field: StructField,
    pub read_acl: AccessPrivilege,
    pub write_acl: AccessPrivilege,
    pub side: Side,
    pub is_read_only: bool,
    pub is_no_subscribe: bool,
    pub is_timed_write: bool,
    pub is_reportable: bool,
    pub default: Option<DefaultAttributeValue>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub conformance: Option<String>,
}

impl Conformant for Attribute {
    fn name(&self) -> &str {
        &self.field.field.id
    }

    fn raw_conformance(&self) -> Option<&str> {
        self.conformance.as_deref()
    }

    fn is_optional(&self) -> bool {
        self.field.is_optional
    }
}

impl Default for StructField {
    fn default() -> Self {
        Self {
            field: Field {
                data_type: DataType::scalar(""),
                id: String::new(),
                code: 0,
            },
            maturity: ApiMaturity::Stable,
            is_optional: false,
            is_nullable: false,
            is_fabric_sensitive: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, PartialOrd, Default)]
pub struct Command {
    pub doc_comment: Option<String>,
    pub maturity: ApiMaturity,
    pub access: AccessPrivilege,
    pub id: String,
    pub input: Option<String>,
    pub output: String,
    pub code: u64,
    /// Side the command originates from. Client sourced commands are
    /// received (incoming) by the server side of a cluster.
    pub source: Side,
    pub is_optional: bool,
    pub is_timed: bool,
    pub is_fabric_scoped: bool,
    pub conformance: Option<String>,
}

impl Command {
    /// Name of the response command, if the command expects a dedicated response.
    pub fn response_name(&self) -> Option<&str> {
        match self.output.as_str() {
            "" | "DefaultSuccess" => None,
            other => Some(other),
        }
    }
}

impl Conformant for Command {
    fn name(&self) -> &str {
        &self.id
    }

    fn raw_conformance(&self) -> Option<&str> {
        self.conformance.as_deref()
    }

    fn is_optional(&self) -> bool {
        self.is_optional
    }
}

#[derive(Debug, Clone, PartialEq, PartialOrd, Default)]
pub struct Event {
    pub doc_comment: Option<String>,
    pub maturity: ApiMaturity,
    pub priority: EventPriority,
    pub access: AccessPrivilege,
    pub id: String,
    pub code: u64,
    pub fields: Vec<StructField>,
    pub side: Side,
    pub is_optional: bool,
    pub is_fabric_sensitive: bool,
    pub conformance: Option<String>,
}

impl Conformant for Event {
    fn name(&self) -> &str {
        &self.id
    }

    fn raw_conformance(&self) -> Option<&str> {
        self.conformance.as_deref()
    }

    fn is_optional(&self) -> bool {
        self.is_optional
    }
}

/// A cluster scoped feature flag, occupying one bit of the FeatureMap attribute.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Feature {
    pub doc_comment: Option<String>,
    pub maturity: ApiMaturity,
    pub name: String,
    /// Short code used to reference the feature from conformance expressions.
    pub code: String,
    pub bit: u8,
    pub conformance: Option<String>,
}

impl Conformant for Feature {
    fn name(&self) -> &str {
        &self.name
    }

    fn raw_conformance(&self) -> Option<&str> {
        self.conformance.as_deref()
    }

    fn is_optional(&self) -> bool {
        true
    }
}

/// Attribute code of the FeatureMap global attribute.
pub const FEATURE_MAP_ATTRIBUTE_CODE: u64 = 0xFFFC;

#[derive(Debug, Clone, PartialEq, PartialOrd, Default)]
pub struct Cluster {
    pub doc_comment: Option<String>,
    pub maturity: ApiMaturity,
    pub id: String,
    pub code: u64,
    pub revision: u64,
    pub domain: Option<String>,
    pub manufacturer_code: Option<u64>,
    pub define: Option<String>,

    pub bitmaps: Vec<Bitmap>,
    pub enums: Vec<Enum>,
    pub structs: Vec<Struct>,

    pub attributes: Vec<Attribute>,
    pub commands: Vec<Command>,
    pub events: Vec<Event>,
    pub features: Vec<Feature>,
}

impl Cluster {
    pub fn struct_named(&self, name: &str) -> Option<&Struct> {
        self.structs.iter().find(|s| s.id == name)
    }
}

/// Members added onto a cluster defined elsewhere (possibly in another package).
#[derive(Debug, Clone, PartialEq, PartialOrd, Default)]
pub struct ClusterExtension {
    pub cluster: String,
    pub structs: Vec<Struct>,
    pub attributes: Vec<Attribute>,
    pub commands: Vec<Command>,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AttributeRequirement {
    pub name: String,
    pub is_reportable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FeatureRequirement {
    pub code: String,
    pub conformance: Option<String>,
}

/// A cluster a device type requires, referenced by name until linked.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ClusterRequirement {
    pub cluster: String,
    pub include_client: bool,
    pub include_server: bool,
    pub lock_client: bool,
    pub lock_server: bool,
    pub attributes: Vec<AttributeRequirement>,
    pub commands: Vec<String>,
    pub features: Vec<FeatureRequirement>,
}

// Represents a specific device type
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeviceType {
    pub doc_comment: Option<String>,
    pub name: String,
    pub code: u64,
    pub version: u64,
    pub domain: Option<String>,
    pub clusters: Vec<ClusterRequirement>,
}

/// Properties of a built-in (atomic) data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtomicType {
    pub name: &'static str,
    pub size: u8,
    pub is_signed: bool,
    pub is_string: bool,
    pub is_float: bool,
}

macro_rules! atomic {
    ($name:literal, $size:literal) => {
        AtomicType { name: $name, size: $size, is_signed: false, is_string: false, is_float: false }
    };
    ($name:literal, $size:literal, signed) => {
        AtomicType { name: $name, size: $size, is_signed: true, is_string: false, is_float: false }
    };
    ($name:literal, $size:literal, string) => {
        AtomicType { name: $name, size: $size, is_signed: false, is_string: true, is_float: false }
    };
    ($name:literal, $size:literal, float) => {
        AtomicType { name: $name, size: $size, is_signed: true, is_string: false, is_float: true }
    };
}

pub const ATOMIC_TYPES: &[AtomicType] = &[
    atomic!("boolean", 1),
    atomic!("bitmap8", 1),
    atomic!("bitmap16", 2),
    atomic!("bitmap32", 4),
    atomic!("bitmap64", 8),
    atomic!("enum8", 1),
    atomic!("enum16", 2),
    atomic!("int8u", 1),
    atomic!("int16u", 2),
    atomic!("int24u", 3),
    atomic!("int32u", 4),
    atomic!("int40u", 5),
    atomic!("int48u", 6),
    atomic!("int56u", 7),
    atomic!("int64u", 8),
    atomic!("int8s", 1, signed),
    atomic!("int16s", 2, signed),
    atomic!("int24s", 3, signed),
    atomic!("int32s", 4, signed),
    atomic!("int40s", 5, signed),
    atomic!("int48s", 6, signed),
    atomic!("int56s", 7, signed),
    atomic!("int64s", 8, signed),
    atomic!("single", 4, float),
    atomic!("double", 8, float),
    atomic!("char_string", 1, string),
    atomic!("long_char_string", 2, string),
    atomic!("octet_string", 1, string),
    atomic!("long_octet_string", 2, string),
    atomic!("attrib_id", 4),
    atomic!("cluster_id", 4),
    atomic!("command_id", 4),
    atomic!("event_id", 4),
    atomic!("endpoint_no", 2),
    atomic!("group_id", 2),
    atomic!("fabric_idx", 1),
    atomic!("node_id", 8),
    atomic!("vendor_id", 2),
    atomic!("devtype_id", 4),
    atomic!("epoch_s", 4),
    atomic!("epoch_us", 8),
    atomic!("percent", 1),
    atomic!("percent100ths", 2),
    atomic!("status", 1),
];

/// Looks up an atomic type by name (case insensitive).
///
/// ```
/// use zcl_data_model::atomic_type;
///
/// assert_eq!(atomic_type("INT16U").map(|t| t.size), Some(2));
/// assert!(atomic_type("SomeStruct").is_none());
/// ```
pub fn atomic_type(name: &str) -> Option<&'static AtomicType> {
    ATOMIC_TYPES
        .iter()
        .find(|t| t.name.eq_ignore_ascii_case(name))
}

/// Everything declared in a single capability-library file.
#[derive(Debug, Clone, PartialEq, PartialOrd, Default)]
pub struct Definition {
    pub clusters: Vec<Cluster>,
    pub extensions: Vec<ClusterExtension>,
    pub device_types: Vec<DeviceType>,
    pub enums: Vec<Enum>,
    pub bitmaps: Vec<Bitmap>,
    pub structs: Vec<Struct>,
}
