//! Helpers callable from templates.
//!
//! Built-in helpers are native functions grouped by concern. Helper files add
//! template-defined helpers:
//!
//! ```text
//! {{#define "field" name type}}{{as_type type}} {{name}};{{/define}}
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use convert_case::{Case, Casing};
use serde::Deserialize;
use serde_json::{Map, Value};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use tracing::debug;
use zcl_data_model::atomic_type;

use crate::template::{display, is_truthy, Expr, Node, Template, TemplateError};

/// Prefix of manifest helper entries that name a built-in group.
pub const BUILTIN_ALIAS_PREFIX: &str = "builtin:";

pub type HelperFn = fn(&HelperArgs<'_>) -> Result<Value, String>;

/// Evaluated arguments of one helper invocation.
pub struct HelperArgs<'a> {
    pub params: &'a [Value],
    pub hash: &'a Map<String, Value>,
    /// The root render context
    pub root: &'a Value,
    pub env: &'a HelperEnv,
}

/// Parses decimal, `0x` hexadecimal and numeric JSON values.
pub fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok())),
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => i64::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            }
        }
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

impl HelperArgs<'_> {
    pub fn param(&self, index: usize) -> Result<&Value, String> {
        self.params
            .get(index)
            .ok_or_else(|| format!("missing argument {}", index + 1))
    }

    pub fn text(&self, index: usize) -> Result<String, String> {
        self.param(index).map(display)
    }

    pub fn integer(&self, index: usize) -> Result<i64, String> {
        as_integer(self.param(index)?)
            .ok_or_else(|| format!("argument {} is not an integer", index + 1))
    }

    pub fn hash_text(&self, key: &str) -> Option<String> {
        self.hash.get(key).map(display)
    }
}

/// Settings shared by every helper of one generation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelperEnv {
    /// Type name replacements consulted by `as_type`
    pub type_overrides: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct OverrideFile {
    #[serde(default)]
    types: BTreeMap<String, String>,
}

impl HelperEnv {
    /// Reads an override file: `{ "types": { "<zcl type>": "<target type>" } }`.
    pub fn from_override_file(content: &str) -> Result<Self, serde_json::Error> {
        let file: OverrideFile = serde_json::from_str(content)?;
        Ok(Self {
            type_overrides: file.types,
        })
    }
}

#[derive(Clone)]
pub enum Helper {
    Native {
        func: HelperFn,
        /// Name of the helper that replaces this one
        deprecated: Option<&'static str>,
    },
    Template {
        params: Vec<String>,
        body: Vec<Node>,
    },
}

impl fmt::Debug for Helper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Helper::Native { deprecated, .. } => f
                .debug_struct("Native")
                .field("deprecated", deprecated)
                .finish(),
            Helper::Template { params, .. } => {
                f.debug_struct("Template").field("params", params).finish()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum HelperGroup {
    #[strum(serialize = "string")]
    Text,
    Zcl,
    Endpoint,
    Logic,
}

type Builtin = (&'static str, HelperFn, Option<&'static str>);

impl HelperGroup {
    fn builtins(self) -> &'static [Builtin] {
        match self {
            HelperGroup::Text => STRING_HELPERS,
            HelperGroup::Zcl => ZCL_HELPERS,
            HelperGroup::Endpoint => ENDPOINT_HELPERS,
            HelperGroup::Logic => LOGIC_HELPERS,
        }
    }

    pub fn helper_names(self) -> impl Iterator<Item = &'static str> {
        self.builtins().iter().map(|(name, _, _)| *name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HelperRegistry {
    helpers: BTreeMap<String, Helper>,
}

impl HelperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in group.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for group in HelperGroup::iter() {
            registry.register_group(group);
        }
        registry
    }

    pub fn register_group(&mut self, group: HelperGroup) {
        for (name, func, deprecated) in group.builtins() {
            self.helpers.insert(
                name.to_string(),
                Helper::Native {
                    func: *func,
                    deprecated: *deprecated,
                },
            );
        }
    }

    pub fn register(&mut self, name: impl Into<String>, func: HelperFn) {
        self.helpers.insert(
            name.into(),
            Helper::Native {
                func,
                deprecated: None,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&Helper> {
        self.helpers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.helpers.contains_key(name)
    }

    /// Registers the `define` blocks of a helper file, returning how many
    /// helpers it defined. Later definitions replace earlier ones.
    pub fn load_helper_file(&mut self, name: &str, source: &str) -> Result<usize, TemplateError> {
        let template = Template::parse(name, source)?;
        let syntax = |line: usize, message: &str| TemplateError::Syntax {
            template: name.to_string(),
            line,
            message: message.to_string(),
        };

        let mut defined = 0;
        let mut last_line = 1;
        for node in template.nodes {
            match node {
                Node::Text(text) if text.trim().is_empty() => {}
                Node::Block {
                    call, body, line, ..
                } if call.helper_name() == Some("define") => {
                    last_line = line;
                    let (helper, params) = match call.params.split_first() {
                        Some((Expr::Literal(Value::String(helper)), rest)) if call.hash.is_empty() => {
                            let params = rest
                                .iter()
                                .map(|p| match p {
                                    Expr::Path(path) => path.helper_name().map(String::from),
                                    _ => None,
                                })
                                .collect::<Option<Vec<_>>>()
                                .ok_or_else(|| syntax(line, "helper parameters must be plain names"))?;
                            (helper.clone(), params)
                        }
                        _ => return Err(syntax(line, "'define' needs a quoted helper name")),
                    };
                    debug!(file = name, helper = %helper, "defined helper");
                    self.helpers.insert(helper, Helper::Template { params, body });
                    defined += 1;
                }
                Node::Value { line, .. } | Node::Block { line, .. } | Node::Partial { line, .. } => {
                    return Err(syntax(line, "helper files may only contain 'define' blocks"));
                }
                Node::Text(_) => {
                    return Err(syntax(last_line, "helper files may only contain 'define' blocks"));
                }
            }
        }
        Ok(defined)
    }
}

fn text(value: String) -> Result<Value, String> {
    Ok(Value::String(value))
}

fn cased(args: &HelperArgs<'_>, case: Case) -> Result<Value, String> {
    text(args.text(0)?.to_case(case))
}

const STRING_HELPERS: &[Builtin] = &[
    ("as_upper_camel_case", |a| cased(a, Case::Pascal), None),
    ("as_lower_camel_case", |a| cased(a, Case::Camel), None),
    ("as_snake_case", |a| cased(a, Case::Snake), None),
    ("as_upper_snake_case", |a| cased(a, Case::UpperSnake), None),
    ("as_spaced_lowercase", |a| cased(a, Case::Lower), None),
    (
        "as_delimited_macro",
        |a| cased(a, Case::UpperSnake),
        Some("as_upper_snake_case"),
    ),
    ("as_upper", |a| text(a.text(0)?.to_uppercase()), None),
    ("as_lower", |a| text(a.text(0)?.to_lowercase()), None),
    ("trim", |a| text(a.text(0)?.trim().to_string()), None),
    ("cleanse_label", cleanse_label, None),
    (
        "concat",
        |a| text(a.params.iter().map(display).collect()),
        None,
    ),
    (
        "replace",
        |a| text(a.text(0)?.replace(&a.text(1)?, &a.text(2)?)),
        None,
    ),
    ("pad", pad, None),
];

/// Keeps letters, digits and underscores; everything else becomes `_`.
fn cleanse_label(args: &HelperArgs<'_>) -> Result<Value, String> {
    text(
        args.text(0)?
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect(),
    )
}

/// `{{pad text width [fill="."]}}` pads on the right to `width` characters.
fn pad(args: &HelperArgs<'_>) -> Result<Value, String> {
    let mut value = args.text(0)?;
    let width = usize::try_from(args.integer(1)?).map_err(|e| e.to_string())?;
    let fill = args
        .hash_text("fill")
        .and_then(|f| f.chars().next())
        .unwrap_or(' ');
    while value.chars().count() < width {
        value.push(fill);
    }
    text(value)
}

const ZCL_HELPERS: &[Builtin] = &[
    ("as_hex", as_hex, None),
    ("as_type", as_type, None),
    (
        "type_size",
        |a| Ok(Value::from(atomic_type(&a.text(0)?).map_or(0, |t| t.size))),
        None,
    ),
    (
        "is_string_type",
        |a| Ok(Value::Bool(atomic_type(&a.text(0)?).is_some_and(|t| t.is_string))),
        None,
    ),
    (
        "is_atomic",
        |a| Ok(Value::Bool(atomic_type(&a.text(0)?).is_some())),
        None,
    ),
    ("add_one", |a| Ok(Value::from(a.integer(0)? + 1)), None),
];

/// `{{as_hex value [width]}}`: `0x` followed by upper-case digits, zero
/// padded to `width` digits.
fn as_hex(args: &HelperArgs<'_>) -> Result<Value, String> {
    let value = args.integer(0)?;
    let width = match args.params.get(1) {
        Some(w) => usize::try_from(as_integer(w).unwrap_or(0)).unwrap_or(0),
        None => 0,
    };
    text(format!("0x{:0width$X}", value, width = width))
}

fn builtin_c_type(type_name: &str) -> Option<String> {
    let atomic = atomic_type(type_name)?;
    let lower = atomic.name;
    Some(match lower {
        "boolean" => "bool".to_string(),
        "single" => "float".to_string(),
        "double" => "double".to_string(),
        _ if atomic.is_string => "uint8_t *".to_string(),
        _ => {
            let bits = match atomic.size {
                1 => 8,
                2 => 16,
                3 | 4 => 32,
                _ => 64,
            };
            if atomic.is_signed {
                format!("int{}_t", bits)
            } else {
                format!("uint{}_t", bits)
            }
        }
    })
}

/// `{{as_type type}}`: the override for `type` if the manifest has one,
/// the C type of an atomic type, otherwise the type name itself.
fn as_type(args: &HelperArgs<'_>) -> Result<Value, String> {
    let type_name = args.text(0)?;
    let overrides = &args.env.type_overrides;
    let resolved = overrides
        .get(&type_name)
        .or_else(|| overrides.get(&type_name.to_lowercase()))
        .cloned()
        .or_else(|| builtin_c_type(&type_name))
        .unwrap_or(type_name);
    text(resolved)
}

const ENDPOINT_HELPERS: &[Builtin] = &[
    ("endpoint_count", |a| Ok(Value::from(root_list(a, "endpoints").len())), None),
    (
        "endpoint_type_count",
        |a| Ok(Value::from(root_list(a, "endpointTypes").len())),
        None,
    ),
    (
        "endpoint_cluster_count",
        |a| Ok(Value::from(endpoint_clusters(a).count())),
        None,
    ),
    (
        "endpoint_attribute_count",
        |a| Ok(Value::from(cluster_members(a, "attributes").count())),
        None,
    ),
    (
        "endpoint_command_count",
        |a| Ok(Value::from(cluster_members(a, "commands").count())),
        None,
    ),
    (
        "attribute_size",
        |a| Ok(Value::from(attribute_size(a.param(0)?))),
        None,
    ),
    (
        "endpoint_largest_attribute_size",
        |a| {
            Ok(Value::from(
                cluster_members(a, "attributes")
                    .map(attribute_size)
                    .max()
                    .unwrap_or(0),
            ))
        },
        None,
    ),
    (
        "endpoint_fixed_endpoint_array",
        |a| fixed_array(a, "endpointId", true),
        None,
    ),
    (
        "endpoint_fixed_profile_id_array",
        |a| fixed_array(a, "profileId", true),
        None,
    ),
    (
        "endpoint_fixed_network_array",
        |a| fixed_array(a, "networkId", false),
        None,
    ),
];

fn root_list<'a>(args: &HelperArgs<'a>, key: &str) -> &'a [Value] {
    args.root
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Endpoint types the helper applies to: the one passed as first argument,
/// or every endpoint type of the session.
fn endpoint_types<'a>(args: &HelperArgs<'a>) -> Vec<&'a Value> {
    match args.params.first() {
        Some(et @ Value::Object(_)) => vec![et],
        _ => root_list(args, "endpointTypes").iter().collect(),
    }
}

fn endpoint_clusters<'a>(args: &HelperArgs<'a>) -> impl Iterator<Item = &'a Value> {
    endpoint_types(args).into_iter().flat_map(|et| {
        et.get("clusters")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    })
}

fn cluster_members<'a>(args: &HelperArgs<'a>, key: &'static str) -> impl Iterator<Item = &'a Value> {
    endpoint_clusters(args).flat_map(move |cluster| {
        cluster
            .get(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    })
}

/// Storage bytes of an attribute: strings take their maximum length plus
/// the length prefix, other atomic types their size, anything else 0.
pub fn attribute_size(attribute: &Value) -> u64 {
    let Some(atomic) = attribute
        .get("type")
        .and_then(Value::as_str)
        .and_then(atomic_type)
    else {
        return 0;
    };
    if atomic.is_string {
        let max_length = attribute
            .get("maxLength")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        max_length + u64::from(atomic.size)
    } else {
        u64::from(atomic.size)
    }
}

fn fixed_array(args: &HelperArgs<'_>, key: &str, hex: bool) -> Result<Value, String> {
    let items: Vec<String> = root_list(args, "endpoints")
        .iter()
        .map(|e| {
            let value = e.get(key).and_then(as_integer).unwrap_or(0);
            if hex {
                format!("{:#06X}", value)
            } else {
                value.to_string()
            }
        })
        .collect();
    text(format!("{{ {} }}", items.join(", ")))
}

const LOGIC_HELPERS: &[Builtin] = &[
    ("eq", |a| Ok(Value::Bool(loose_eq(a.param(0)?, a.param(1)?))), None),
    ("ne", |a| Ok(Value::Bool(!loose_eq(a.param(0)?, a.param(1)?))), None),
    ("lt", |a| compare(a, Ordering::is_lt), None),
    ("le", |a| compare(a, Ordering::is_le), None),
    ("gt", |a| compare(a, Ordering::is_gt), None),
    ("ge", |a| compare(a, Ordering::is_ge), None),
    (
        "and",
        |a| Ok(Value::Bool(!a.params.is_empty() && a.params.iter().all(is_truthy))),
        None,
    ),
    ("or", |a| Ok(Value::Bool(a.params.iter().any(is_truthy))), None),
    ("not", |a| Ok(Value::Bool(!is_truthy(a.param(0)?))), None),
    (
        "default",
        |a| {
            let value = a.param(0)?;
            Ok(if is_truthy(value) { value } else { a.param(1)? }.clone())
        },
        None,
    ),
    ("lookup", lookup, None),
    ("count", count, None),
];

/// Equality where numbers compare by value and numeric strings match numbers.
fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            as_integer(left).is_some() && as_integer(left) == as_integer(right)
        }
        (Value::Number(l), Value::Number(r)) => l.as_f64() == r.as_f64(),
        _ => left == right,
    }
}

fn compare(args: &HelperArgs<'_>, accept: fn(Ordering) -> bool) -> Result<Value, String> {
    let (left, right) = (args.param(0)?, args.param(1)?);
    let ordering = match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l.partial_cmp(&r),
        _ => Some(display(left).cmp(&display(right))),
    };
    Ok(Value::Bool(ordering.is_some_and(accept)))
}

fn lookup(args: &HelperArgs<'_>) -> Result<Value, String> {
    let key = args.param(1)?;
    Ok(match args.param(0)? {
        Value::Object(map) => map.get(&display(key)).cloned().unwrap_or(Value::Null),
        Value::Array(items) => as_integer(key)
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| items.get(i))
            .cloned()
            .unwrap_or(Value::Null),
        _ => Value::Null,
    })
}

fn count(args: &HelperArgs<'_>) -> Result<Value, String> {
    Ok(Value::from(match args.param(0)? {
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        Value::String(s) => s.chars().count(),
        _ => 0,
    }))
}
