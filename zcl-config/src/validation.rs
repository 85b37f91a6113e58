//! Checks on user-entered endpoint and attribute values.

use serde::Serialize;
use zcl_data_model::atomic_type;

use crate::error::Result;
use crate::ids::{AttributeId, EndpointId, EndpointTypeId};
use crate::model::AttributeRow;
use crate::store::Tables;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointIssues {
    pub endpoint_id: Vec<String>,
    pub network_id: Vec<String>,
}

impl EndpointIssues {
    pub fn is_empty(&self) -> bool {
        self.endpoint_id.is_empty() && self.network_id.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeIssues {
    pub default_value: Vec<String>,
}

/// Decimal or hexadecimal digits, optionally prefixed by `0x`.
pub fn is_valid_number_string(value: &str) -> bool {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_hexdigit())
}

/// Digits with at most one decimal point. The empty string passes.
pub fn is_valid_float(value: &str) -> bool {
    value.chars().filter(|c| *c == '.').count() <= 1
        && value.chars().all(|c| c.is_ascii_digit() || c == '.')
}

/// Decimal when the value is all digits, hexadecimal otherwise.
pub fn extract_integer_value(value: &str) -> Option<i128> {
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
        return value.parse().ok();
    }
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    i128::from_str_radix(digits, 16).ok()
}

/// Checks raw endpoint and network id input.
pub fn validate_endpoint_fields(endpoint_id: &str, network_id: &str) -> EndpointIssues {
    let mut issues = EndpointIssues::default();
    if !is_valid_number_string(endpoint_id) {
        issues
            .endpoint_id
            .push("EndpointId is invalid number string".into());
    }
    let value = extract_integer_value(endpoint_id);
    if value.is_some_and(|v| !(0..=0xFFFF).contains(&v)) {
        issues
            .endpoint_id
            .push("EndpointId is out of valid range".into());
    }
    if !is_valid_number_string(network_id) {
        issues
            .network_id
            .push("NetworkId is invalid number string".into());
    }
    if value == Some(0) {
        issues.endpoint_id.push("0 is not a valid endpointId".into());
    }
    issues
}

/// Validates a stored endpoint, including uniqueness of its identifier
/// within the session.
pub fn validate_endpoint(db: &Tables, endpoint: EndpointId) -> Result<EndpointIssues> {
    let row = db.endpoint(endpoint)?;
    let mut issues =
        validate_endpoint_fields(&row.identifier.to_string(), &row.network.to_string());
    let same = db
        .endpoints_of(row.session)
        .filter(|e| e.identifier == row.identifier)
        .count();
    if same > 1 {
        issues
            .endpoint_id
            .push("Duplicate EndpointIds Exist".into());
    }
    Ok(issues)
}

fn is_string_type(type_name: &str) -> bool {
    atomic_type(type_name).is_some_and(|t| t.is_string)
}

fn is_float_type(type_name: &str) -> bool {
    atomic_type(type_name).is_some_and(|t| t.is_float)
}

/// Checks a default value against the type and bounds of an attribute.
pub fn validate_default_value(attribute: &AttributeRow, value: &str) -> AttributeIssues {
    let mut issues = AttributeIssues::default();
    let type_name = &attribute.field.type_name;
    if is_string_type(type_name) {
        return issues;
    }

    if is_float_type(type_name) {
        if !is_valid_float(value) {
            issues.default_value.push("Invalid Float".into());
        }
        let in_range = value.parse::<f64>().is_ok_and(|v| {
            attribute.min.map_or(true, |min| v >= min as f64)
                && attribute.max.map_or(true, |max| v <= max as f64)
        });
        if !in_range {
            issues.default_value.push("Out of range".into());
        }
    } else {
        if !is_valid_number_string(value) {
            issues.default_value.push("Invalid Integer".into());
        }
        let in_range = extract_integer_value(value).is_some_and(|v| {
            attribute.min.map_or(true, |min| v >= i128::from(min))
                && attribute.max.map_or(true, |max| v <= i128::from(max))
        });
        if !in_range {
            issues.default_value.push("Out of range".into());
        }
    }
    issues
}

/// Validates the default an endpoint type carries for an attribute.
pub fn validate_attribute_default(
    db: &Tables,
    et: EndpointTypeId,
    attribute: AttributeId,
) -> Result<AttributeIssues> {
    let row = db.attribute(attribute)?;
    let value = db
        .endpoint_type_attributes
        .get(&(et, attribute))
        .and_then(|a| a.default_value.as_deref())
        .or(row.default.as_deref())
        .unwrap_or("");
    Ok(validate_default_value(row, value))
}
