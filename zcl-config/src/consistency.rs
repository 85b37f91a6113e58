//! Derived notifications that keep an endpoint configuration honest.
//!
//! Each rule recomputes its complete message set from the current state and
//! hands it to [`notification::reconcile`]. Rules for endpoints are scoped to
//! one endpoint instance, so removing the endpoint removes exactly its
//! notifications.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;
use zcl_data_model::conformance::{self, try_evaluate, Conformance, Expr};
use zcl_data_model::{atomic_type, ApiMaturity, Side};

use crate::error::Result;
use crate::ids::*;
use crate::model::{FieldRow, NotificationScope, Origin, Rule};
use crate::notification::{self, Draft, Reconciled};
use crate::resolver::{feature_map_value, required_features, RequiredFeature};
use crate::store::Tables;

type EndpointRule = fn(&Tables, &EndpointContext) -> Result<Vec<Draft>>;

const ENDPOINT_RULES: [(Rule, EndpointRule); 4] = [
    (Rule::CommandResponse, command_responses),
    (Rule::ProvisionalCluster, provisional_clusters),
    (Rule::FeatureConformance, feature_conformance),
    (Rule::SpecCompliance, spec_compliance),
];

/// Re-runs every endpoint rule for one endpoint.
pub fn refresh_endpoint(db: &mut Tables, endpoint: EndpointId) -> Result<Reconciled> {
    let row = db.endpoint(endpoint)?.clone();
    let scope = NotificationScope::Session(row.session);
    let context = EndpointContext {
        endpoint: row.identifier,
        et: row.endpoint_type,
    };

    let mut total = Reconciled::default();
    for (rule, check) in ENDPOINT_RULES {
        let drafts = check(db, &context)?;
        let origin = Origin {
            rule,
            endpoint: Some(endpoint),
            package: None,
        };
        total += notification::reconcile(db, scope, origin, drafts);
    }
    debug!(%endpoint, ?total, "endpoint notifications refreshed");
    Ok(total)
}

/// Re-runs the endpoint rules of every endpoint instantiating `et`.
pub fn refresh_endpoint_type(db: &mut Tables, et: EndpointTypeId) -> Result<Reconciled> {
    let endpoints: Vec<EndpointId> = db.endpoints_of_type(et).map(|e| e.id).collect();
    let mut total = Reconciled::default();
    for endpoint in endpoints {
        total += refresh_endpoint(db, endpoint)?;
    }
    Ok(total)
}

/// Re-runs the package rules and every endpoint rule of a session.
pub fn refresh_session(db: &mut Tables, session: SessionId) -> Result<Reconciled> {
    let mut total = refresh_session_packages(db, session)?;
    let endpoints: Vec<EndpointId> = db.endpoints_of(session).map(|e| e.id).collect();
    for endpoint in endpoints {
        total += refresh_endpoint(db, endpoint)?;
    }
    Ok(total)
}

struct EndpointContext {
    /// Endpoint number as shown to the user
    endpoint: u32,
    et: EndpointTypeId,
}

fn side_suffix(side: Side) -> &'static str {
    match side {
        Side::Client => "client",
        Side::Server => "server",
    }
}

fn command_responses(db: &Tables, ctx: &EndpointContext) -> Result<Vec<Draft>> {
    let mut drafts = Vec::new();
    for (cluster, side) in db.enabled_clusters(ctx.et) {
        let cluster_row = db.cluster(cluster)?;
        for command in db.cluster_commands(cluster) {
            if !command.is_incoming_on(side) || !db.is_command_enabled(ctx.et, command.id, side) {
                continue;
            }
            let Some(response) = command.response.and_then(|r| db.commands.get(&r)) else {
                continue;
            };
            if !db.is_command_enabled(ctx.et, response.id, side) {
                drafts.push(Draft::warning(format!(
                    "On endpoint {}, cluster: {} {}, outgoing command: {} should be enabled as it is the response to the enabled incoming command: {}.",
                    ctx.endpoint,
                    cluster_row.name,
                    side_suffix(side),
                    response.name,
                    command.name
                )));
            }
        }
    }
    Ok(drafts)
}

fn provisional_clusters(db: &Tables, ctx: &EndpointContext) -> Result<Vec<Draft>> {
    let mut drafts = Vec::new();
    for (cluster, side) in db.enabled_clusters(ctx.et) {
        let cluster = db.cluster(cluster)?;
        if cluster.maturity == ApiMaturity::Provisional {
            drafts.push(Draft::warning(format!(
                "On endpoint {}, support for cluster: {} {} is provisional.",
                ctx.endpoint,
                cluster.name,
                side_suffix(side)
            )));
        }
    }
    Ok(drafts)
}

/// Prefix of every feature compliance message.
pub(crate) fn feature_prefix(endpoint: u32, cluster: &str, feature: &RequiredFeature) -> String {
    format!(
        "Check Feature Compliance on endpoint: {}, cluster: {}, feature: {} (bit {} in featureMap attribute)",
        endpoint, cluster, feature.feature.name, feature.feature.bit
    )
}

/// Message about a device type feature whose state disagrees with its
/// conformance, if there is one to show.
pub(crate) fn feature_state_warning(
    prefix: &str,
    feature: &RequiredFeature,
    features: &BTreeMap<String, bool>,
) -> Option<String> {
    let enabled = features.get(&feature.feature.code).copied().unwrap_or(false);
    let device_types = feature.device_types.join(", ");
    let outcome = match try_evaluate(&feature.conformance, features) {
        Ok(outcome) => outcome,
        Err(e) => {
            return Some(format!(
                "{} has conformance {} that cannot be evaluated for device type: {}: {}",
                prefix, feature.conformance, device_types, e.reason
            ))
        }
    };
    match outcome {
        Conformance::NotSupported if enabled => Some(format!(
            "{} should be disabled, as it is not supported for device type: {}",
            prefix, device_types
        )),
        Conformance::Provisional if enabled => Some(format!(
            "{} is enabled, but it is still provisional for device type: {}",
            prefix, device_types
        )),
        Conformance::Mandatory if !enabled => Some(format!(
            "{} should be enabled, as it is mandatory for device type: {}",
            prefix, device_types
        )),
        _ => None,
    }
}

/// An attribute, command or event of one cluster side, with its state.
#[derive(Debug, Clone)]
pub(crate) struct Element {
    pub kind: &'static str,
    pub name: String,
    pub conformance: String,
    pub enabled: bool,
    pub target: ElementRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ElementRef {
    Attribute(AttributeId),
    Command(CommandId),
    Event(EventId),
}

pub(crate) fn cluster_elements(
    db: &Tables,
    et: EndpointTypeId,
    cluster: ClusterId,
    side: Side,
) -> Vec<Element> {
    let attributes = db
        .cluster_attributes(cluster)
        .filter(|a| a.side == side)
        .map(|a| Element {
            kind: "attribute",
            name: a.name.clone(),
            conformance: a.conformance.clone(),
            enabled: db.is_attribute_included(et, a.id),
            target: ElementRef::Attribute(a.id),
        });
    let commands = db.cluster_commands(cluster).map(|c| Element {
        kind: "command",
        name: c.name.clone(),
        conformance: c.conformance.clone(),
        enabled: db.is_command_enabled(et, c.id, side),
        target: ElementRef::Command(c.id),
    });
    let events = db
        .cluster_events(cluster)
        .filter(|e| e.side == side)
        .map(|e| Element {
            kind: "event",
            name: e.name.clone(),
            conformance: e.conformance.clone(),
            enabled: db.is_event_included(et, e.id),
            target: ElementRef::Event(e.id),
        });
    attributes.chain(commands).chain(events).collect()
}

/// Feature values plus the state of every element of a cluster side, as
/// element conformance may reference both.
pub(crate) fn element_terms(
    features: &BTreeMap<String, bool>,
    elements: &[Element],
) -> BTreeMap<String, bool> {
    let mut terms = features.clone();
    for element in elements {
        terms.insert(element.name.clone(), element.enabled);
    }
    terms.insert("Matter".into(), true);
    terms.insert("Zigbee".into(), false);
    terms
}

fn feature_conformance(db: &Tables, ctx: &EndpointContext) -> Result<Vec<Draft>> {
    let mut drafts = Vec::new();
    for (cluster, side) in db.enabled_clusters(ctx.et) {
        let cluster_name = &db.cluster(cluster)?.name;
        let context = format!(
            "Check Feature Compliance on endpoint: {}, cluster: {}, ",
            ctx.endpoint, cluster_name
        );
        let elements = cluster_elements(db, ctx.et, cluster, side);
        for element in &elements {
            if let Err(e) = Expr::parse(&element.conformance) {
                drafts.push(Draft::warning(format!(
                    "{}{}: {} has conformance {} that cannot be evaluated: {}",
                    context, element.kind, element.name, element.conformance, e.reason
                )));
            }
        }

        let required = required_features(db, ctx.et, cluster);
        if required.is_empty() {
            continue;
        }
        let value = feature_map_value(db, ctx.et, cluster, side);
        let features: BTreeMap<String, bool> = required
            .iter()
            .map(|r| (r.feature.code.clone(), value & (1 << r.feature.bit) != 0))
            .collect();

        for feature in &required {
            let prefix = feature_prefix(ctx.endpoint, cluster_name, feature);
            if let Some(message) = feature_state_warning(&prefix, feature, &features) {
                drafts.push(Draft::warning(message));
            }
        }

        let mut device_types: Vec<&str> = Vec::new();
        for name in required.iter().flat_map(|r| r.device_types.iter()) {
            if !device_types.contains(&name.as_str()) {
                device_types.push(name.as_str());
            }
        }
        let device_types = device_types.join(", ");

        let terms = element_terms(&features, &elements);
        for element in &elements {
            if let Some(message) = element_warning(element, &features, &terms) {
                drafts.push(Draft::warning(format!(
                    "{}{} for device type: {}.",
                    context, message, device_types
                )));
            }
        }
    }
    Ok(drafts)
}

/// Warning for an element whose state contradicts a conformance that
/// depends on features or other elements. Malformed conformance is reported
/// separately.
fn element_warning(
    element: &Element,
    features: &BTreeMap<String, bool>,
    terms: &BTreeMap<String, bool>,
) -> Option<String> {
    let outcome = try_evaluate(&element.conformance, terms).ok()?;
    let referenced = conformance::terms(&element.conformance);
    if !referenced.iter().any(|t| terms.contains_key(*t)) {
        return None;
    }

    let suggested = match outcome {
        Conformance::Mandatory if !element.enabled => "enabled",
        Conformance::NotSupported if element.enabled => "disabled",
        _ => return None,
    };

    let state = |on: bool| if on { "enabled" } else { "disabled" };
    let mut described: Vec<String> = referenced
        .iter()
        .filter_map(|t| features.get(*t).map(|on| format!("feature: {} is {}", t, state(*on))))
        .collect();
    described.extend(
        referenced
            .iter()
            .filter(|t| !features.contains_key(**t) && !conformance::is_literal(t))
            .map(|t| {
                format!(
                    "element: {} is {}",
                    t,
                    state(terms.get(*t).copied().unwrap_or(false))
                )
            }),
    );

    Some(format!(
        "{}: {} has mandatory conformance to {} and should be {} when {}",
        element.kind,
        element.name,
        element.conformance,
        suggested,
        described.join(", ")
    ))
}

fn spec_compliance(db: &Tables, ctx: &EndpointContext) -> Result<Vec<Draft>> {
    let mut drafts = Vec::new();
    let endpoint_type = db.endpoint_type(ctx.et)?;
    for device_type in endpoint_type.device_type_refs() {
        let Some(device) = db.device_types.get(&device_type) else {
            continue;
        };
        let prefix = format!(
            "Check Spec Compliance on endpoint: {}, device type: {}",
            ctx.endpoint, device.name
        );
        for requirement in db.device_type_clusters_of(device_type) {
            let Some(cluster) = requirement.cluster.and_then(|c| db.clusters.get(&c)) else {
                continue;
            };
            let mut any_enabled = false;
            for side in requirement.sides() {
                if db.is_cluster_enabled(ctx.et, cluster.id, side) {
                    any_enabled = true;
                } else {
                    drafts.push(Draft::warning(format!(
                        "{}, cluster: {} {} needs to be enabled",
                        prefix,
                        cluster.name,
                        side_suffix(side)
                    )));
                }
            }
            if !any_enabled {
                continue;
            }
            for attribute in &requirement.attributes {
                let Some(row) = attribute.attribute.and_then(|a| db.attributes.get(&a)) else {
                    continue;
                };
                if !db.is_attribute_included(ctx.et, row.id) {
                    drafts.push(Draft::warning(format!(
                        "{}, cluster: {}, attribute: {} needs to be enabled",
                        prefix, cluster.name, row.name
                    )));
                }
            }
            for command in &requirement.commands {
                let Some(row) = command.command.and_then(|c| db.commands.get(&c)) else {
                    continue;
                };
                let enabled = requirement
                    .sides()
                    .any(|side| db.is_command_enabled(ctx.et, row.id, side));
                if !enabled {
                    drafts.push(Draft::warning(format!(
                        "{}, cluster: {}, command: {} needs to be enabled",
                        prefix, cluster.name, row.name
                    )));
                }
            }
        }
    }
    Ok(drafts)
}

/// Re-runs the rules over the packages of a session: code conflicts between
/// packages and references to undefined data types.
pub fn refresh_session_packages(db: &mut Tables, session: SessionId) -> Result<Reconciled> {
    let packages: BTreeSet<PackageId> = db.session(session)?.packages.iter().copied().collect();
    let scope = NotificationScope::Session(session);

    let mut by_origin: BTreeMap<Origin, Vec<Draft>> = BTreeMap::new();
    // Origins reported earlier must be revisited even if they produce nothing now
    for n in db.notifications.values().filter(|n| n.scope == scope) {
        if matches!(n.origin.rule, Rule::CodeConflict | Rule::UndefinedDataType) {
            by_origin.entry(n.origin).or_default();
        }
    }

    for (package, draft) in code_conflicts(db, &packages) {
        by_origin
            .entry(origin(Rule::CodeConflict, package))
            .or_default()
            .push(draft);
    }

    let mut package_drafts: BTreeMap<PackageId, Vec<Draft>> = BTreeMap::new();
    for package in &packages {
        let drafts = undefined_types(db, &packages, *package);
        by_origin
            .entry(origin(Rule::UndefinedDataType, *package))
            .or_default()
            .extend(drafts.iter().cloned());
        package_drafts.insert(*package, drafts);
    }

    let mut total = Reconciled::default();
    for (origin, drafts) in by_origin {
        total += notification::reconcile(db, scope, origin, drafts);
    }
    for (package, drafts) in package_drafts {
        total += notification::reconcile(
            db,
            NotificationScope::Package(package),
            origin(Rule::UndefinedDataType, package),
            drafts,
        );
    }
    Ok(total)
}

fn origin(rule: Rule, package: PackageId) -> Origin {
    Origin {
        rule,
        endpoint: None,
        package: Some(package),
    }
}

/// Conflicts between packages defining the same codes. Each conflict is
/// attributed to the package loaded last.
fn code_conflicts(db: &Tables, packages: &BTreeSet<PackageId>) -> Vec<(PackageId, Draft)> {
    let path = |p: &PackageId| {
        db.packages
            .get(p)
            .map(|p| p.path.display().to_string())
            .unwrap_or_default()
    };
    let cluster_code = |c: Option<ClusterId>| c.and_then(|c| db.clusters.get(&c)).map(|c| c.code);

    let mut clusters: BTreeMap<(u64, Option<u64>), BTreeSet<PackageId>> = BTreeMap::new();
    for c in db.clusters.values().filter(|c| packages.contains(&c.package)) {
        clusters
            .entry((c.code, c.manufacturer_code))
            .or_default()
            .insert(c.package);
    }

    let mut commands: BTreeMap<(u64, u64, Side), BTreeSet<PackageId>> = BTreeMap::new();
    for c in db.commands.values().filter(|c| packages.contains(&c.package)) {
        if let Some(code) = cluster_code(c.cluster) {
            commands
                .entry((code, c.code, c.source))
                .or_default()
                .insert(c.package);
        }
    }

    let mut attributes: BTreeMap<(u64, u64, Side), BTreeSet<PackageId>> = BTreeMap::new();
    for a in db.attributes.values().filter(|a| packages.contains(&a.package)) {
        if let Some(code) = cluster_code(a.cluster) {
            attributes
                .entry((code, a.code, a.side))
                .or_default()
                .insert(a.package);
        }
    }

    let mut conflicts = Vec::new();
    let mut report = |owners: &BTreeSet<PackageId>, what: String| {
        let mut owners = owners.iter();
        let Some(first) = owners.next() else {
            return;
        };
        for other in owners {
            conflicts.push((
                *other,
                Draft::error(format!(
                    "{} is defined in both {} and {}",
                    what,
                    path(first),
                    path(other)
                )),
            ));
        }
    };

    for ((code, manufacturer), owners) in &clusters {
        let what = match manufacturer {
            Some(m) => format!("Cluster code conflict: cluster 0x{:04X} (manufacturer 0x{:04X})", code, m),
            None => format!("Cluster code conflict: cluster 0x{:04X}", code),
        };
        report(owners, what);
    }
    for ((cluster, code, side), owners) in &commands {
        report(
            owners,
            format!(
                "Command code conflict: {} command 0x{:04X} of cluster 0x{:04X}",
                side_suffix(*side),
                code,
                cluster
            ),
        );
    }
    for ((cluster, code, side), owners) in &attributes {
        report(
            owners,
            format!(
                "Attribute code conflict: {} attribute 0x{:04X} of cluster 0x{:04X}",
                side_suffix(*side),
                code,
                cluster
            ),
        );
    }
    conflicts
}

fn undefined_types(db: &Tables, packages: &BTreeSet<PackageId>, package: PackageId) -> Vec<Draft> {
    let defined: BTreeSet<String> = db
        .data_types
        .values()
        .filter(|t| packages.contains(&t.package))
        .map(|t| t.name.to_lowercase())
        .collect();
    let is_defined = |field: &FieldRow| {
        atomic_type(&field.type_name).is_some() || defined.contains(&field.type_name.to_lowercase())
    };
    let path = db
        .packages
        .get(&package)
        .map(|p| p.path.display().to_string())
        .unwrap_or_default();

    let mut drafts = Vec::new();
    for attribute in db.attributes.values().filter(|a| a.package == package) {
        if !is_defined(&attribute.field) {
            drafts.push(Draft::error(format!(
                "Undefined Data Type: Attribute {} in {} has type {} which is not defined",
                attribute.name, path, attribute.field.type_name
            )));
        }
    }
    for command in db.commands.values().filter(|c| c.package == package) {
        for arg in command.args.iter().filter(|a| !is_defined(a)) {
            drafts.push(Draft::error(format!(
                "Undefined Data Type: Argument {} of command {} in {} has type {} which is not defined",
                arg.name, command.name, path, arg.type_name
            )));
        }
    }
    for event in db.events.values().filter(|e| e.package == package) {
        for field in event.fields.iter().filter(|f| !is_defined(f)) {
            drafts.push(Draft::error(format!(
                "Undefined Data Type: Field {} of event {} in {} has type {} which is not defined",
                field.name, event.name, path, field.type_name
            )));
        }
    }
    for data_type in db.data_types.values().filter(|t| t.package == package) {
        for field in data_type.fields.iter().filter(|f| !is_defined(f)) {
            drafts.push(Draft::error(format!(
                "Undefined Data Type: Field {} of struct {} in {} has type {} which is not defined",
                field.name, data_type.name, path, field.type_name
            )));
        }
    }
    drafts
}
