//! Second load pass: resolves name references into row ids.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};
use zcl_data_model::Side;

use crate::error::Result;
use crate::ids::*;
use crate::model::{NotificationScope, Origin, Rule};
use crate::notification::{self, Draft};
use crate::package;
use crate::store::Tables;

#[derive(Debug, Clone, Default)]
pub struct LinkOptions {
    pub session: Option<SessionId>,
    pub prune_unresolved_clusters: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkReport {
    pub resolved: usize,
    pub unresolved: usize,
    pub pruned: usize,
}

/// Links every still unresolved reference of the packages visible to `batch`.
///
/// Names match case-insensitively and only against packages in the known set
/// (see [`package::known_packages`]). References that stay unresolved are
/// reported as package notifications.
pub fn link(db: &mut Tables, batch: &[PackageId], options: &LinkOptions) -> Result<LinkReport> {
    let known = package::known_packages(db, options.session, batch)?;
    let mut report = LinkReport::default();
    let mut problems: BTreeMap<PackageId, Vec<Draft>> =
        known.iter().map(|p| (*p, Vec::new())).collect();

    link_extensions(db, &known, &mut report, &mut problems);
    link_responses(db, &known, &mut report, &mut problems);
    link_device_types(db, &known, options, &mut report, &mut problems);

    for (package, drafts) in problems {
        notification::reconcile(
            db,
            NotificationScope::Package(package),
            Origin {
                rule: Rule::UnresolvedReference,
                endpoint: None,
                package: Some(package),
            },
            drafts,
        );
    }

    debug!(?report, "link pass done");
    Ok(report)
}

/// Lowest id cluster of the known set with the given name.
pub(crate) fn find_cluster(db: &Tables, known: &BTreeSet<PackageId>, name: &str) -> Option<ClusterId> {
    db.clusters
        .values()
        .find(|c| known.contains(&c.package) && c.name.eq_ignore_ascii_case(name))
        .map(|c| c.id)
}

fn link_extensions(
    db: &mut Tables,
    known: &BTreeSet<PackageId>,
    report: &mut LinkReport,
    problems: &mut BTreeMap<PackageId, Vec<Draft>>,
) {
    let mut unresolved = Vec::new();

    let pending: Vec<_> = db
        .attributes
        .values()
        .filter(|a| known.contains(&a.package) && a.cluster.is_none())
        .filter_map(|a| Some((a.id, a.package, a.cluster_ref.clone()?, a.name.clone())))
        .collect();
    for (id, package, target, name) in pending {
        match find_cluster(db, known, &target) {
            Some(cluster) => {
                if let Some(a) = db.attributes.get_mut(&id) {
                    a.cluster = Some(cluster);
                }
                report.resolved += 1;
            }
            None => unresolved.push((package, target, "attribute", name)),
        }
    }

    let pending: Vec<_> = db
        .commands
        .values()
        .filter(|c| known.contains(&c.package) && c.cluster.is_none())
        .filter_map(|c| Some((c.id, c.package, c.cluster_ref.clone()?, c.name.clone())))
        .collect();
    for (id, package, target, name) in pending {
        match find_cluster(db, known, &target) {
            Some(cluster) => {
                if let Some(c) = db.commands.get_mut(&id) {
                    c.cluster = Some(cluster);
                }
                report.resolved += 1;
            }
            None => unresolved.push((package, target, "command", name)),
        }
    }

    let pending: Vec<_> = db
        .events
        .values()
        .filter(|e| known.contains(&e.package) && e.cluster.is_none())
        .filter_map(|e| Some((e.id, e.package, e.cluster_ref.clone()?, e.name.clone())))
        .collect();
    for (id, package, target, name) in pending {
        match find_cluster(db, known, &target) {
            Some(cluster) => {
                if let Some(e) = db.events.get_mut(&id) {
                    e.cluster = Some(cluster);
                }
                report.resolved += 1;
            }
            None => unresolved.push((package, target, "event", name)),
        }
    }

    for (package, target, kind, name) in unresolved {
        warn!(%package, cluster = %target, kind, name, "extension of unknown cluster");
        report.unresolved += 1;
        push(
            problems,
            package,
            format!(
                "Cluster extension references unknown cluster: {} ({} {})",
                target, kind, name
            ),
        );
    }
}

fn link_responses(
    db: &mut Tables,
    known: &BTreeSet<PackageId>,
    report: &mut LinkReport,
    problems: &mut BTreeMap<PackageId, Vec<Draft>>,
) {
    let pending: Vec<_> = db
        .commands
        .values()
        .filter(|c| known.contains(&c.package) && c.response.is_none())
        .filter_map(|c| {
            Some((c.id, c.package, c.cluster?, c.source, c.name.clone(), c.response_name.clone()?))
        })
        .collect();

    for (id, package, cluster, source, name, response_name) in pending {
        // Prefer a response travelling the opposite way of the request
        let mut candidates: Vec<_> = db
            .cluster_commands(cluster)
            .filter(|c| c.name.eq_ignore_ascii_case(&response_name))
            .map(|c| (c.source == source, c.id))
            .collect();
        candidates.sort();

        match candidates.first() {
            Some((_, response)) => {
                let response = *response;
                if let Some(c) = db.commands.get_mut(&id) {
                    c.response = Some(response);
                }
                report.resolved += 1;
            }
            None => {
                let cluster_name = db
                    .clusters
                    .get(&cluster)
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                warn!(command = %name, response = %response_name, "unknown response command");
                report.unresolved += 1;
                push(
                    problems,
                    package,
                    format!(
                        "Command {} of cluster {} references unknown response command: {}",
                        name, cluster_name, response_name
                    ),
                );
            }
        }
    }
}

fn link_device_types(
    db: &mut Tables,
    known: &BTreeSet<PackageId>,
    options: &LinkOptions,
    report: &mut LinkReport,
    problems: &mut BTreeMap<PackageId, Vec<Draft>>,
) {
    let rows: Vec<DeviceTypeClusterId> = db
        .device_type_clusters
        .values()
        .filter(|r| {
            db.device_types
                .get(&r.device_type)
                .is_some_and(|d| known.contains(&d.package))
        })
        .map(|r| r.id)
        .collect();

    for row_id in rows {
        let Some(mut row) = db.device_type_clusters.get(&row_id).cloned() else {
            continue;
        };
        let Some((package, device_name)) = db
            .device_types
            .get(&row.device_type)
            .map(|d| (d.package, d.name.clone()))
        else {
            continue;
        };

        if row.cluster.is_none() {
            row.cluster = find_cluster(db, known, &row.cluster_name);
            if row.cluster.is_some() {
                report.resolved += 1;
            }
        }
        let Some(cluster) = row.cluster else {
            if options.prune_unresolved_clusters {
                debug!(device_type = %device_name, cluster = %row.cluster_name, "pruning unresolved cluster");
                db.device_type_clusters.remove(&row_id);
                report.pruned += 1;
            } else {
                warn!(device_type = %device_name, cluster = %row.cluster_name, "unknown cluster");
                report.unresolved += 1;
                push(
                    problems,
                    package,
                    format!(
                        "Device type {} references unknown cluster: {}",
                        device_name, row.cluster_name
                    ),
                );
            }
            continue;
        };

        let sides: Vec<Side> = row.sides().collect();
        let mut missing = Vec::new();

        for attribute in row.attributes.iter_mut().filter(|a| a.attribute.is_none()) {
            let mut candidates: Vec<_> = db
                .cluster_attributes(cluster)
                .filter(|a| a.name.eq_ignore_ascii_case(&attribute.name))
                .map(|a| (!sides.contains(&a.side), a.id))
                .collect();
            candidates.sort();
            attribute.attribute = candidates.first().map(|(_, id)| *id);
            match attribute.attribute {
                Some(_) => report.resolved += 1,
                None => missing.push(("attribute", attribute.name.clone())),
            }
        }
        for command in row.commands.iter_mut().filter(|c| c.command.is_none()) {
            command.command = db
                .cluster_commands(cluster)
                .find(|c| c.name.eq_ignore_ascii_case(&command.name))
                .map(|c| c.id);
            match command.command {
                Some(_) => report.resolved += 1,
                None => missing.push(("command", command.name.clone())),
            }
        }
        for feature in row.features.iter_mut().filter(|f| f.feature.is_none()) {
            feature.feature = db
                .cluster_features(cluster)
                .into_iter()
                .find(|f| f.code.eq_ignore_ascii_case(&feature.code))
                .map(|f| f.id);
            match feature.feature {
                Some(_) => report.resolved += 1,
                None => missing.push(("feature", feature.code.clone())),
            }
        }

        for (kind, name) in missing {
            warn!(device_type = %device_name, cluster = %row.cluster_name, kind, %name, "unknown element");
            report.unresolved += 1;
            push(
                problems,
                package,
                format!(
                    "Device type {}, cluster {} references unknown {}: {}",
                    device_name, row.cluster_name, kind, name
                ),
            );
        }

        db.device_type_clusters.insert(row_id, row);
    }
}

fn push(problems: &mut BTreeMap<PackageId, Vec<Draft>>, package: PackageId, message: String) {
    problems
        .entry(package)
        .or_default()
        .push(Draft::warning(message));
}
