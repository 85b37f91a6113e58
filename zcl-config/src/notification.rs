//! Derived notifications and their reconciliation.
//!
//! Notifications are never edited by hand. Every rule computes the full set
//! of messages for one [`Origin`] and [`reconcile`] replaces whatever that
//! origin produced before.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::error::Result;
use crate::ids::{EndpointId, NotificationId, PackageId, SessionId};
use crate::model::{Notification, NotificationScope, NotificationType, Origin};
use crate::store::Tables;

/// A notification a rule wants to exist.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Draft {
    pub kind: NotificationType,
    pub message: String,
}

impl Draft {
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            kind: NotificationType::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: NotificationType::Error,
            message: message.into(),
        }
    }

    fn severity(&self) -> u8 {
        match self.kind {
            NotificationType::Error => 1,
            _ => 2,
        }
    }
}

/// Counts of rows touched by a reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub added: usize,
    pub removed: usize,
}

impl std::ops::AddAssign for Reconciled {
    fn add_assign(&mut self, other: Self) {
        self.added += other.added;
        self.removed += other.removed;
    }
}

/// Makes the notifications of `origin` in `scope` equal to `drafts`.
///
/// Rows that survive keep their id and seen flag.
pub fn reconcile(
    db: &mut Tables,
    scope: NotificationScope,
    origin: Origin,
    drafts: impl IntoIterator<Item = Draft>,
) -> Reconciled {
    let wanted: BTreeSet<Draft> = drafts.into_iter().collect();

    let existing: Vec<(NotificationId, Draft)> = db
        .notifications
        .values()
        .filter(|n| n.scope == scope && n.origin == origin)
        .map(|n| {
            (
                n.id,
                Draft {
                    kind: n.kind,
                    message: n.message.clone(),
                },
            )
        })
        .collect();

    let mut result = Reconciled::default();
    let mut present = BTreeSet::new();
    for (id, draft) in existing {
        if wanted.contains(&draft) && present.insert(draft.clone()) {
            continue;
        }
        debug!(%id, message = %draft.message, "removing stale notification");
        db.notifications.remove(&id);
        result.removed += 1;
    }

    for draft in wanted.difference(&present) {
        let id = db.next_id();
        info!(kind = %draft.kind, message = %draft.message, "notification");
        db.notifications.insert(
            id,
            Notification {
                id,
                scope,
                origin,
                kind: draft.kind,
                message: draft.message.clone(),
                severity: draft.severity(),
                seen: false,
            },
        );
        result.added += 1;
    }

    result
}

/// Removes every notification derived for the given endpoint.
pub fn clear_endpoint(db: &mut Tables, endpoint: EndpointId) -> usize {
    let before = db.notifications.len();
    db.notifications
        .retain(|_, n| n.origin.endpoint != Some(endpoint));
    before - db.notifications.len()
}

/// Removes every notification scoped to, or derived from, a package.
pub fn clear_package(db: &mut Tables, package: PackageId) -> usize {
    let before = db.notifications.len();
    db.notifications.retain(|_, n| {
        n.scope != NotificationScope::Package(package) && n.origin.package != Some(package)
    });
    before - db.notifications.len()
}

pub fn clear_session(db: &mut Tables, session: SessionId) {
    db.notifications
        .retain(|_, n| n.scope != NotificationScope::Session(session));
}

/// Session notifications, newest first.
pub fn session_notifications(db: &Tables, session: SessionId) -> Vec<&Notification> {
    scoped(db, NotificationScope::Session(session))
}

/// Package notifications, newest first.
pub fn package_notifications(db: &Tables, package: PackageId) -> Vec<&Notification> {
    scoped(db, NotificationScope::Package(package))
}

fn scoped(db: &Tables, scope: NotificationScope) -> Vec<&Notification> {
    db.notifications
        .values()
        .rev()
        .filter(|n| n.scope == scope)
        .collect()
}

pub fn unseen_count(db: &Tables, session: SessionId) -> Result<usize> {
    db.session(session)?;
    Ok(db
        .notifications
        .values()
        .filter(|n| n.scope == NotificationScope::Session(session) && !n.seen)
        .count())
}

pub fn mark_seen(db: &mut Tables, ids: &[NotificationId]) {
    for id in ids {
        if let Some(n) = db.notifications.get_mut(id) {
            n.seen = true;
        }
    }
}
