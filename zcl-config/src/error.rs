use std::path::PathBuf;

use thiserror::Error;

use crate::ids::{
    AttributeId, ClusterId, CommandId, DeviceTypeId, EndpointId, EndpointTypeId, EventId,
    PackageId, SessionId,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("package not found: {0}")]
    PackageNotFound(PackageId),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("cluster not found: {0}")]
    ClusterNotFound(ClusterId),

    #[error("attribute not found: {0}")]
    AttributeNotFound(AttributeId),

    #[error("command not found: {0}")]
    CommandNotFound(CommandId),

    #[error("event not found: {0}")]
    EventNotFound(EventId),

    #[error("feature '{code}' not found in cluster {cluster}")]
    FeatureCodeNotFound { cluster: ClusterId, code: String },

    #[error("device type not found: {0}")]
    DeviceTypeNotFound(DeviceTypeId),

    #[error("endpoint type not found: {0}")]
    EndpointTypeNotFound(EndpointTypeId),

    #[error("endpoint not found: {0}")]
    EndpointNotFound(EndpointId),

    #[error("cluster {0} has no FeatureMap attribute on the requested side")]
    NoFeatureMap(ClusterId),

    #[error("device type '{device_type}' cannot be resolved: cluster '{cluster}' is not linked")]
    UnresolvedDeviceType { device_type: String, cluster: String },

    #[error("cannot access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid session file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("no open transaction")]
    NoTransaction,
}
