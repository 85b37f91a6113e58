//! Typed row identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

define_id!(
    /// A loaded file (capability library, template manifest or one of its children)
    PackageId
);
define_id!(ClusterId);
define_id!(AttributeId);
define_id!(CommandId);
define_id!(EventId);
define_id!(FeatureId);
define_id!(DataTypeId);
define_id!(DeviceTypeId);
define_id!(
    /// A cluster requirement of a device type
    DeviceTypeClusterId
);
define_id!(SessionId);
define_id!(
    /// A named configuration (instantiation of device types) inside a session
    EndpointTypeId
);
define_id!(
    /// A numbered instance of an endpoint type
    EndpointId
);
define_id!(NotificationId);
