#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Once;

use zcl_config::model::{Notification, NotificationType};
use zcl_config::notification::session_notifications;
use zcl_config::session::{self, create_session, devices_for};
use zcl_config::*;

static LOGGING: Once = Once::new();

pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

pub fn resource(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("resource")
        .join(name)
}

/// A store with one session and some resource files loaded into it.
pub struct Fixture {
    pub store: Store,
    pub session: SessionId,
}

impl Fixture {
    pub fn new(files: &[&str]) -> Self {
        init_logging();
        let store = Store::new();
        let session = store
            .transaction(|db| Ok(create_session(db, "test")))
            .unwrap();
        let fixture = Self { store, session };
        for result in fixture.load(files) {
            assert!(result.succeeded, "{:?}", result);
        }
        fixture
    }

    pub fn load(&self, files: &[&str]) -> Vec<LoadResult> {
        let paths: Vec<PathBuf> = files.iter().map(|f| resource(f)).collect();
        load_definition_files(
            &self.store,
            &paths,
            &LoadOptions {
                session: Some(self.session),
                ..Default::default()
            },
        )
        .unwrap()
    }

    pub fn read<T>(&self, f: impl FnOnce(&Db) -> T) -> T {
        self.store.read(|db| Ok(f(db))).unwrap()
    }

    pub fn write<T>(&self, f: impl FnOnce(&mut Db) -> Result<T>) -> T {
        self.store.transaction(f).unwrap()
    }

    pub fn cluster(&self, name: &str) -> ClusterId {
        self.read(|db| {
            db.clusters
                .values()
                .find(|c| c.name == name)
                .map(|c| c.id)
                .unwrap_or_else(|| panic!("no cluster {}", name))
        })
    }

    pub fn command(&self, cluster: &str, name: &str) -> CommandId {
        let cluster = self.cluster(cluster);
        self.read(|db| {
            db.cluster_commands(cluster)
                .find(|c| c.name == name)
                .map(|c| c.id)
                .unwrap_or_else(|| panic!("no command {}", name))
        })
    }

    pub fn attribute(&self, cluster: &str, name: &str) -> AttributeId {
        let cluster = self.cluster(cluster);
        self.read(|db| {
            db.cluster_attributes(cluster)
                .find(|a| a.name == name)
                .map(|a| a.id)
                .unwrap_or_else(|| panic!("no attribute {}", name))
        })
    }

    pub fn device_type(&self, name: &str) -> DeviceTypeId {
        self.read(|db| {
            db.device_types
                .values()
                .find(|d| d.name == name)
                .map(|d| d.id)
                .unwrap_or_else(|| panic!("no device type {}", name))
        })
    }

    /// Creates an endpoint type for the named device types and one endpoint
    /// instantiating it.
    pub fn endpoint(&self, identifier: u32, device_types: &[&str]) -> (EndpointTypeId, EndpointId) {
        let ids: Vec<DeviceTypeId> = device_types.iter().map(|d| self.device_type(d)).collect();
        let session = self.session;
        self.write(|db| {
            let devices = devices_for(db, &ids)?;
            let et = session::insert_endpoint_type(db, session, "endpoint type", devices)?;
            let endpoint = session::insert_endpoint(db, session, identifier, et, 0, 0x0104)?;
            Ok((et, endpoint))
        })
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.read(|db| {
            session_notifications(db, self.session)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    pub fn messages(&self) -> Vec<String> {
        self.notifications().into_iter().map(|n| n.message).collect()
    }

    pub fn messages_containing(&self, needle: &str) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|m| m.contains(needle))
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.notifications()
            .into_iter()
            .filter(|n| n.kind == NotificationType::Error)
            .map(|n| n.message)
            .collect()
    }
}
