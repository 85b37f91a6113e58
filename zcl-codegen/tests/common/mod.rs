#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Once;

use zcl_codegen::{generate, read_manifest, record_manifest, GenerateOptions, GenerationResult};
use zcl_config::model::Notification;
use zcl_config::notification::package_notifications;
use zcl_config::session::{self, attach_package, create_session, devices_for};
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

pub fn template(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("resource")
        .join("templates")
        .join(name)
}

/// The capability library shared with the configuration tests.
pub fn general_zcl() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("zcl-config")
        .join("tests")
        .join("resource")
        .join("general.zcl")
}

/// A session over `general.zcl` with one on/off light endpoint.
pub struct Fixture {
    pub store: Store,
    pub session: SessionId,
}

impl Fixture {
    pub fn new() -> Self {
        let fixture = Self::empty();
        fixture.endpoint(1, "OnOffLight");
        fixture
    }

    /// A session with the library loaded and no endpoints.
    pub fn empty() -> Self {
        init_logging();
        let store = Store::new();
        let session = store
            .transaction(|db| Ok(create_session(db, "test")))
            .unwrap();
        let results = load_definition_files(
            &store,
            &[general_zcl()],
            &LoadOptions {
                session: Some(session),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(results.iter().all(|r| r.succeeded), "{:?}", results);
        Self { store, session }
    }

    pub fn endpoint(&self, identifier: u32, device_type: &str) -> EndpointTypeId {
        let session = self.session;
        self.store
            .transaction(|db| {
                let id = db
                    .device_types
                    .values()
                    .find(|d| d.name == device_type)
                    .map(|d| d.id)
                    .unwrap_or_else(|| panic!("no device type {}", device_type));
                let devices = devices_for(db, &[id])?;
                let et = session::insert_endpoint_type(db, session, device_type, devices)?;
                session::insert_endpoint(db, session, identifier, et, 0, 0x0104)?;
                Ok(et)
            })
            .unwrap()
    }

    /// Loads a manifest from the template resources and attaches it to the
    /// session.
    pub fn manifest(&self, name: &str) -> PackageId {
        let plan = read_manifest(&template(name)).unwrap();
        let session = self.session;
        self.store
            .transaction(|db| {
                let manifest = record_manifest(db, &plan)?;
                attach_package(db, session, manifest)?;
                Ok(manifest)
            })
            .unwrap()
    }

    pub fn generate(&self, manifest: PackageId, options: &GenerateOptions) -> GenerationResult {
        self.store
            .read(|db| Ok(generate(db, manifest, self.session, options)))
            .unwrap()
            .unwrap()
    }

    pub fn read<T>(&self, f: impl FnOnce(&Db) -> T) -> T {
        self.store.read(|db| Ok(f(db))).unwrap()
    }

    pub fn package_messages(&self, package: PackageId) -> Vec<String> {
        self.read(|db| {
            package_notifications(db, package)
                .into_iter()
                .map(|n: &Notification| n.message.clone())
                .collect()
        })
    }
}
