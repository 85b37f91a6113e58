use std::path::PathBuf;

use clap::Parser;
use miette::{miette, IntoDiagnostic};
use zcl_codegen::{generate_and_write_files, read_manifest, record_manifest, GenerateOptions, WriteOptions};
use zcl_config::impexp::import_session_from_file;
use zcl_config::notification::session_notifications;
use zcl_config::session::{attach_package, create_session, devices_for, insert_endpoint, insert_endpoint_type};
use zcl_config::{load_definition_files, LoadOptions, Store};

use tracing::{info, warn};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::prelude::*;

// Generates code for an endpoint configuration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Capability library files to load
    #[arg(short, long, required = true)]
    zcl: Vec<PathBuf>,

    /// Template manifest to generate with
    #[arg(short, long)]
    generator: PathBuf,

    /// Directory receiving the generated files
    #[arg(short, long, default_value = ".")]
    out: PathBuf,

    /// Exported session to generate for
    #[arg(short, long)]
    session: Option<PathBuf>,

    /// Endpoints to create, as `<identifier>=<device type>`
    #[arg(short, long, value_delimiter = ',')]
    endpoint: Vec<String>,

    /// Only generate these outputs
    #[arg(long, value_delimiter = ',')]
    generate_only: Vec<String>,

    /// Keep `<name>~` copies of overwritten files
    #[arg(long)]
    backup: bool,

    /// Write genResult.json next to the generated files
    #[arg(long)]
    gen_result_file: bool,

    #[arg(long)]
    no_deprecation_warnings: bool,

    #[arg(short, long)]
    log_level: Option<LevelFilter>,
}

fn main() -> miette::Result<()> {
    let stdout_log = tracing_subscriber::fmt::layer().pretty();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(stdout_log.with_filter(args.log_level.unwrap_or(LevelFilter::ERROR)))
        .init();

    let store = Store::new();
    let results = load_definition_files(&store, &args.zcl, &LoadOptions::default()).into_diagnostic()?;
    for result in &results {
        if let Some(err) = &result.err {
            return Err(miette!("{}: {}", result.path.display(), err));
        }
    }

    let session = match &args.session {
        Some(path) => store
            .transaction(|db| import_session_from_file(db, path, "zcl-gen"))
            .into_diagnostic()?,
        None => store
            .transaction(|db| {
                let session = create_session(db, "zcl-gen");
                for package in results.iter().filter_map(|r| r.package_id) {
                    attach_package(db, session, package)?;
                }
                Ok(session)
            })
            .into_diagnostic()?,
    };

    for entry in &args.endpoint {
        let (identifier, device_type) = entry
            .split_once('=')
            .ok_or_else(|| miette!("endpoint '{}' is not <identifier>=<device type>", entry))?;
        let identifier: u32 = identifier.trim().parse().into_diagnostic()?;
        let device_type = device_type.trim();
        let id = store
            .read(|db| {
                Ok(db
                    .device_types
                    .values()
                    .find(|d| d.name == device_type)
                    .map(|d| d.id))
            })
            .into_diagnostic()?
            .ok_or_else(|| miette!("unknown device type '{}'", device_type))?;
        store
            .transaction(|db| {
                let devices = devices_for(db, &[id])?;
                let et = insert_endpoint_type(db, session, device_type, devices)?;
                insert_endpoint(db, session, identifier, et, 0, 0x0104)?;
                Ok(())
            })
            .into_diagnostic()?;
        info!(identifier, device_type, "endpoint created");
    }

    let plan = read_manifest(&args.generator).into_diagnostic()?;
    for warning in &plan.warnings {
        warn!("{}", warning);
    }
    let manifest = store
        .transaction(|db| {
            let manifest = record_manifest(db, &plan)?;
            attach_package(db, session, manifest)?;
            Ok(manifest)
        })
        .into_diagnostic()?;

    let options = WriteOptions {
        backup: args.backup,
        gen_result_file: args.gen_result_file,
        creator: "zcl-gen".into(),
        generate: GenerateOptions {
            generate_only: (!args.generate_only.is_empty()).then_some(args.generate_only.clone()),
            disable_deprecation_warnings: args.no_deprecation_warnings,
        },
    };
    let result = store
        .read(|db| Ok(generate_and_write_files(db, manifest, session, &args.out, &options)))
        .into_diagnostic()?
        .into_diagnostic()?;

    for notification in store
        .read(|db| Ok(session_notifications(db, session).into_iter().cloned().collect::<Vec<_>>()))
        .into_diagnostic()?
    {
        println!("{}: {}", notification.kind, notification.message);
    }
    for name in result.content.keys() {
        println!("wrote {}", args.out.join(name).display());
    }
    for (name, message) in &result.errors {
        println!("failed {}: {}", name, message);
    }
    if result.has_errors {
        return Err(miette!("{} output(s) failed", result.errors.len()));
    }
    Ok(())
}
