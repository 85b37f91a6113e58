use std::collections::BTreeMap;
use std::fs;

use clap::Parser;
use miette::IntoDiagnostic;
use zcl_data_model::conformance::evaluate;
use zcl_data_model::{Conformant, Definition};

use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::prelude::*;

// Parses a capability definition file and prints what it declares
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Definition file to open
    name: String,

    /// Feature codes to consider enabled when evaluating conformance
    #[arg(short, long, value_delimiter = ',')]
    features: Vec<String>,

    #[arg(short, long)]
    log_level: Option<LevelFilter>,
}

fn main() -> miette::Result<()> {
    let stdout_log = tracing_subscriber::fmt::layer().pretty();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(stdout_log.with_filter(args.log_level.unwrap_or(LevelFilter::ERROR)))
        .init();

    let contents = fs::read_to_string(&args.name).into_diagnostic()?;
    let definition = Definition::parse_named(&args.name, (&*contents).into())?;

    let enabled: BTreeMap<&str, bool> = args.features.iter().map(|f| (f.as_str(), true)).collect();

    for cluster in &definition.clusters {
        info!("cluster {} = {:#06x}", cluster.id, cluster.code);
        println!("{} ({:#06x})", cluster.id, cluster.code);
        for attribute in &cluster.attributes {
            println!(
                "  attribute {:<32} {}",
                attribute.name(),
                evaluate(attribute.conformance(), &enabled)
            );
        }
        for command in &cluster.commands {
            println!(
                "  command   {:<32} {}",
                command.name(),
                evaluate(command.conformance(), &enabled)
            );
        }
    }

    for device_type in &definition.device_types {
        println!(
            "device type {} ({:#06x}), {} cluster(s)",
            device_type.name,
            device_type.code,
            device_type.clusters.len()
        );
    }
    Ok(())
}
