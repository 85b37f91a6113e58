//! Generation of text artifacts from a template manifest.
//!
//! Generation runs in three phases, each completing before the next starts:
//! helper files are registered, partials are parsed, and then every template
//! is rendered. Templates are independent of each other and render in
//! parallel; the result map is assembled once all of them finished.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use convert_case::{Case, Casing};
use rayon::prelude::*;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use zcl_config::model::{Package, PackageType};
use zcl_config::package::{child_packages, package_options, packages_of_type};
use zcl_config::{PackageId, SessionId, Tables};

use crate::context::session_context;
use crate::error::{GenerationError, Result};
use crate::helpers::{HelperEnv, HelperRegistry};
use crate::manifest::{template_iterator, CLUSTER_ITERATOR, GENERATOR_OPTIONS};
use crate::template::{Output, Renderer, Template};

/// Lines per block of a preview content index.
pub const DEFAULT_LINES_PER_BLOCK: usize = 2000;

#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Output names to render. `None` renders every template.
    pub generate_only: Option<Vec<String>>,
    pub disable_deprecation_warnings: bool,
}

impl GenerateOptions {
    pub fn only(outputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            generate_only: Some(outputs.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    fn selects(&self, output: &str) -> bool {
        self.generate_only
            .as_ref()
            .map_or(true, |only| only.iter().any(|o| o == output))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    /// Rendered text per output name
    pub content: BTreeMap<String, String>,
    /// Set when only a subset of the templates was requested
    pub partial: bool,
    pub has_errors: bool,
    /// Failure message per output name
    pub errors: BTreeMap<String, String>,
    pub generator_options: BTreeMap<String, String>,
}

impl GenerationResult {
    fn merge(&mut self, other: GenerationResult) {
        self.content.extend(other.content);
        self.errors.extend(other.errors);
        self.has_errors |= other.has_errors;
        self.partial |= other.partial;
        self.generator_options.extend(other.generator_options);
    }
}

struct TemplateJob<'a> {
    output: &'a str,
    path: &'a Path,
    iterator: Option<&'a str>,
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| GenerationError::io(path, e))
}

fn children_of_type(db: &Tables, manifest: PackageId, package_type: PackageType) -> Vec<&Package> {
    child_packages(db, manifest)
        .into_iter()
        .filter(|p| p.package_type == package_type)
        .collect()
}

fn load_helpers(db: &Tables, manifest: PackageId) -> Result<HelperRegistry> {
    let mut registry = HelperRegistry::with_builtins();
    for helper in children_of_type(db, manifest, PackageType::Helper) {
        let source = read(&helper.path)?;
        let name = helper.path.display().to_string();
        let count = registry.load_helper_file(&name, &source)?;
        debug!(helper = %name, count, "helper file registered");
    }
    Ok(registry)
}

fn load_env(db: &Tables, manifest: PackageId) -> Result<HelperEnv> {
    let mut env = HelperEnv::default();
    for file in children_of_type(db, manifest, PackageType::Override) {
        let content = read(&file.path)?;
        let loaded =
            HelperEnv::from_override_file(&content).map_err(|e| GenerationError::json(&file.path, e))?;
        env.type_overrides.extend(loaded.type_overrides);
    }
    Ok(env)
}

fn load_partials(db: &Tables, manifest: PackageId) -> Result<BTreeMap<String, Template>> {
    let mut partials = BTreeMap::new();
    for partial in children_of_type(db, manifest, PackageType::Partial) {
        let name = partial
            .category
            .clone()
            .unwrap_or_else(|| partial.path.display().to_string());
        let source = read(&partial.path)?;
        let template = Template::parse(name.clone(), &source)?;
        partials.insert(name, template);
    }
    Ok(partials)
}

/// Output name of one iteration over `cluster`.
fn iteration_output(output: &str, cluster: &Value) -> String {
    let name = cluster
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_case(Case::Pascal);
    let code = cluster
        .get("code")
        .and_then(Value::as_u64)
        .unwrap_or_default();
    output
        .replace("{name}", &name)
        .replace("{code}", &code.to_string())
}

/// Renders one template into one or more named outputs.
fn render_job(
    renderer: &Renderer<'_>,
    job: &TemplateJob<'_>,
    context: &Value,
) -> std::result::Result<Vec<(String, Output)>, String> {
    let source = fs::read_to_string(job.path)
        .map_err(|e| format!("cannot read {}: {}", job.path.display(), e))?;
    let template = Template::parse(job.path.display().to_string(), &source).map_err(|e| e.to_string())?;

    match job.iterator {
        Some(CLUSTER_ITERATOR) => {
            let clusters = context
                .get("clusters")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            clusters
                .iter()
                .map(|cluster| {
                    renderer
                        .render_in(&template, context, Some(cluster))
                        .map(|out| (iteration_output(job.output, cluster), out))
                        .map_err(|e| e.to_string())
                })
                .collect()
        }
        Some(other) => Err(format!("unknown iterator '{}'", other)),
        None => renderer
            .render(&template, context)
            .map(|out| vec![(job.output.to_string(), out)])
            .map_err(|e| e.to_string()),
    }
}

/// Renders the templates of `manifest` against the configuration of
/// `session`.
///
/// A template that fails to render is reported in the result and does not
/// stop the others; problems with helper files, partials or the override
/// file abort the whole run.
pub fn generate(
    db: &Tables,
    manifest: PackageId,
    session: SessionId,
    options: &GenerateOptions,
) -> Result<GenerationResult> {
    if db.package(manifest)?.package_type != PackageType::TemplateManifest {
        return Err(GenerationError::NotAManifest(manifest));
    }

    let helpers = load_helpers(db, manifest)?;
    let env = load_env(db, manifest)?;
    let partials = load_partials(db, manifest)?;
    let context = session_context(db, session, Some(manifest))?;

    let templates = children_of_type(db, manifest, PackageType::Template);
    let jobs: Vec<TemplateJob<'_>> = templates
        .iter()
        .filter_map(|t| {
            let output = t.category.as_deref()?;
            options.selects(output).then(|| TemplateJob {
                output,
                path: &t.path,
                iterator: template_iterator(db, t.id),
            })
        })
        .collect();

    let renderer = Renderer::new(&helpers, &partials, &env);
    let rendered: Vec<_> = jobs
        .par_iter()
        .map(|job| (job.output, render_job(&renderer, job, &context)))
        .collect();

    let mut result = GenerationResult {
        partial: options.generate_only.is_some(),
        generator_options: package_options(db, manifest, GENERATOR_OPTIONS)
            .into_iter()
            .map(|o| (o.code.clone(), o.label.clone()))
            .collect(),
        ..Default::default()
    };
    let mut deprecated = BTreeSet::new();
    for (output, outcome) in rendered {
        match outcome {
            Ok(outputs) => {
                for (name, out) in outputs {
                    deprecated.extend(out.deprecated);
                    result.content.insert(name, out.text);
                }
            }
            Err(message) => {
                warn!(output, "template failed: {}", message);
                result.has_errors = true;
                result.errors.insert(output.to_string(), message);
            }
        }
    }

    if !options.disable_deprecation_warnings {
        for helper in &deprecated {
            warn!(helper = %helper, "deprecated helper used");
        }
    }

    info!(
        manifest = %manifest,
        session = %session,
        outputs = result.content.len(),
        errors = result.errors.len(),
        "generation finished"
    );
    Ok(result)
}

/// Splits rendered content into blocks of `lines_per_block` lines, keyed
/// from 1.
pub fn content_index(content: &str, lines_per_block: usize) -> BTreeMap<usize, String> {
    let lines_per_block = lines_per_block.max(1);
    let mut index = BTreeMap::new();
    let lines: Vec<&str> = content.lines().collect();
    for (i, block) in lines.chunks(lines_per_block).enumerate() {
        let mut text = String::new();
        for line in block {
            text.push_str(line);
            text.push('\n');
        }
        index.insert(i + 1, text);
    }
    index
}

/// Generates one output across every template manifest attached to the
/// session and returns its content index.
///
/// Returns `None` when no template of those manifests produces `output`.
pub fn generate_single_file_for_preview(
    db: &Tables,
    session: SessionId,
    output: &str,
) -> Result<Option<BTreeMap<usize, String>>> {
    let attached: BTreeSet<PackageId> = db.session(session)?.packages.iter().copied().collect();
    let manifests: Vec<PackageId> = packages_of_type(db, PackageType::TemplateManifest)
        .into_iter()
        .filter(|p| attached.contains(&p.id))
        .map(|p| p.id)
        .collect();

    let options = GenerateOptions::only([output]);
    let mut merged = GenerationResult::default();
    for manifest in manifests {
        merged.merge(generate(db, manifest, session, &options)?);
    }
    if let Some(message) = merged.errors.get(output) {
        return Err(GenerationError::Output {
            output: output.to_string(),
            message: message.clone(),
        });
    }
    Ok(merged
        .content
        .get(output)
        .map(|content| content_index(content, DEFAULT_LINES_PER_BLOCK)))
}
