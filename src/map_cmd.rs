//! `smap map`: map source fields onto an ingested specification and
//! write the mapping report.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;

use spec_mapper_core::agent::IterativeMapper;
use spec_mapper_core::aggregate::{MappingReport, MappingRunner};
use spec_mapper_core::models::MappingField;
use spec_mapper_core::openapi::SpecDocument;
use spec_mapper_core::search::Retriever;
use spec_mapper_core::store::VectorIndex;
use spec_mapper_core::validator::{SpecValidator, Validator};

use crate::config::Config;
use crate::embedding;
use crate::fields;
use crate::ingest::read_spec;
use crate::sqlite_store;
use crate::validator_http::HttpValidator;

/// Where the source fields come from.
#[derive(Debug, Clone, Copy)]
pub enum FieldSource<'a> {
    /// JSON array of field descriptors.
    Fields(&'a Path),
    /// Sample payload, flattened into fields.
    Payload(&'a Path),
}

impl FieldSource<'_> {
    fn load(&self) -> Result<Vec<MappingField>> {
        match self {
            FieldSource::Fields(path) => fields::load_fields(path),
            FieldSource::Payload(path) => fields::load_payload(path),
        }
    }
}

pub async fn run_map(
    config: &Config,
    collection: &str,
    spec_path: &Path,
    source: FieldSource<'_>,
    out: Option<&Path>,
    budget_secs: Option<u64>,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Mapping requires embeddings. Set [embedding] provider in config.");
    }

    let field_list = source.load()?;
    if field_list.is_empty() {
        bail!("no source fields to map");
    }

    let (root, _) = read_spec(spec_path)?;
    let doc = Arc::new(
        SpecDocument::parse(&root)
            .with_context(|| format!("Failed to parse spec: {}", spec_path.display()))?,
    );
    let validator = create_validator(config, doc)?;

    let embedder = embedding::create_embedder(&config.embedding)?;
    let index = sqlite_store::open(config).await?;
    let info = match index.collection(collection).await? {
        Some(info) => info,
        None => bail!(
            "collection not found: {} (run `smap ingest` first)",
            collection
        ),
    };
    if info.model != embedder.model_name() {
        bail!(
            "collection '{}' was embedded with {} but the configured provider is {}",
            collection,
            info.model,
            embedder.model_name()
        );
    }

    let retriever = Retriever::new(
        index.clone(),
        embedder,
        config.retry.policy(),
        config.retrieval.params(),
    );
    let mapper = IterativeMapper::new(
        retriever,
        validator,
        config.retry.policy(),
        config.agent_config(),
        collection,
    );
    let runner = MappingRunner::new(Arc::new(mapper), config.aggregate_config(budget_secs));

    let report = runner.run(field_list).await;
    index.pool().close().await;

    print_report(&report);

    if let Some(out) = out {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(out, json)
            .with_context(|| format!("Failed to write report: {}", out.display()))?;
        println!("report written to {}", out.display());
    }
    Ok(())
}

fn create_validator(config: &Config, doc: Arc<SpecDocument>) -> Result<Arc<dyn Validator>> {
    match config.validator.mode.as_str() {
        "spec" => Ok(Arc::new(SpecValidator::new(&doc))),
        "http" => Ok(Arc::new(HttpValidator::new(&config.validator, doc)?)),
        other => bail!("Unknown validator mode: {}", other),
    }
}

fn print_report(report: &MappingReport) {
    let summary = &report.summary;
    println!("map {}", report.collection);
    println!("  run: {}", report.run_id);
    println!("  fields: {}", summary.total);
    println!("  converged: {}", summary.converged);
    println!("  exhausted: {}", summary.exhausted);
    println!("  fallback: {}", summary.fallback);
    println!("  unmapped: {}", summary.unmapped);
    println!("  average confidence: {:.2}", summary.average_confidence);
    println!("  needs review: {}", summary.needs_review);

    for entry in &report.entries {
        let result = &entry.result;
        let target = result
            .final_candidate
            .as_ref()
            .map(|c| c.target_path.as_str())
            .unwrap_or("-");
        println!(
            "  {} -> {} [{} {:.2}]",
            entry.field.name, target, result.method, result.confidence
        );
    }
    println!("ok");
}
