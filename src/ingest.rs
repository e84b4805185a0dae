//! `smap ingest`: parse a specification, chunk it, embed the chunks and
//! publish them as a named collection.
//!
//! With `--replace` the new content is prepared in full before the old
//! collection is swapped out, so a failed replacement leaves the
//! published collection in place.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;

use spec_mapper_core::ingest::{ingest_value, IngestMode};
use spec_mapper_core::store::VectorIndex;

use crate::config::Config;
use crate::embedding;
use crate::sqlite_store;

/// Read a JSON specification and its SHA-256 hex digest.
pub fn read_spec(path: &Path) -> Result<(Value, String)> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read spec file: {}", path.display()))?;
    let digest = format!("{:x}", Sha256::digest(&bytes));
    let root: Value = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse spec file as JSON: {}", path.display()))?;
    Ok((root, digest))
}

pub async fn run_ingest(
    config: &Config,
    spec_path: &Path,
    collection: &str,
    replace: bool,
) -> Result<()> {
    if collection.trim().is_empty() {
        bail!("--collection must not be empty");
    }
    if !config.embedding.is_enabled() {
        bail!("Ingestion requires embeddings. Set [embedding] provider in config.");
    }

    let (root, digest) = read_spec(spec_path)?;
    let embedder = embedding::create_embedder(&config.embedding)?;
    let index = sqlite_store::open(config).await?;

    let existed = index.collection(collection).await?.is_some();
    let mode = if replace {
        IngestMode::Replace
    } else {
        IngestMode::Publish
    };

    let source = spec_path.display().to_string();
    let report = ingest_value(
        &root,
        collection,
        &source,
        embedder.as_ref(),
        index.as_ref(),
        &config.retry.policy(),
        mode,
    )
    .await
    .with_context(|| format!("Failed to ingest {}", spec_path.display()))?;

    if replace && existed {
        println!("replaced existing collection {}", collection);
    }
    println!("ingest {}", collection);
    println!("  source: {}", source);
    println!("  sha256: {}", digest);
    println!("  model: {} ({} dims)", embedder.model_name(), embedder.dims());
    println!("  endpoints: {}", report.endpoints_extracted);
    println!("  schemas: {}", report.schemas_extracted);
    println!("  chunks: {}", report.chunks_total);
    println!("  chunks created: {}", report.chunks_created);
    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }
    println!("ok");

    index.pool().close().await;
    Ok(())
}
