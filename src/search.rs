//! `smap query`: run the retrieval engine against one collection.

use anyhow::{bail, Result};

use spec_mapper_core::models::{ChunkKind, RetrievalResult};
use spec_mapper_core::search::{QueryIntent, QueryRequest, Retriever};
use spec_mapper_core::store::{SearchFilter, VectorIndex};

use crate::config::Config;
use crate::embedding;
use crate::sqlite_store;

/// Command-line options for one query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub k: Option<usize>,
    pub threshold: Option<f64>,
    pub kinds: Vec<String>,
    pub path_contains: Option<String>,
    /// Explicit methods; inferred from the text when empty.
    pub methods: Vec<String>,
    /// Treat the text as a field name with this declared type.
    pub field_type: Option<String>,
    pub explain: bool,
}

pub async fn run_query(
    config: &Config,
    text: &str,
    collection: &str,
    opts: &QueryOptions,
) -> Result<()> {
    if text.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    if !config.embedding.is_enabled() {
        bail!("Queries require embeddings. Set [embedding] provider in config.");
    }

    let kinds = opts
        .kinds
        .iter()
        .map(|k| k.parse::<ChunkKind>())
        .collect::<std::result::Result<Vec<_>, String>>()
        .map_err(anyhow::Error::msg)?;

    let embedder = embedding::create_embedder(&config.embedding)?;
    let index = sqlite_store::open(config).await?;
    let info = match index.collection(collection).await? {
        Some(info) => info,
        None => bail!("collection not found: {}", collection),
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

    let mut request = QueryRequest::new(
        text,
        collection,
        opts.k.unwrap_or(config.retrieval.k),
        opts.threshold.unwrap_or(config.retrieval.score_threshold),
    );
    request.filter = SearchFilter {
        kinds,
        path_contains: opts.path_contains.clone(),
    };
    request.methods = opts.methods.iter().map(|m| m.to_uppercase()).collect();
    request.intent = match &opts.field_type {
        Some(declared_type) => QueryIntent::Field {
            declared_type: declared_type.clone(),
            synonyms: Vec::new(),
        },
        None if !request.methods.is_empty() => QueryIntent::Operation,
        None => QueryIntent::Plain,
    };

    let results = retriever.query(&request).await?;
    index.pool().close().await;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, result) in results.iter().enumerate() {
        print_result(i + 1, result, opts.explain);
    }
    Ok(())
}

fn print_result(rank: usize, result: &RetrievalResult, explain: bool) {
    let chunk = &result.payload;
    println!(
        "{}. [{:.2}] {} {}",
        rank, result.combined_score, chunk.kind, chunk.structural_path
    );
    if explain {
        println!(
            "    raw: {:.4}  bonus: {:.2}  matched: \"{}\"",
            result.raw_score, result.structural_bonus, result.matched_query
        );
    }
    if !chunk.targets.is_empty() {
        let targets: Vec<&str> = chunk.targets.iter().map(|t| t.path.as_str()).take(8).collect();
        let more = chunk.targets.len().saturating_sub(targets.len());
        if more > 0 {
            println!("    targets: {} (+{} more)", targets.join(", "), more);
        } else {
            println!("    targets: {}", targets.join(", "));
        }
    }
    let snippet: String = chunk.text.lines().take(3).collect::<Vec<_>>().join(" | ");
    println!("    {}", snippet);
    println!("    id: {}", result.chunk_id);
    println!();
}
