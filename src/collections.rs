//! `smap collections` and `smap drop`.

use anyhow::{bail, Result};

use spec_mapper_core::store::VectorIndex;

use crate::config::Config;
use crate::sqlite_store;

pub async fn run_list(config: &Config) -> Result<()> {
    let index = sqlite_store::open(config).await?;
    let collections = index.list_collections().await?;

    if collections.is_empty() {
        println!("No collections.");
    }
    for info in &collections {
        println!("{}", info.name);
        println!("    source: {}", info.source);
        println!(
            "    ingested: {}",
            info.ingested_at.format("%Y-%m-%dT%H:%M:%SZ")
        );
        println!("    chunks: {}", info.chunk_count);
        println!("    model: {} ({} dims)", info.model, info.dims);
    }

    index.pool().close().await;
    Ok(())
}

pub async fn run_drop(config: &Config, name: &str) -> Result<()> {
    let index = sqlite_store::open(config).await?;
    let removed = index.delete_collection(name).await?;
    index.pool().close().await;

    if !removed {
        bail!("collection not found: {}", name);
    }
    println!("dropped {}", name);
    Ok(())
}
