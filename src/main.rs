//! # Spec Mapper CLI (`smap`)
//!
//! The `smap` binary ingests OpenAPI/Swagger specifications into named
//! collections, answers retrieval queries against them and maps source
//! fields onto their target fields.
//!
//! ## Usage
//!
//! ```bash
//! smap --config ./config/smap.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `smap init` | Create the SQLite database and run schema migrations |
//! | `smap ingest <spec> --collection <name>` | Chunk, embed and store a specification |
//! | `smap collections` | List ingested collections |
//! | `smap drop <name>` | Delete a collection |
//! | `smap query "<text>" --collection <name>` | Retrieve spec chunks |
//! | `smap map --collection <name> --spec <spec> --fields <file>` | Map source fields |
//!
//! ## Examples
//!
//! ```bash
//! smap init
//! smap ingest ./specs/hr.json --collection hr-v1
//! smap query "create absence" --collection hr-v1 --explain
//! smap map --collection hr-v1 --spec ./specs/hr.json \
//!     --payload ./samples/absence.json --out report.json
//! ```

use clap::{ArgGroup, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use spec_mapper::map_cmd::FieldSource;
use spec_mapper::search::QueryOptions;
use spec_mapper::{collections, config, ingest, map_cmd, migrate, search};

/// Spec Mapper: retrieval-augmented field mapping against API specifications.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/smap.toml` for an example.
#[derive(Parser)]
#[command(
    name = "smap",
    about = "Map source fields onto OpenAPI/Swagger specifications",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/smap.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest a JSON OpenAPI 3.x or Swagger 2.0 document into a collection.
    ///
    /// Re-ingesting the same document into the same collection creates
    /// no new chunks. A different document is refused unless `--replace`
    /// is given.
    Ingest {
        /// Path to the specification file.
        spec: PathBuf,

        /// Collection name.
        #[arg(long)]
        collection: String,

        /// Swap out the existing collection once the new one is ready.
        #[arg(long)]
        replace: bool,
    },

    /// List ingested collections.
    Collections,

    /// Delete a collection and all its chunks.
    Drop {
        name: String,
    },

    /// Retrieve the chunks of a collection most relevant to a text.
    Query {
        text: String,

        #[arg(long)]
        collection: String,

        /// Number of results (defaults to `retrieval.k`).
        #[arg(long)]
        k: Option<usize>,

        /// Minimum raw similarity (defaults to `retrieval.score_threshold`).
        #[arg(long)]
        threshold: Option<f64>,

        /// Restrict to chunk kinds (endpoint, schema_summary, schema_properties, parameter).
        #[arg(long = "kind")]
        kinds: Vec<String>,

        /// Restrict to structural paths containing this substring.
        #[arg(long)]
        path: Option<String>,

        /// HTTP methods to prefer; inferred from the text when omitted.
        #[arg(long = "method")]
        methods: Vec<String>,

        /// Treat the text as a source field name of this declared type.
        #[arg(long)]
        field_type: Option<String>,

        /// Show raw scores, bonuses and the matching reformulation.
        #[arg(long)]
        explain: bool,
    },

    /// Map source fields onto a collection's specification.
    #[command(group(ArgGroup::new("source").required(true).args(["fields", "payload"])))]
    Map {
        #[arg(long)]
        collection: String,

        /// The specification the collection was ingested from.
        #[arg(long)]
        spec: PathBuf,

        /// JSON array of field descriptors.
        #[arg(long)]
        fields: Option<PathBuf>,

        /// Sample source payload; one field per leaf value.
        #[arg(long)]
        payload: Option<PathBuf>,

        /// Write the JSON mapping report here.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Wall-clock budget for the whole run, in seconds.
        #[arg(long)]
        budget_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            spec,
            collection,
            replace,
        } => {
            ingest::run_ingest(&cfg, &spec, &collection, replace).await?;
        }
        Commands::Collections => {
            collections::run_list(&cfg).await?;
        }
        Commands::Drop { name } => {
            collections::run_drop(&cfg, &name).await?;
        }
        Commands::Query {
            text,
            collection,
            k,
            threshold,
            kinds,
            path,
            methods,
            field_type,
            explain,
        } => {
            let opts = QueryOptions {
                k,
                threshold,
                kinds,
                path_contains: path,
                methods,
                field_type,
                explain,
            };
            search::run_query(&cfg, &text, &collection, &opts).await?;
        }
        Commands::Map {
            collection,
            spec,
            fields,
            payload,
            out,
            budget_secs,
        } => {
            let source = match (&fields, &payload) {
                (Some(path), _) => FieldSource::Fields(path),
                (None, Some(path)) => FieldSource::Payload(path),
                (None, None) => anyhow::bail!("one of --fields or --payload is required"),
            };
            map_cmd::run_map(
                &cfg,
                &collection,
                &spec,
                source,
                out.as_deref(),
                budget_secs,
            )
            .await?;
        }
    }

    Ok(())
}
