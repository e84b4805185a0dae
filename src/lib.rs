//! # Spec Mapper
//!
//! Retrieval-augmented mapping of source fields onto the fields of an
//! OpenAPI 3.x or Swagger 2.0 specification.
//!
//! The mapping engine itself lives in `spec-mapper-core`; this crate wires
//! it to a SQLite-backed vector index, HTTP embedding providers, a
//! live-endpoint validator and the `smap` command line.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌────────────┐
//! │ Spec JSON  │──▶│ Chunk+Embed  │──▶│   SQLite   │
//! │ OAS3/Sw2   │   │  (ingest)    │   │ collections│
//! └────────────┘   └──────────────┘   └─────┬──────┘
//!                                           │
//!                  ┌────────────────────────┤
//!                  ▼                        ▼
//!            ┌───────────┐           ┌─────────────┐
//!            │   query   │           │ map (agent) │
//!            └───────────┘           └─────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | Persistent vector index |
//! | [`embedding`] | Embedding provider selection |
//! | [`validator_http`] | Live-endpoint validator |
//! | [`fields`] | Source field loading |
//! | [`ingest`] | `smap ingest` |
//! | [`collections`] | `smap collections`, `smap drop` |
//! | [`search`] | `smap query` |
//! | [`map_cmd`] | `smap map` |

pub mod collections;
pub mod config;
pub mod db;
pub mod embedding;
pub mod fields;
pub mod ingest;
pub mod map_cmd;
pub mod migrate;
pub mod search;
pub mod sqlite_store;
pub mod validator_http;
