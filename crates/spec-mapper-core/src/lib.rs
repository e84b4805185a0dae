//! # Spec Mapper Core
//!
//! Storage-agnostic logic for spec-mapper: OpenAPI parsing and chunking,
//! the embedding and vector index traits, hybrid retrieval, candidate
//! validation, and the iterative field-mapping agent with its fallback
//! and aggregation layer.
//!
//! Nothing here touches SQLite, HTTP or the filesystem. The `spec-mapper`
//! app crate supplies those implementations behind [`store::VectorIndex`],
//! [`embedding::Embedder`] and [`validator::Validator`].
//!
//! ```text
//! spec JSON ─▶ openapi ─▶ chunk ─▶ embedding ─▶ store        (ingest)
//! field ─▶ agent ⇄ search + strategy + validator ─▶ aggregate (map)
//! ```

pub mod agent;
pub mod aggregate;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod models;
pub mod openapi;
pub mod retry;
pub mod search;
pub mod store;
pub mod strategy;
pub mod validator;
