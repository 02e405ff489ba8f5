//! # docqa
//!
//! Multi-tenant document question answering.
//!
//! Users upload documents (PDF, Word, PowerPoint, Excel, plain text); each
//! upload is extracted, split into adaptively sized chunks, embedded and
//! indexed in memory under the owner's `(user_id, document_id)` key. Questions
//! are answered by retrieving the most relevant chunks (optionally
//! diversified with MMR) and asking a language model to answer strictly from
//! them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────────────────────────┐   ┌──────────────┐
//! │  upload  │──▶│ ingest (background)              │──▶│ IndexRegistry│
//! │          │   │ load → chunk → embed → index     │   │ (user, doc)  │
//! └──────────┘   └─────────────────────────────────┘   └──────┬───────┘
//!                                                              │
//!                ┌──────────────┐    ┌──────────────┐          │
//!                │ LanguageModel│◀───│   Answerer    │◀─────────┘
//!                └──────────────┘    └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docqa chunk ./handbook.pdf                       # dry-run the chunker
//! docqa ask ./handbook.pdf "How many vacation days?"
//! docqa token alice                                 # mint a dev bearer token
//! docqa serve                                       # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`loader`] | Text extraction by file type |
//! | [`chunk`] | Adaptive, boundary-aware chunking |
//! | [`embedding`] | Embedding backends and batch fallback |
//! | [`index`] | Per-document vector index (similarity + MMR) |
//! | [`llm`] | Language-model backends |
//! | [`metadata`] | Metadata store trait and in-memory backend |
//! | [`sqlite_store`] | SQLite metadata backend |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`identity`] | Bearer-token identity provider |
//! | [`storage`] | Transient upload storage |
//! | [`manager`] | Upload/ingest/status/delete lifecycle |
//! | [`answer`] | Retrieval and answer orchestration |
//! | [`server`] | HTTP API |

pub mod answer;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod identity;
pub mod index;
pub mod llm;
pub mod loader;
pub mod manager;
pub mod metadata;
pub mod migrate;
pub mod models;
pub mod server;
pub mod sqlite_store;
pub mod storage;
