//! # ARIEL
//!
//! A hybrid retrieval engine for accelerator facility logbooks.
//!
//! ARIEL ingests entries from facility logbook systems through pluggable
//! adapters, stores them in SQLite, runs optional enhancement modules
//! (text embeddings), and answers queries in five modes: keyword (FTS5),
//! fuzzy (trigram), semantic (vector), RAG, and a tool-calling agent.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────────┐
//! │  Adapters    │──▶│  Ingestion   │──▶│    SQLite     │
//! │ ALS / JSON   │   │ window+retry │   │ FTS5 + vectors│
//! └──────────────┘   └──────┬───────┘   └──────┬────────┘
//!                           ▼                  │
//!                    ┌──────────────┐          │
//!                    │ Enhancement  │──────────┤
//!                    │ (embeddings) │          │
//!                    └──────────────┘          ▼
//!                                      ┌───────────────┐
//!                                      │ SearchService │
//!                                      │ kw/fz/sem/rag │
//!                                      │    /agent     │
//!                                      └──────┬────────┘
//!                                 ┌───────────┴──────────┐
//!                                 ▼                      ▼
//!                           ┌──────────┐           ┌──────────┐
//!                           │   CLI    │           │   HTTP   │
//!                           │ (ariel)  │           │  (axum)  │
//!                           └──────────┘           └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ariel migrate run             # create schema for enabled modules
//! ariel ingest --since 2024-01-01
//! ariel enhance                 # backfill embeddings
//! ariel search "\"beam loss\" author:smith date:2024-01"
//! ariel serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and module capabilities |
//! | [`models`] | Core data types |
//! | [`query`] | Query text parsing |
//! | [`migrate`] / [`migrations`] | Dependency-ordered schema migrations |
//! | [`repository`] | All database access |
//! | [`search`] | Keyword, fuzzy, and semantic strategies |
//! | [`rag`] / [`agent`] | LLM-backed answer modes |
//! | [`service`] | Mode routing and gating |
//! | [`ingest`] | Ingestion orchestration |
//! | [`traits`] | Adapter and tool extension points |
//! | [`server`] | HTTP API |

pub mod adapter_als;
pub mod adapter_generic;
pub mod agent;
pub mod cancel;
pub mod config;
pub mod db;
pub mod embedding;
pub mod enhancement;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod migrations;
pub mod models;
pub mod query;
pub mod rag;
pub mod repository;
pub mod search;
pub mod server;
pub mod service;
pub mod status;
pub mod traits;
pub mod trigram;

#[cfg(test)]
pub(crate) mod test_support;
