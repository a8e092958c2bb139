//! # Project Matcher
//!
//! Ranks opportunity listings ("projects") against a structured candidate
//! profile while keeping calls to an expensive, rate-limited scoring model
//! to a minimum.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ raw        │──▶│ normalize  │──▶│ index       │──▶│ scoring      │
//! │ projects   │   │ dedup+link │   │ prefilter   │   │ cache→chain  │
//! └────────────┘   └────────────┘   └──────┬──────┘   └──────┬───────┘
//!                                          │                 │
//!                                          ▼                 ▼
//!                                   ┌──────────────────────────────┐
//!                                   │ SQLite: vectors, match cache │
//!                                   │ history, documents           │
//!                                   └──────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! pmatch init
//! pmatch normalize projects.json
//! pmatch match --candidate cv.json --projects projects.json --min-score 60
//! pmatch cache stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`hashing`] | Content hashes and canonical JSON |
//! | [`store`] | Content-addressed file storage |
//! | [`normalize`] | Project validation, dedup and link back-fill |
//! | [`embedding`] | Embedding backend abstraction |
//! | [`index`] | Cached vectors and similarity prefilter |
//! | [`cache`] | Match cache, history and project-list cache |
//! | [`response`] | Lenient JSON extraction from model output |
//! | [`prompts`] | Scoring prompt text |
//! | [`scoring`] | Scoring backends, retry policy and fallback chain |
//! | [`matcher`] | Hybrid orchestration |
//! | [`commands`] | CLI command handlers |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod hashing;
pub mod index;
pub mod matcher;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod prompts;
pub mod response;
pub mod scoring;
pub mod store;
