//! # Nexus
//!
//! A retrieval-augmented document chat pipeline for hosted language models.
//!
//! Nexus ingests documents (PDF, DOCX, plain text, images), chunks and
//! embeds their text, and answers questions with a hosted chat model's
//! streamed response grounded in the most relevant passages — optionally
//! enriched with live web-search snippets.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌───────────────┐
//! │  Upload  │──▶│ Ingest +    │──▶│ Vector Index  │
//! │ PDF/DOCX │   │ Chunk+Embed │   │ (per session) │
//! └──────────┘   └─────────────┘   └──────┬────────┘
//!                                         │ top-k
//!            ┌────────────┐   ┌───────────▼────────┐
//!            │ Web search │──▶│ Context Assembler  │
//!            └────────────┘   └───────────┬────────┘
//!            ┌────────────┐   ┌───────────▼────────┐
//!            │  History   │──▶│ Completion Client  │──▶ streamed answer
//!            └────────────┘   └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`ingest`] | Document text extraction |
//! | [`chunk`] | Overlapping text chunking |
//! | [`embedding`] | Hosted embedding providers |
//! | [`index`] | Vector index with SQLite snapshots |
//! | [`websearch`] | Hosted web-search snippets |
//! | [`context`] | Prompt assembly and budgets |
//! | [`completion`] | Streaming chat-completion client |
//! | [`session`] | Session state and its on-disk store |
//! | [`turn`] | Per-turn orchestration |
//! | [`stages`] | Sequential review pipelines |

pub mod chunk;
pub mod completion;
pub mod config;
pub mod context;
pub mod embedding;
pub mod index;
pub mod ingest;
pub mod models;
pub mod session;
pub mod stages;
pub mod turn;
pub mod websearch;
