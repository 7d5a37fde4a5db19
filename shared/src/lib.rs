//! Shared library for Silka Lambda functions.
//!
//! This crate provides common utilities, types, and clients used across all Lambda functions.

pub mod config;
pub mod embeddings;
pub mod error;
pub mod hevy;
pub mod invoke;
pub mod models;
pub mod notify;
pub mod query_history;
pub mod sql_metadata;
pub mod storage;

pub use config::Config;
pub use embeddings::EmbeddingClient;
pub use error::{Error, Result};
pub use hevy::HevyClient;
pub use invoke::LambdaInvoker;
pub use models::{Exercise, QueryHistoryRecord, Workout, WorkoutSet};
pub use notify::{format_workout_message, send_discord_message};
pub use query_history::QueryHistoryStore;
pub use sql_metadata::{extract_sql_metadata, SqlMetadata};
pub use storage::WorkoutStore;
