//!
//! src/lib.rs  Andrew Belles  Oct 12th, 2025
//!
//! Cross-service playlist etl: weekly genre charts from spotify, apple music
//! and soundcloud, joined by isrc into one consensus playlist per genre,
//! enriched with youtube links and daily play counts
//!

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod counts;
pub mod enrich;
pub mod errors;
pub mod fetch;
pub mod identity;
pub mod logging;
pub mod normalize;
pub mod persistent;
pub mod pipeline;
pub mod pool;
pub mod query;
pub mod retry;
pub mod schedule;
pub mod scrape;
pub mod sink;
pub mod sources;
pub mod text;
pub mod types;

pub use errors::EtlError;
