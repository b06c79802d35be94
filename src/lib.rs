//! Analytics Resolution Engine
//!
//! Answers natural-language financial questions about an agricultural
//! producer:
//! - classifies each question as descriptive, diagnostic, predictive or prescriptive
//! - resolves the data from a live warehouse, falling back to a static dataset
//!   and always saying which one answered
//! - explains variances and runs what-if scenarios over a crop driver tree
//! - keeps per-session context so follow-ups can be short
//!
//! FLOW:
//! CLASSIFY → INTERPRET → RESOLVE → ANALYZE → RECORD

pub mod agent;
pub mod api;
pub mod classifier;
pub mod config;
pub mod driver_tree;
pub mod error;
pub mod gemini;
pub mod interpret;
pub mod knowledge;
pub mod memory;
pub mod models;
pub mod resolver;
pub mod sensitivity;
pub mod variance;

pub use error::{AnalyticsError, Result};

// Re-export common types
pub use agent::{AnalyticsEngine, EngineResponse};
pub use classifier::{Intent, IntentClassifier};
pub use models::*;
