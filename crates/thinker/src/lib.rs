//! Relation classification (C5) and fact/trigger extraction (C6).
//!
//! This crate turns raw conversation text into the durable memory graph
//! `vesper-memory` stores: it decides whether a candidate fact is new,
//! supersedes, or extends an existing one, and recognises proactive
//! reminders worth scheduling.

pub mod classifier;
pub mod embedding;
pub mod extractor;
pub mod trigger_time;

pub use classifier::{classify_relations, Candidate, Classification, ExistingFact, Verdict};
pub use embedding::EmbeddingProvider;
pub use extractor::{extract_and_store, ExtractionConfig};
pub use trigger_time::{parse_trigger_phrase, resolve, ParsedTrigger};
