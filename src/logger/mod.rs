//! Event journal: JSONL file with graceful degradation, written off-thread.

pub mod journal;
pub mod jsonl;
