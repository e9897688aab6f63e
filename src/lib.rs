//! Exam PDF pipeline
//!
//! Turns uploaded exam PDFs into structured question sets (parse jobs) and
//! turns student submissions into graded transcripts (mark jobs), driven by a
//! Redis-backed job queue.

pub mod ai;
pub mod answers;
pub mod config;
pub mod error;
pub mod exam;
pub mod extractor;
pub mod parser;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod scorer;
pub mod service;
pub mod storage;
pub mod transcript;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
