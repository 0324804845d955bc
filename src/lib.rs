#![recursion_limit = "256"]

//! Low-rank adapter fine-tuning for small causal language models.
//!
//! Layers, outermost first:
//!
//! - [`cli`]         argument parsing and dispatch
//! - [`application`] train and generate workflows
//! - [`domain`]      examples, adapter spec, run settings
//! - [`data`]        JSONL loading, tokenisation, batching
//! - [`ml`]          model, adapter, training job, generation
//! - [`infra`]       tokenizer, checkpoints, metrics

pub mod application;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod infra;
pub mod ml;

pub use error::{FineTuneError, Result};
