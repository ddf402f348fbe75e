//! Integration and end-to-end tests for Cairn.
//!
//! This crate provides:
//! - A store harness backed by a temporary directory
//! - A blob medium wrapper that counts writes and deletes
//! - Deterministic test data generators

pub mod data;
pub mod harness;

pub use harness::{CountingMedium, TestStore};
