//! In-crate hierarchical file container
//!
//! Minimal hierarchical data model with the surface the file sink needs:
//! groups, typed datasets (with an unlimited, chunked first dimension),
//! attributes and links. The tree is persisted to disk as a self-describing
//! JSON document on flush and close.
//!
//! None of this is thread-safe; every mutation must go through the file
//! sink's writer thread.

mod file;
mod types;

pub use file::{absolute_target, Attributes, Dataset, Group, HdfError, HdfFile, Node};
pub use types::{flatten_values, DType, DataBlock, MAX_ARRAY_DIMENSIONS, MAX_STRING_LENGTH};
