//! Filesystem-backed pattern registry.

pub mod fs;
