//! Filesystem helpers for snapshot capture.

pub mod walker;
