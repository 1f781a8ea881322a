#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Virtual Labs Shared Utilities
//!
//! Database pool construction and migration helpers shared across the
//! virtual-labs platform crates.

pub mod db;

pub use db::*;
