// ABOUTME: Library crate for pg-bisync
// ABOUTME: Exposes the sync engine, configuration and connection helpers

pub mod bisync;
pub mod config;
pub mod postgres;
pub mod utils;

pub use bisync::{BidirectionalSync, BidirectionalSyncResult, InspectReport, SkipReason, SyncMode};
pub use config::{FailureMode, SelfReference, SyncConfig};
