//! Workspace blob storage library
//!
//! Per-workspace blob storage over a pluggable object store, with a
//! cached listing layer and event-driven cleanup on workspace deletion.

pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod services;
pub mod storage;
