//! Cloud provider abstraction for XRegion Sync.
//!
//! This module provides the trait-based boundary the sync engine talks to
//! (image catalog, database snapshot catalog, identity directory), a provider
//! registry for resolving region-scoped clients from client configuration,
//! and an in-memory provider.
//!
//! # Design Principles
//! - Region scoping: every client is bound to exactly one region
//! - Async operations: all provider calls are async
//! - No retries here: timeouts and backoff belong to concrete clients
//! - Unified error semantics: every backend reports through `xregion_common::Error`

pub mod client;
pub mod memory;
pub mod registry;

pub use client::{
    ClientConfig, CloudClient, DbInstance, DbSnapshot, IdentityDirectory, Image, ImageCatalog,
    SnapshotCatalog, SnapshotKind,
};
pub use memory::{CloudOperation, CloudState, MemoryClient, MemoryCloud, Mutation, RegionState};
pub use registry::{create_default_registry, ProviderFactory, ProviderRegistry};
