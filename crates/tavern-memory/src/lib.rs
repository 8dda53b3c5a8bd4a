//! # tavern-memory
//!
//! Durable, per-tenant conversational memory.
//!
//! Every tenant gets an isolated storage unit ([`store::TenantStore`]) made
//! of three parts:
//!
//! - [`short_term`] – the append-only log of recent messages awaiting
//!   consolidation.
//! - [`facts`] – long-term facts about users, with reference counting and
//!   supersession history.
//! - [`archive`] – immutable JSON snapshots of consolidated messages.
//!
//! [`registry::TenantRegistry`] maps tenant ids to stores and guarantees a
//! single store per tenant per process.  [`gate::RunGate`] is the per-tenant
//! single-flight flag used by the consolidation pipeline, and
//! [`validation`] holds the boundary checks applied to incoming text.

pub mod archive;
pub mod facts;
pub mod gate;
pub mod registry;
pub mod short_term;
pub mod store;
pub mod validation;

pub use archive::{ArchivalManager, ArchiveError};
pub use facts::{LongTermFactStore, Upsert};
pub use gate::{RunGate, RunPermit};
pub use registry::{RegistryError, TenantRegistry};
pub use short_term::{ShortTermLog, Snapshot, SnapshotBoundary};
pub use store::{StoreError, TenantStats, TenantStore};
pub use validation::ValidationError;
