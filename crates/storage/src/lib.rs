//! Storage layer for snapvault
//!
//! This crate provides the reference implementation of the snapshot
//! metadata store:
//! - InMemoryMetadataStore: `SnapshotMetadataStore` over a BTreeMap + RwLock
//! - VolumeIndex: volume → snapshot ids secondary index
//!
//! Production deployments plug in their own transactional store behind the
//! same trait; this one backs tests and embedded use.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod index;
pub mod memory;

pub use index::VolumeIndex;
pub use memory::InMemoryMetadataStore;
