//! Durable persistence for documents, change batches, sync-state
//! checkpoints, chat rings, and project metadata.

pub mod rocks;

pub use rocks::{CollabStore, ProjectMeta, StoreConfig, StoreError};
