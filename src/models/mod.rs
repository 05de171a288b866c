//! Core data models for the app distribution service.
//!
//! `BuildRecord` is the persisted metadata of one uploaded build; it
//! serializes as the JSON document stored on disk and returned over HTTP.
//! `IndexEntry` is the per-app ordering cache kept by the filesystem backend.

pub mod build;
pub mod index;
