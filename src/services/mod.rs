//! Build repository backends and the pieces they share.

pub mod files;
pub mod fs_repository;
pub mod locks;
pub mod repository;
pub mod sql_repository;
