// src/sync/providers/mod.rs
pub mod geotab;
pub mod scripted;
