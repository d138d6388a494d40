// src/config/mod.rs
pub mod sync;
