//! Core services over the universal tables.

pub mod duplicates;
pub mod entity;
pub mod gl_intelligence;
pub mod metadata;
pub mod naming;
pub mod transaction;
