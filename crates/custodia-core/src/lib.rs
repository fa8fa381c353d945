//! # custodia-core
//! Foundation types and trait seams for the Custodia wallet backend.

pub mod error;
pub mod traits;
pub mod types;
