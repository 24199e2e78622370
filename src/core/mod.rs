//! Core gateway machinery: canonical types, errors, the driver contract and
//! its adapters, message translation, and the driver registry.

pub mod drivers;
pub mod error;
pub mod registry;
pub mod translate;
pub mod types;
