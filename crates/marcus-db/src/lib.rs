//! Domain model, capability interfaces, and JSON-file persistence for the
//! Marcus assignment coordination core.

pub mod cache;
pub mod capability;
pub mod ledger;
pub mod model;
