pub mod collab;
pub mod config;
pub mod engine;
pub mod errors;
pub mod gates;
pub mod ledger;
pub mod lock;
pub mod logging;
pub mod orchestrator;
pub mod patch;
pub mod store;

pub(crate) mod persist;
pub(crate) mod process;

#[cfg(test)]
mod testing;

pub use patchline_common as common;
