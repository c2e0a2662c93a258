//! virgo: run unikernels locally.
//!
//! A project is pulled from a package service into a registry on disk,
//! launched as one or more detached hypervisor instances, tracked in a
//! runtime ledger shared by every invocation of the tool, and torn down again
//! by name.

pub mod config;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod network;
pub mod package;
pub mod paths;
pub mod registry;
pub mod runner;
pub mod runtime;
pub mod vm;

pub use error::{Error, Result};
