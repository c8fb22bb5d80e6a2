//! # carelink-common
//!
//! Foundation for the CareLink crates: configuration, errors, the session
//! user, wire models and the local persisted store. Nothing here talks to the
//! network.

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod session;
pub mod store;
