//! # huddle-admin
//!
//! Capacity-aware membership changes for group studies.
//!
//! [`GroupAdministration`] places participants into groups, takes them out
//! again and moves them between groups of a batch. Each change is one
//! store transaction; live dispatchers are told about it after commit.

#![deny(unsafe_code)]

pub mod administration;
pub mod errors;

pub use administration::GroupAdministration;
pub use errors::{AdminError, Result};
