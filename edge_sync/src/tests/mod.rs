//! Internal tests module
//!
//! Shared fixtures plus end-to-end scenarios that drive the controller and
//! peer halves against each other with full access to crate internals.

mod scenarios;
pub(crate) mod test_utils;
