//! Shared fixtures for the Coplay integration tests.

pub mod fixtures;
