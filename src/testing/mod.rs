//! Test support: mock link, connector, and transport implementations.

pub mod mocks;
