//! Shared helpers for the library and the `nsq-tail` binary.

pub mod bootstrap;
pub mod retry;
