//! vodrelay - self-hosted media streaming proxy
//!
//! This library crate exposes the proxy components for the binary and for
//! integration testing.

pub mod config;
pub mod manifest;
pub mod origin;
pub mod server;
pub mod source;
pub mod streaming;
