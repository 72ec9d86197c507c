//! # pairpad-server: the `pairpad` binary's building blocks
//!
//! - [`config`]: clap flags layered over the library configs
//! - [`api`]: axum router for room lifecycle and suggestions
//! - [`runner`]: streams a script through the execution supervisor

pub mod api;
pub mod config;
pub mod runner;
