//! Ordo daemon library
//!
//! Command line parsing and node wiring for `ordod`, exposed as a library
//! so the daemon can be embedded and tested.

pub mod cli;
pub mod server;

pub use cli::{Cli, DeploymentMode};
pub use server::{OrdoServer, RunningServer, ShutdownHandle};
