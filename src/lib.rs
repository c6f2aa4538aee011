//! # procpipe
//!
//! Launch child processes with their standard streams piped back to the
//! parent, reap them in the background and report how they exited.
//!
//! ## Usage
//!
//! ```bash
//! procpipe run -- printf 'hello\n'
//! procpipe exec --capture "ls -l /tmp"
//! ```
//!
//! ## Modules
//!
//! - `subprocess` - Process controller, stream adapter, single-shot runner and the async runner seam
//! - `config` - Runtime settings loaded from TOML and the environment
pub mod config;
pub mod subprocess;
