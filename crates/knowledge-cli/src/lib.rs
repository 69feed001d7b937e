//! Library side of the `kb` binary.
//!
//! - `cli`: argument parsing with clap
//! - `commands`: command implementations

pub mod cli;
pub mod commands;

pub use cli::{Cli, Commands, SourceArgs};
pub use commands::{
    apply_overrides, describe_file, init_logging, load_settings, render_config, run, run_build,
    run_config, run_invalidate, run_query, run_status,
};
