//! Knowledge base command-line tool.
//!
//! # Usage
//!
//! ```bash
//! kb build --paths data/companies.xlsx,data/concepts.csv
//! kb query "lithium battery suppliers" --top-k 5
//! kb status
//! kb invalidate --purge
//! kb config
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/knowledge-base/config.toml)
//! 3. `--config` file
//! 4. Environment variables (KB_*)
//! 5. CLI flags

use anyhow::Result;
use clap::Parser;

use knowledge_cli::{run, Cli};

fn main() -> Result<()> {
    run(Cli::parse())
}
