//! CLI argument parsing for `kb`.
//!
//! Flags override every other configuration source.

use clap::{Args, Parser, Subcommand};

/// Tabular knowledge base
///
/// Builds a cached semantic index over spreadsheet and CSV rows and answers
/// cited top-k queries against it.
#[derive(Parser, Debug)]
#[command(name = "kb")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default ~/.config/knowledge-base/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Overrides selecting which knowledge base a command acts on.
#[derive(Args, Debug, Clone, Default)]
pub struct SourceArgs {
    /// Comma-separated source files
    #[arg(long)]
    pub paths: Option<String>,

    /// Embedding model id
    #[arg(long)]
    pub embedding_model: Option<String>,

    /// Embedding backend (remote, local)
    #[arg(long)]
    pub embedding_backend: Option<String>,

    /// Texts per embedding request
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Cache directory for index artifacts
    #[arg(long)]
    pub cache_dir: Option<String>,

    /// Abandon a rebuild after this many seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build (or validate) the cached index ahead of time
    Build {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Search the knowledge base
    Query {
        /// Query text
        text: String,

        /// Records to return (default from config)
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Number citations from K<offset+1>
        #[arg(long, default_value = "0")]
        offset: usize,

        #[command(flatten)]
        source: SourceArgs,
    },

    /// Report whether the cached index is fresh, without building
    Status {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Drop cached artifacts for the configured sources
    Invalidate {
        /// Delete the index files from the cache directory
        #[arg(long)]
        purge: bool,

        #[command(flatten)]
        source: SourceArgs,
    },

    /// Print the effective configuration
    Config {
        #[command(flatten)]
        source: SourceArgs,
    },
}

impl Commands {
    pub fn source_args(&self) -> &SourceArgs {
        match self {
            Commands::Build { source }
            | Commands::Query { source, .. }
            | Commands::Status { source }
            | Commands::Invalidate { source, .. }
            | Commands::Config { source } => source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_build_with_overrides() {
        let cli = Cli::parse_from([
            "kb",
            "build",
            "--paths",
            "a.xlsx,b.csv",
            "--embedding-backend",
            "local",
            "--batch-size",
            "5",
        ]);
        match cli.command {
            Commands::Build { source } => {
                assert_eq!(source.paths.as_deref(), Some("a.xlsx,b.csv"));
                assert_eq!(source.embedding_backend.as_deref(), Some("local"));
                assert_eq!(source.batch_size, Some(5));
            }
            _ => panic!("Expected Build command"),
        }
    }

    #[test]
    fn test_cli_query() {
        let cli = Cli::parse_from(["kb", "query", "battery makers", "-k", "5", "--offset", "2"]);
        match cli.command {
            Commands::Query {
                text,
                top_k,
                offset,
                ..
            } => {
                assert_eq!(text, "battery makers");
                assert_eq!(top_k, Some(5));
                assert_eq!(offset, 2);
            }
            _ => panic!("Expected Query command"),
        }
    }

    #[test]
    fn test_cli_invalidate_purge() {
        let cli = Cli::parse_from(["kb", "invalidate", "--purge"]);
        assert!(matches!(cli.command, Commands::Invalidate { purge: true, .. }));
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::parse_from(["kb", "status", "--config", "/etc/kb.toml", "-l", "debug"]);
        assert_eq!(cli.config.as_deref(), Some("/etc/kb.toml"));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Commands::Status { .. }));
    }

    #[test]
    fn test_cli_config() {
        let cli = Cli::parse_from(["kb", "config", "--cache-dir", "/tmp/kb"]);
        assert_eq!(cli.command.source_args().cache_dir.as_deref(), Some("/tmp/kb"));
    }
}
