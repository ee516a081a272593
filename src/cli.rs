use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::cache::{CategoryKind, SweepTrigger};

#[derive(Debug, Clone, Parser)]
#[command(name = "ugc-cache", about = "Bounded disk cache manager for the UGC feed client")]
pub struct Cli {
    /// Path to the configuration file (defaults to ./ugc-cache.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print Prometheus metrics to stderr after the command finishes.
    #[arg(long)]
    pub metrics: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Show live usage per category.
    Stats,
    /// Run a sweep across all categories.
    Sweep {
        #[arg(long, value_enum, default_value_t = SweepTrigger::Manual)]
        trigger: SweepTrigger,
        /// Only sweep when the sweep interval has elapsed.
        #[arg(long)]
        if_due: bool,
    },
    /// Delete every cached file, including the image cache.
    Purge,
    /// Copy a local file into a category through admission control.
    Import {
        #[arg(long, value_enum)]
        category: CategoryKind,
        source: PathBuf,
    },
    /// Stay in the foreground: sweep on startup when due, run the scheduler,
    /// sweep on SIGUSR1 as a low-memory signal, and stop on Ctrl-C.
    Run,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sweep_with_trigger() {
        let cli = Cli::try_parse_from([
            "ugc-cache",
            "--config",
            "cache.toml",
            "sweep",
            "--trigger",
            "low-memory",
            "--if-due",
        ])
        .expect("parse");
        assert_eq!(cli.config, Some(PathBuf::from("cache.toml")));
        match cli.command {
            Command::Sweep { trigger, if_due } => {
                assert_eq!(trigger, SweepTrigger::LowMemory);
                assert!(if_due);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_import() {
        let cli = Cli::try_parse_from([
            "ugc-cache",
            "import",
            "--category",
            "thumbnail",
            "/tmp/a.jpg",
        ])
        .expect("parse");
        match cli.command {
            Command::Import { category, source } => {
                assert_eq!(category, CategoryKind::Thumbnail);
                assert_eq!(source, PathBuf::from("/tmp/a.jpg"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
