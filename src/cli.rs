//! Command-line interface definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "songsearch", version, about = "Resolve track identities and clean up duplicates")]
pub struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Library database, overriding the config file
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fill in missing metadata by acoustic fingerprint
    Enrich {
        /// Maximum number of tracks to process
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum match score (0..1) required to apply a candidate
        #[arg(long)]
        min_confidence: Option<f64>,

        /// Also write the resolved metadata into the files' tags
        #[arg(long)]
        write_tags: bool,
    },
    /// Find likely duplicates and optionally move all but the best copy away
    Dupes {
        /// Directory that receives the non-keeper copies
        #[arg(long)]
        move_to: Option<PathBuf>,

        /// Skip printing the duplicate groups
        #[arg(long)]
        no_preview: bool,
    },
}
