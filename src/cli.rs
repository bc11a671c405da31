use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::query::DEFAULT_NEIGHBORS;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Find or create the index and endpoint, deploy, and save the result
    Init {},

    /// Upload images, embed them and update the index
    Ingest {
        /// A directory of images, or image files and gs:// uris
        #[clap(required = true)]
        sources: Vec<String>,

        /// Store images under this user instead of admin
        #[clap(short, long)]
        user: Option<String>,
    },

    /// Ingest a JSON manifest of {"path", "user_type", "user_id"} items in batches
    Bulk {
        manifest: PathBuf,

        /// Items per batch [default: ingest.batch_size]
        #[clap(short, long)]
        batch_size: Option<usize>,
    },

    /// Find images similar to a query image
    Search {
        image: PathBuf,

        /// Number of neighbors
        #[clap(short, default_value_t = DEFAULT_NEIGHBORS)]
        k: usize,

        /// JSON list of restricts, e.g. '[{"namespace":"user_type","allowList":["admin"]}]'
        #[clap(short, long)]
        filter: Option<String>,

        /// Download matched images to this directory
        #[clap(short, long)]
        download: Option<PathBuf>,
    },

    /// Serve the HTTP API
    Serve {},

    /// Print the effective configuration
    Config {},
}
