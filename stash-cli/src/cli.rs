use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser, Debug)]
#[command(
    name = "stash",
    version,
    about = "URL-keyed asset cache",
    long_about = "Fetch remote assets into a local cache directory.\n\
                  \n\
                  Each URL is downloaded at most once and stored as one file named by a\n\
                  hash of the URL. Later requests are served from disk."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Cache directory (defaults to <temp>/stash-cache)
    #[arg(short, long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true, help = "Enable detailed debug logging")]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Memory tier budget with optional unit (B, KB, MB, GB)
    #[arg(long, global = true, default_value = "30MB")]
    pub max_memory: String,

    /// Overall timeout in seconds for HTTP requests, 0 for none
    #[arg(long, global = true, default_value = "0")]
    pub timeout: u64,

    /// Connection timeout in seconds
    #[arg(long, global = true, default_value = "10")]
    pub connect_timeout: u64,

    /// Host allowed to present a self-signed certificate (repeatable)
    #[arg(long = "self-signed-host", global = true)]
    pub self_signed_hosts: Vec<String>,

    /// Custom HTTP header in "Name: Value" form (repeatable)
    #[arg(short = 'H', long = "header", global = true)]
    pub headers: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch URLs, downloading any that are not cached yet
    Fetch {
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Queue URLs for background prefetch and wait for them to finish
    Prefetch {
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Print the local path each URL maps to
    Path {
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Print cache counters and tier sizes as JSON
    Stats,

    /// Delete cached files that are not in use
    Flush,

    /// Delete the durable index, leaving files orphaned on disk
    ClearIndex {
        /// Confirm the operation; it cannot be undone
        #[arg(long)]
        yes: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fetch_with_globals() {
        let args = CliArgs::try_parse_from([
            "stash",
            "fetch",
            "https://example.com/a.png",
            "--cache-dir",
            "/tmp/c",
            "-H",
            "Referer: https://example.com",
            "--self-signed-host",
            "dev.local",
        ])
        .unwrap();

        assert_eq!(args.cache_dir, Some(PathBuf::from("/tmp/c")));
        assert_eq!(args.headers.len(), 1);
        assert_eq!(args.self_signed_hosts, vec!["dev.local".to_string()]);
        match args.command {
            Command::Fetch { urls } => assert_eq!(urls, vec!["https://example.com/a.png"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_fetch_requires_url() {
        assert!(CliArgs::try_parse_from(["stash", "fetch"]).is_err());
    }
}
