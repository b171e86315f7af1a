use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Fetch every file under a remote FTP directory with bounded concurrency")]
pub struct Cli {
    #[clap(short, long, global = true, help = "Print verbose diagnostic logs")]
    pub verbose: bool,
    #[clap(long, global = true, value_name = "PATH", help = "Also append logs to this file")]
    pub log_file: Option<PathBuf>,
    #[clap(long, global = true, help = "Print a one-line JSON summary")]
    pub json: bool,
    #[clap(short, long, global = true, help = "Hide progress and the human-readable summary")]
    pub quiet: bool,
    #[clap(long, global = true, value_name = "PATH", help = "Config file (default ~/.ftpfetch/config.json)")]
    pub config: Option<PathBuf>,
    #[clap(subcommand)]
    pub command: Commands,
}

/// Options shared by every command that runs the pipeline. Unset values
/// fall back to the config file.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    #[clap(short = 'l', long = "local-root", help = "Local directory receiving the files")]
    pub local_root: Option<PathBuf>,
    #[clap(short = 'c', long = "concurrency", help = "Maximum simultaneous transfers (> 0)")]
    pub concurrency: Option<usize>,
    #[clap(short, long, help = "Descend into subdirectories")]
    pub recursive: bool,
    #[clap(long, value_name = "SECS", help = "Cancel the run after this many seconds")]
    pub timeout: Option<u64>,
    #[clap(long, value_name = "PATH", help = "Append failed files as JSON Lines to this file")]
    pub failures_out: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Fetch a remote directory from an FTP server", name = "fetch", display_order = 1)]
    Fetch {
        #[clap(long, help = "FTP server host")]
        host: Option<String>,
        #[clap(short, long, help = "FTP server port")]
        port: Option<u16>,
        #[clap(help = "Remote base directory")]
        base_dir: Option<String>,
        #[clap(short, long, help = "Login user (default anonymous)")]
        user: Option<String>,
        #[clap(long, help = "Login password")]
        password: Option<String>,
        #[clap(flatten)]
        run: RunArgs,
    },
    #[clap(
        about = "Run the pipeline against a built-in in-memory server with generated files",
        name = "demo",
        display_order = 2
    )]
    Demo {
        #[clap(long, default_value_t = 30, help = "Number of generated files")]
        files: usize,
        #[clap(long, default_value_t = 10, help = "Directories the files are spread over")]
        dirs: usize,
        #[clap(long = "fail", value_name = "REMOTE_PATH", help = "Drop the connection mid-transfer for this path")]
        fail: Vec<String>,
        #[clap(long, default_value_t = 16, help = "Bytes sent before an injected drop")]
        drop_after: usize,
        #[clap(long, value_name = "MS", default_value_t = 0, help = "Artificial delay per transfer")]
        delay_ms: u64,
        #[clap(flatten)]
        run: RunArgs,
    },
}
