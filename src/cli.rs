use clap::Parser;
use std::path::PathBuf;

// Build version with target info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Pixel-matrix display engine
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Enable debug logging to file (default: marquee.log in the data dir)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Override the Vegas enable flag from settings (0|1)
    #[arg(long = "vegas", value_name = "0|1")]
    pub vegas: Option<u8>,

    /// Override the target tick rate (frames per second)
    #[arg(long = "fps", value_name = "FPS")]
    pub fps: Option<f32>,

    /// Dump every Nth rendered frame as PNG into DIR instead of driving
    /// hardware
    #[arg(long = "dump-frames", value_name = "DIR")]
    pub dump_frames: Option<PathBuf>,

    /// Frame dump stride (with --dump-frames)
    #[arg(long = "dump-every", value_name = "N", default_value = "30")]
    pub dump_every: u64,

    /// Worker threads override for plugin updates
    #[arg(long = "workers", value_name = "N")]
    pub workers: Option<usize>,
}
