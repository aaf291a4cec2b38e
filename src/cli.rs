use clap::Parser;
use std::path::PathBuf;

use crate::config::Profile;

// Build version with target info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Clock:  virtual (simulated host)\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Viewport-driven media playback scheduler, driven by a simulated feed
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Number of posts in the simulated feed
    #[arg(short = 'n', long = "posts", value_name = "N", default_value_t = 60)]
    pub posts: usize,

    /// Post height in px
    #[arg(long = "item-height", value_name = "PX", default_value_t = 600.0)]
    pub item_height: f64,

    /// Viewport height in px
    #[arg(long = "viewport", value_name = "PX", default_value_t = 900.0)]
    pub viewport: f64,

    /// Scroll speed in px per second
    #[arg(short = 's', long = "speed", value_name = "PX_PER_SEC", default_value_t = 600.0)]
    pub scroll_speed: f64,

    /// Simulated duration in seconds
    #[arg(short = 'd', long = "duration", value_name = "SECS", default_value_t = 30.0)]
    pub duration: f64,

    /// Simulation step in milliseconds
    #[arg(long = "step", value_name = "MS", default_value_t = 16)]
    pub step_ms: u64,

    /// Media load latency in milliseconds
    #[arg(long = "latency", value_name = "MS", default_value_t = 300)]
    pub latency_ms: u64,

    /// Override max concurrent videos
    #[arg(short = 'm', long = "max-concurrent", value_name = "N")]
    pub max_concurrent: Option<usize>,

    /// Only one post has audio at a time
    #[arg(short = 'x', long = "exclusive-audio")]
    pub exclusive_audio: bool,

    /// Request high renditions (tighter preload/unload distances)
    #[arg(long = "hd")]
    pub hd: bool,

    /// Device profile (default: detected from memory and core count)
    #[arg(short = 'p', long = "profile", value_enum)]
    pub profile: Option<Profile>,

    /// Post indices whose loads always fail (can be specified multiple times)
    #[arg(long = "fail", value_name = "INDEX")]
    pub fail: Vec<usize>,

    /// Post indices whose autoplay is always rejected
    #[arg(long = "reject", value_name = "INDEX")]
    pub reject: Vec<usize>,

    /// Print every feed event as a JSON line
    #[arg(short = 'e', long = "events")]
    pub print_events: bool,

    /// Print effective settings as JSON and exit
    #[arg(long = "dump-config")]
    pub dump_config: bool,

    /// Write effective settings to the settings file and exit
    #[arg(long = "save-config")]
    pub save_config: bool,

    /// Enable debug logging to file (default: feedplay.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
}
