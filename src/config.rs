//! Command-line configuration.

use std::path::PathBuf;

use clap::Parser;

/// Command-line arguments for the inference server binary.
#[derive(Parser, Debug)]
#[command(name = "fate-server", about = "Multi-agent RL inference and rollout server")]
pub struct ServerConfig {
    /// UDP port to listen on for STATE/DONE packets.
    #[arg(long, default_value_t = 7777)]
    pub port: u16,

    /// UDP port game clients listen on for ACTION replies.
    #[arg(long = "send-port", alias = "action-port", default_value_t = 7778)]
    pub send_port: u16,

    /// Torch device: cpu or cuda.
    #[arg(long, default_value = "cpu")]
    pub device: String,

    /// Directory containing model_latest.pt.
    #[arg(long, default_value = "./models")]
    pub model_dir: PathBuf,

    /// Directory rollout files are written to.
    #[arg(long, default_value = "./rollouts")]
    pub rollout_dir: PathBuf,

    /// Minimum buffered transitions before episodes are flushed to disk.
    #[arg(long, default_value_t = 4096)]
    pub rollout_size: usize,

    /// Seconds between model artifact reload checks.
    #[arg(long, default_value_t = 5)]
    pub reload_interval: u64,
}
