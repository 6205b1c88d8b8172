use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

/// Record hi-res clips of a camera whenever objects move in its low-res feed.
#[derive(Parser, Debug)]
#[command(name = "clipwatch", author, version, about)]
pub struct Args {
    /// Path to the JSON camera configuration.
    #[arg(required_unless_present = "template")]
    pub config: Option<PathBuf>,

    /// Print a template configuration to stdout and exit.
    #[arg(short, long)]
    pub template: bool,

    /// Write a Chrome trace of pipeline spans to this file.
    #[arg(long, value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,

    /// Serve Prometheus metrics on this address.
    #[arg(long, value_name = "ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}
