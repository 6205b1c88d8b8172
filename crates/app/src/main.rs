mod cli;

use std::process;

use clap::Parser;
use tracing::{error, info};
use vision::pipeline::{CameraConfig, TEMPLATE, telemetry};

fn main() {
    let args = cli::Args::parse();
    if args.template {
        print!("{TEMPLATE}");
        return;
    }
    let Some(path) = args.config else {
        eprintln!("no configuration file given");
        process::exit(1);
    };

    let mut config = match CameraConfig::load(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            process::exit(1);
        }
    };
    if args.chrome_trace.is_some() {
        config.telemetry.chrome_trace_path = args.chrome_trace;
    }
    if args.metrics_addr.is_some() {
        config.telemetry.metrics_addr = args.metrics_addr;
    }

    let _telemetry = telemetry::enter_runtime(&config.telemetry, config.print_debug);
    if let Err(err) = telemetry::init_metrics_recorder(config.telemetry.metrics_addr) {
        error!("Failed to start metrics exporter: {err:#}");
    }
    info!("Loaded configuration from {}", path.display());
    config.log_summary();

    let setup = match vision::prepare(&config) {
        Ok(setup) => setup,
        Err(err) => {
            error!("Startup failed: {err}");
            process::exit(err.exit_code());
        }
    };

    if let Err(err) = vision::run(config, setup) {
        error!("Pipeline stopped: {err:#}");
        process::exit(1);
    }
}
