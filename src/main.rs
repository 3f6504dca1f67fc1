//! # swiftpane
//!
//! Opens a toplevel under the running Wayland compositor, presents a flat
//! cleared frame as early as the configure handshake allows, then keeps
//! presenting at a fixed rate for a configured number of frames.
//!
//! `--headless` runs the same startup sequence against the built-in
//! simulated compositor and a software renderer.

use anyhow::Result;
use clap::Parser;
use log::{error, info};

use swiftpane::config::{SwiftpaneConfig, DEFAULT_CONFIG_PATH};
use swiftpane::{
    EglFactory, InitStrategy, ScriptedCompositor, SoftwareFactory, StartupError, StartupOrchestrator,
    StartupReport, StartupTimeline, WaylandClient,
};

#[derive(Parser)]
#[command(name = "swiftpane")]
#[command(about = "Brings up a GLES surface under Wayland with minimal time-to-first-pixel")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Run against the simulated compositor with software rendering
    #[arg(long)]
    headless: bool,

    /// Frames to present after the first one
    #[arg(long, value_name = "N")]
    frames: Option<u64>,

    /// Frame interval in milliseconds (0 = unpaced)
    #[arg(long, value_name = "N")]
    interval_ms: Option<u64>,

    /// Wait limit for the first configure in milliseconds (0 = forever)
    #[arg(long, value_name = "N")]
    configure_timeout_ms: Option<u64>,

    /// Initialise the driver, discovery and context one after another
    #[arg(long)]
    sequential: bool,

    /// Print the startup timeline as JSON on exit
    #[arg(long)]
    timeline_json: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    // Startup latency is measured from here.
    let timeline = StartupTimeline::new();
    let cli = Cli::parse();

    let loaded = SwiftpaneConfig::load(&cli.config);

    // Initialize logging
    let debug = cli.debug || loaded.as_ref().map_or(false, |c| c.general.debug);
    let default_filter = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    info!("Starting swiftpane {}", swiftpane::VERSION);

    let mut config = match loaded {
        Ok(config) => {
            info!("Configuration loaded from: {}", cli.config);
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            info!("Using default configuration");
            SwiftpaneConfig::default()
        }
    };

    // Override config with CLI flags
    apply_overrides(&cli, &mut config);
    config.validate()?;

    if cli.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let mut orchestrator = StartupOrchestrator::with_timeline(config.startup_options(), timeline);
    let result = if config.startup.headless {
        info!("Headless mode: simulated compositor, software rendering");
        let mut compositor = ScriptedCompositor::well_behaved(
            config.window.width as i32,
            config.window.height as i32,
            1,
        );
        orchestrator.run(&mut compositor, &SoftwareFactory::new())
    } else {
        let mut client = WaylandClient::new();
        orchestrator.run(&mut client, &EglFactory::new())
    };

    match result {
        Ok(report) => print_report(&report, config.general.timeline_json),
        Err(e) => abort(&e),
    }
}

/// Applies command-line flags on top of the loaded configuration.
fn apply_overrides(cli: &Cli, config: &mut SwiftpaneConfig) {
    if cli.debug {
        config.general.debug = true;
    }
    if cli.headless {
        config.startup.headless = true;
    }
    if cli.sequential {
        config.startup.strategy = InitStrategy::Sequential;
        info!("Sequential initialisation selected via CLI flag");
    }
    if let Some(ms) = cli.configure_timeout_ms {
        config.startup.configure_timeout_ms = ms;
    }
    if let Some(frames) = cli.frames {
        config.presentation.frame_count = frames;
    }
    if let Some(ms) = cli.interval_ms {
        config.presentation.interval_ms = ms;
    }
    if cli.timeline_json {
        config.general.timeline_json = true;
    }
}

fn print_report(report: &StartupReport, as_json: bool) -> Result<()> {
    info!(
        "Presented {} frames at {} ({} skipped, {} missed deadlines)",
        report.frames_presented,
        report.geometry,
        report.frames_skipped,
        report.frame_stats.missed_frames
    );
    if report.closed_by_compositor {
        info!("Window closed by compositor");
    }

    if as_json {
        println!("{}", report.timeline.to_json()?);
    } else {
        info!("Startup timeline:\n{}", report.timeline.to_text());
    }
    Ok(())
}

/// Prints the one-line diagnostic and exits non-zero.
fn abort(error: &StartupError) -> ! {
    error!("Startup aborted during {}", error.step());
    eprintln!("swiftpane: {}", error.diagnostic());
    std::process::exit(1);
}
