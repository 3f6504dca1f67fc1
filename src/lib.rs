//! # swiftpane
//!
//! Brings a GLES surface up under a Wayland compositor and gets the first
//! frame on screen as early as the protocol allows.
//!
//! ## Architecture
//!
//! - `protocol`: compositor connection, capability discovery, event dispatch
//! - `graphics`: driver init, surfaceless contexts, presentable surfaces
//! - `negotiator`: configure/acknowledge handshake state machine
//! - `presentation`: gated render/present and the fixed-rate loop
//! - `orchestrator`: sequences the above, overlapping driver warm-up with
//!   discovery
//! - `timeline`: time-to-first-pixel measurement
//! - `config`: TOML configuration
//!
//! ## Usage
//!
//! ```rust,no_run
//! use swiftpane::{EglFactory, StartupOptions, StartupOrchestrator, WaylandClient};
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut client = WaylandClient::new();
//!     let mut orchestrator = StartupOrchestrator::new(StartupOptions::default());
//!     let report = orchestrator.run(&mut client, &EglFactory::new())?;
//!     println!("{}", report.timeline.to_text());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod graphics;
pub mod negotiator;
pub mod orchestrator;
pub mod pacing;
pub mod presentation;
pub mod protocol;
pub mod timeline;

// Re-export main types for easy access
pub use config::SwiftpaneConfig;
pub use error::{StartupError, StartupStep};
pub use graphics::{EglFactory, SoftwareFactory};
pub use negotiator::{SurfaceNegotiator, SurfaceState, WindowGeometry};
pub use orchestrator::{InitStrategy, StartupOptions, StartupOrchestrator, StartupReport};
pub use protocol::{ProtocolClient, ScriptedCompositor, WaylandClient};
pub use timeline::StartupTimeline;

// Re-export common error types
pub use anyhow::{Context, Error, Result};

/// Version information for swiftpane
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
