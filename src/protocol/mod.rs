//! Compositor protocol client
//!
//! The [`ProtocolClient`] trait is the seam between the startup sequence and
//! the windowing transport. It covers exactly what startup needs:
//!
//! - connecting to the compositor session
//! - one discovery round-trip that binds the surface factory and the shell
//! - creating the toplevel surface objects
//! - acknowledging configure events
//! - pumping incoming events, with keep-alive pings answered in place
//!
//! Two implementations exist: [`wayland::WaylandClient`] talks to a real
//! compositor, [`scripted::ScriptedCompositor`] simulates one in-process.

pub mod scripted;
pub mod wayland;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use log::{debug, info};

use crate::error::StartupError;

pub use scripted::{Request, ScriptedCompositor};
pub use wayland::WaylandClient;

/// Protocol capabilities the system needs from the compositor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    /// Creates `wl_surface` objects
    SurfaceFactory,
    /// Assigns shell roles (toplevel) to surfaces
    Shell,
}

impl Capability {
    /// Capabilities without which presentation can never begin.
    pub const REQUIRED: [Capability; 2] = [Capability::SurfaceFactory, Capability::Shell];

    /// Wayland interface that provides this capability
    pub fn interface(&self) -> &'static str {
        match self {
            Capability::SurfaceFactory => "wl_compositor",
            Capability::Shell => "xdg_wm_base",
        }
    }

    /// Highest interface version the client knows how to drive
    pub fn max_version(&self) -> u32 {
        match self {
            Capability::SurfaceFactory => 4,
            Capability::Shell => 2,
        }
    }

    pub fn from_interface(interface: &str) -> Option<Self> {
        Capability::REQUIRED
            .into_iter()
            .find(|c| c.interface() == interface)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::SurfaceFactory => f.write_str("surface-factory"),
            Capability::Shell => f.write_str("shell"),
        }
    }
}

/// A global as advertised by the compositor's registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedGlobal {
    pub name: u32,
    pub interface: String,
    pub version: u32,
}

impl AdvertisedGlobal {
    pub fn new(name: u32, interface: &str, version: u32) -> Self {
        Self {
            name,
            interface: interface.to_string(),
            version,
        }
    }
}

/// Registry entry chosen for a capability and the version it gets bound at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityBinding {
    pub global_name: u32,
    pub version: u32,
}

/// Capabilities discovered in the single registry round-trip.
///
/// Built once by [`ProtocolClient::discover_capabilities`] and never mutated
/// afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    bindings: BTreeMap<Capability, CapabilityBinding>,
    advertised: usize,
}

impl CapabilitySet {
    /// Maps advertised globals onto known capabilities.
    ///
    /// When a compositor advertises an interface twice the first entry wins.
    pub fn from_globals(globals: &[AdvertisedGlobal]) -> Self {
        let mut bindings = BTreeMap::new();
        for global in globals {
            if let Some(capability) = Capability::from_interface(&global.interface) {
                bindings.entry(capability).or_insert(CapabilityBinding {
                    global_name: global.name,
                    version: global.version.min(capability.max_version()),
                });
            }
        }
        Self {
            bindings,
            advertised: globals.len(),
        }
    }

    pub fn get(&self, capability: Capability) -> Option<&CapabilityBinding> {
        self.bindings.get(&capability)
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.bindings.contains_key(&capability)
    }

    pub fn missing(&self) -> Vec<Capability> {
        Capability::REQUIRED
            .into_iter()
            .filter(|c| !self.contains(*c))
            .collect()
    }

    /// Fails with `MissingCapability` unless every required capability is present.
    pub fn ensure_complete(&self) -> Result<(), StartupError> {
        let missing = self.missing();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StartupError::MissingCapability { missing })
        }
    }

    /// Number of globals the compositor advertised, known or not
    pub fn advertised(&self) -> usize {
        self.advertised
    }
}

/// What the caller wants the toplevel to look like
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRequest {
    pub title: String,
    pub app_id: String,
}

/// Compositor-originated events surfaced to the startup sequence.
///
/// Keep-alive pings never appear here: clients answer them inside the
/// dispatch call that received them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// `xdg_surface.configure`; must be acknowledged with the same serial
    SurfaceConfigure { serial: u32 },
    /// `xdg_toplevel.configure`; non-positive sizes mean "no preference"
    ToplevelConfigure { width: i32, height: i32 },
    /// `xdg_toplevel.close`
    CloseRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Process whatever is already queued, never block
    Pending,
    /// Block until at least one event arrives, or until `timeout` elapses
    Blocking { timeout: Option<Duration> },
}

/// Connection to the windowing service.
pub trait ProtocolClient {
    /// Native display handle the graphics driver binds to
    type Display: Copy + Send;
    /// Handle to the surface object a presentable surface is created from
    type Window;

    /// Establishes the compositor session.
    fn connect(&mut self) -> Result<Self::Display, StartupError>;

    /// Flushes a registry request and blocks until every advertised global
    /// has been received.
    fn enumerate_globals(&mut self) -> Result<Vec<AdvertisedGlobal>, StartupError>;

    /// Binds the proxies for a complete capability set.
    fn bind_capabilities(&mut self, capabilities: &CapabilitySet) -> Result<(), StartupError>;

    /// Creates surface, shell surface and toplevel role, sets the title and
    /// sends the initial commit.
    fn create_window(
        &mut self,
        capabilities: &CapabilitySet,
        request: &WindowRequest,
    ) -> Result<Self::Window, StartupError>;

    /// Acknowledges a surface configure, echoing its serial.
    fn ack_configure(&mut self, serial: u32) -> Result<(), StartupError>;

    /// Processes one batch of incoming events.
    fn dispatch(&mut self, mode: DispatchMode) -> Result<Vec<ProtocolEvent>, StartupError>;

    fn flush(&mut self) -> Result<(), StartupError>;

    /// Single discovery round-trip: enumerate, validate, bind.
    ///
    /// A missing required capability aborts before anything is bound.
    fn discover_capabilities(&mut self) -> Result<CapabilitySet, StartupError> {
        let globals = self.enumerate_globals()?;
        debug!("Registry advertised {} globals", globals.len());

        let capabilities = CapabilitySet::from_globals(&globals);
        capabilities.ensure_complete()?;
        self.bind_capabilities(&capabilities)?;

        info!(
            "Bound {} ({}) and {} ({})",
            Capability::SurfaceFactory,
            Capability::SurfaceFactory.interface(),
            Capability::Shell,
            Capability::Shell.interface()
        );
        Ok(capabilities)
    }
}
