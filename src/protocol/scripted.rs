//! In-process compositor simulation
//!
//! `ScriptedCompositor` plays the compositor side of the handshake from a
//! script of event batches. It records every request the client makes and
//! validates them the way a strict compositor would:
//!
//! - surface objects may only be created after both capabilities are bound
//! - `ack_configure` must echo a serial that was actually sent
//! - a buffer may not be committed before the first configure was acked
//!
//! Violations are recorded rather than raised so tests can assert on them.
//! The headless mode of the binary runs against this same simulation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::Mutex;

use super::{
    AdvertisedGlobal, Capability, CapabilitySet, DispatchMode, ProtocolClient, ProtocolEvent,
    WindowRequest,
};
use crate::error::{StartupError, StartupStep};

/// Something the compositor sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// Liveness check, answered with a pong carrying the same serial
    Ping(u32),
    Protocol(ProtocolEvent),
}

impl From<ProtocolEvent> for ServerEvent {
    fn from(event: ProtocolEvent) -> Self {
        ServerEvent::Protocol(event)
    }
}

/// Requests observed by the compositor, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    GetRegistry,
    Bind { capability: Capability, version: u32 },
    CreateSurface,
    GetXdgSurface,
    GetToplevel,
    SetTitle(String),
    SetAppId(String),
    AckConfigure(u32),
    Pong(u32),
    /// `wl_surface.commit`, with or without a newly attached buffer
    Commit { with_buffer: bool },
    Flush,
}

/// Client behaviour a strict compositor would punish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    SurfaceWithoutCapabilities,
    UnknownAckSerial { serial: u32, sent: Vec<u32> },
    DuplicateAck { serial: u32 },
    BufferBeforeAck,
}

#[derive(Debug, Default)]
struct ServerState {
    requests: Vec<Request>,
    violations: Vec<Violation>,
    sent_serials: Vec<u32>,
    acked_serials: Vec<u32>,
    buffers_committed: u64,
}

impl ServerState {
    fn record(&mut self, request: Request) {
        trace!("compositor <- {:?}", request);
        self.requests.push(request);
    }

    fn violation(&mut self, violation: Violation) {
        warn!("Scripted compositor saw protocol violation: {:?}", violation);
        self.violations.push(violation);
    }

    fn commit(&mut self, with_buffer: bool) {
        self.record(Request::Commit { with_buffer });
        if with_buffer {
            if self.acked_serials.is_empty() {
                self.violation(Violation::BufferBeforeAck);
            }
            self.buffers_committed += 1;
        }
    }
}

/// Native display handle of the simulated connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptedDisplay {
    pub connection_id: u32,
}

/// Toplevel surface living in the simulated compositor.
///
/// Graphics code commits buffers through it, which is how the compositor
/// observes presentation.
#[derive(Debug, Clone)]
pub struct ScriptedWindow {
    surface_id: u32,
    server: Arc<Mutex<ServerState>>,
}

impl ScriptedWindow {
    pub fn surface_id(&self) -> u32 {
        self.surface_id
    }

    /// Attach + commit of a rendered buffer
    pub fn commit_buffer(&self) {
        self.server.lock().commit(true);
    }
}

pub struct ScriptedCompositor {
    reachable: bool,
    globals: Vec<AdvertisedGlobal>,
    script: VecDeque<Vec<ServerEvent>>,
    roundtrip_latency: Duration,
    registry_broken: bool,
    flushes_before_hangup: Option<usize>,
    connected: bool,
    bound: bool,
    window: Option<ScriptedWindow>,
    server: Arc<Mutex<ServerState>>,
}

impl ScriptedCompositor {
    /// A compositor advertising the usual desktop globals and an empty script.
    pub fn new() -> Self {
        Self {
            reachable: true,
            globals: vec![
                AdvertisedGlobal::new(1, "wl_compositor", 6),
                AdvertisedGlobal::new(2, "wl_subcompositor", 1),
                AdvertisedGlobal::new(3, "wl_shm", 1),
                AdvertisedGlobal::new(4, "xdg_wm_base", 6),
                AdvertisedGlobal::new(5, "wl_seat", 9),
                AdvertisedGlobal::new(6, "wl_output", 4),
            ],
            script: VecDeque::new(),
            roundtrip_latency: Duration::ZERO,
            registry_broken: false,
            flushes_before_hangup: None,
            connected: false,
            bound: false,
            window: None,
            server: Arc::new(Mutex::new(ServerState::default())),
        }
    }

    /// Compositor that proposes `width`x`height` and sends the surface
    /// configure with `serial` in the first batch after the window exists.
    pub fn well_behaved(width: i32, height: i32, serial: u32) -> Self {
        Self::new().with_batch(vec![
            ProtocolEvent::ToplevelConfigure { width, height }.into(),
            ProtocolEvent::SurfaceConfigure { serial }.into(),
        ])
    }

    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::new()
        }
    }

    /// Drops every advertised global that provides `capability`.
    pub fn without(mut self, capability: Capability) -> Self {
        self.globals.retain(|g| g.interface != capability.interface());
        self
    }

    /// Replaces the advertised globals.
    pub fn with_globals(mut self, globals: Vec<AdvertisedGlobal>) -> Self {
        self.globals = globals;
        self
    }

    /// Appends one dispatch batch to the script. An empty batch models a
    /// dispatch call that finds nothing queued.
    pub fn with_batch(mut self, batch: Vec<ServerEvent>) -> Self {
        self.script.push_back(batch);
        self
    }

    /// Simulated cost of the discovery round-trip
    pub fn with_roundtrip_latency(mut self, latency: Duration) -> Self {
        self.roundtrip_latency = latency;
        self
    }

    /// The connection drops while the registry round-trip is in flight.
    pub fn with_broken_registry(mut self) -> Self {
        self.registry_broken = true;
        self
    }

    /// The connection drops after `flushes` successful flushes.
    pub fn with_hangup_after_flushes(mut self, flushes: usize) -> Self {
        self.flushes_before_hangup = Some(flushes);
        self
    }

    pub fn requests(&self) -> Vec<Request> {
        self.server.lock().requests.clone()
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.server.lock().violations.clone()
    }

    pub fn acked_serials(&self) -> Vec<u32> {
        self.server.lock().acked_serials.clone()
    }

    pub fn pongs(&self) -> Vec<u32> {
        self.server
            .lock()
            .requests
            .iter()
            .filter_map(|r| match r {
                Request::Pong(serial) => Some(*serial),
                _ => None,
            })
            .collect()
    }

    pub fn buffers_committed(&self) -> u64 {
        self.server.lock().buffers_committed
    }

    pub fn window_created(&self) -> bool {
        self.window.is_some()
    }

    fn ensure_connected(&self) -> Result<(), StartupError> {
        if self.connected {
            Ok(())
        } else {
            Err(StartupError::Connection("not connected".into()))
        }
    }

    /// Delivers one scripted batch: pings are answered here, everything else
    /// is handed back to the caller.
    fn deliver(&mut self, batch: Vec<ServerEvent>) -> Vec<ProtocolEvent> {
        let mut server = self.server.lock();
        let mut events = Vec::with_capacity(batch.len());
        for event in batch {
            match event {
                ServerEvent::Ping(serial) => {
                    debug!("Answering compositor ping {}", serial);
                    server.record(Request::Pong(serial));
                }
                ServerEvent::Protocol(event) => {
                    if let ProtocolEvent::SurfaceConfigure { serial } = event {
                        server.sent_serials.push(serial);
                    }
                    events.push(event);
                }
            }
        }
        events
    }
}

impl Default for ScriptedCompositor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolClient for ScriptedCompositor {
    type Display = ScriptedDisplay;
    type Window = ScriptedWindow;

    fn connect(&mut self) -> Result<ScriptedDisplay, StartupError> {
        if !self.reachable {
            return Err(StartupError::Connection(
                "scripted compositor refuses connections".into(),
            ));
        }
        self.connected = true;
        Ok(ScriptedDisplay { connection_id: 1 })
    }

    fn enumerate_globals(&mut self) -> Result<Vec<AdvertisedGlobal>, StartupError> {
        self.ensure_connected()?;
        self.server.lock().record(Request::GetRegistry);
        if !self.roundtrip_latency.is_zero() {
            std::thread::sleep(self.roundtrip_latency);
        }
        if self.registry_broken {
            return Err(StartupError::dispatch(
                StartupStep::DiscoverCapabilities,
                "registry round-trip: connection reset by compositor",
            ));
        }
        Ok(self.globals.clone())
    }

    fn bind_capabilities(&mut self, capabilities: &CapabilitySet) -> Result<(), StartupError> {
        capabilities.ensure_complete()?;
        let mut server = self.server.lock();
        for capability in Capability::REQUIRED {
            if let Some(binding) = capabilities.get(capability) {
                server.record(Request::Bind {
                    capability,
                    version: binding.version,
                });
            }
        }
        self.bound = true;
        Ok(())
    }

    fn create_window(
        &mut self,
        capabilities: &CapabilitySet,
        request: &WindowRequest,
    ) -> Result<ScriptedWindow, StartupError> {
        self.ensure_connected()?;
        let ready = match capabilities.ensure_complete() {
            Ok(()) if self.bound => Ok(()),
            Ok(()) => Err(StartupError::CapabilitiesNotBound),
            Err(e) => Err(e),
        };
        if let Err(e) = ready {
            self.server.lock().violation(Violation::SurfaceWithoutCapabilities);
            return Err(e);
        }

        {
            let mut server = self.server.lock();
            server.record(Request::CreateSurface);
            server.record(Request::GetXdgSurface);
            server.record(Request::GetToplevel);
            server.record(Request::SetTitle(request.title.clone()));
            server.record(Request::SetAppId(request.app_id.clone()));
            server.commit(false);
            server.record(Request::Flush);
        }

        let window = ScriptedWindow {
            surface_id: 1,
            server: Arc::clone(&self.server),
        };
        self.window = Some(window.clone());
        Ok(window)
    }

    fn ack_configure(&mut self, serial: u32) -> Result<(), StartupError> {
        self.ensure_connected()?;
        let mut server = self.server.lock();
        server.record(Request::AckConfigure(serial));
        if !server.sent_serials.contains(&serial) {
            let sent = server.sent_serials.clone();
            server.violation(Violation::UnknownAckSerial { serial, sent });
        } else if server.acked_serials.contains(&serial) {
            server.violation(Violation::DuplicateAck { serial });
        } else {
            server.acked_serials.push(serial);
        }
        Ok(())
    }

    fn dispatch(&mut self, mode: DispatchMode) -> Result<Vec<ProtocolEvent>, StartupError> {
        self.ensure_connected()?;
        match self.script.pop_front() {
            Some(batch) => Ok(self.deliver(batch)),
            None => match mode {
                DispatchMode::Pending => Ok(Vec::new()),
                DispatchMode::Blocking {
                    timeout: Some(timeout),
                } => {
                    // A silent compositor: the blocking read times out.
                    std::thread::sleep(timeout);
                    Ok(Vec::new())
                }
                DispatchMode::Blocking { timeout: None } => Err(StartupError::dispatch(
                    StartupStep::NegotiateConfigure,
                    "compositor closed the connection with the script exhausted",
                )),
            },
        }
    }

    fn flush(&mut self) -> Result<(), StartupError> {
        self.ensure_connected()?;
        match self.flushes_before_hangup {
            Some(0) => {
                return Err(StartupError::dispatch(
                    StartupStep::NegotiateConfigure,
                    "broken pipe",
                ))
            }
            Some(ref mut remaining) => *remaining -= 1,
            None => {}
        }
        self.server.lock().record(Request::Flush);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> WindowRequest {
        WindowRequest {
            title: "instant".into(),
            app_id: "swiftpane".into(),
        }
    }

    #[test]
    fn test_pings_are_answered_in_the_same_dispatch() {
        let mut compositor = ScriptedCompositor::new().with_batch(vec![
            ServerEvent::Ping(41),
            ProtocolEvent::CloseRequested.into(),
            ServerEvent::Ping(42),
        ]);
        compositor.connect().unwrap();

        let events = compositor.dispatch(DispatchMode::Pending).unwrap();
        assert_eq!(events, vec![ProtocolEvent::CloseRequested]);
        assert_eq!(compositor.pongs(), vec![41, 42]);
    }

    #[test]
    fn test_window_requires_bound_capabilities() {
        let mut compositor = ScriptedCompositor::new();
        compositor.connect().unwrap();
        let empty = CapabilitySet::default();

        assert!(compositor.create_window(&empty, &request()).is_err());
        assert_eq!(
            compositor.violations(),
            vec![Violation::SurfaceWithoutCapabilities]
        );
        assert!(!compositor.window_created());
    }

    #[test]
    fn test_window_before_binding_is_not_a_missing_capability() {
        let mut compositor = ScriptedCompositor::new();
        compositor.connect().unwrap();
        let globals = compositor.enumerate_globals().unwrap();
        let caps = CapabilitySet::from_globals(&globals);

        let err = compositor.create_window(&caps, &request()).unwrap_err();
        assert!(matches!(err, StartupError::CapabilitiesNotBound));
        assert_eq!(err.step(), StartupStep::CreateSurface);
        assert!(!compositor.window_created());
    }

    #[test]
    fn test_broken_registry_fails_discovery() {
        let mut compositor = ScriptedCompositor::new().with_broken_registry();
        compositor.connect().unwrap();

        let err = compositor.discover_capabilities().unwrap_err();
        assert_eq!(err.step(), StartupStep::DiscoverCapabilities);
        assert!(!compositor
            .requests()
            .iter()
            .any(|r| matches!(r, Request::Bind { .. })));
    }

    #[test]
    fn test_ack_of_unsent_serial_is_a_violation() {
        let mut compositor = ScriptedCompositor::well_behaved(800, 600, 7);
        compositor.connect().unwrap();
        compositor.dispatch(DispatchMode::Pending).unwrap();

        compositor.ack_configure(8).unwrap();
        assert!(matches!(
            compositor.violations()[0],
            Violation::UnknownAckSerial { serial: 8, .. }
        ));
    }

    #[test]
    fn test_buffer_commit_before_ack_is_a_violation() {
        let mut compositor = ScriptedCompositor::well_behaved(800, 600, 7);
        compositor.connect().unwrap();
        let caps = compositor.discover_capabilities().unwrap();
        let window = compositor.create_window(&caps, &request()).unwrap();

        window.commit_buffer();
        assert_eq!(compositor.violations(), vec![Violation::BufferBeforeAck]);
    }

    #[test]
    fn test_exhausted_script_times_out_when_bounded() {
        let mut compositor = ScriptedCompositor::new();
        compositor.connect().unwrap();

        let events = compositor
            .dispatch(DispatchMode::Blocking {
                timeout: Some(Duration::from_millis(1)),
            })
            .unwrap();
        assert!(events.is_empty());
        assert!(compositor
            .dispatch(DispatchMode::Blocking { timeout: None })
            .is_err());
    }

    #[test]
    fn test_requests_before_connect_fail() {
        let mut compositor = ScriptedCompositor::new();
        assert!(matches!(
            compositor.enumerate_globals(),
            Err(StartupError::Connection(_))
        ));
    }
}
