//! Wayland implementation of the protocol client
//!
//! Uses `wayland-client` with the system backend so the `wl_display` pointer
//! can be handed to EGL. The registry round-trip goes through
//! `registry_queue_init`; blocking dispatch with a timeout is built from
//! `prepare_read` plus `poll(2)` on the connection fd.

use std::ffi::c_void;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::ptr::NonNull;
use std::time::Duration;

use log::{debug, trace};
use wayland_client::{
    backend::WaylandError,
    delegate_noop,
    globals::{registry_queue_init, GlobalList, GlobalListContents},
    protocol::{
        wl_compositor::WlCompositor,
        wl_registry::{self, WlRegistry},
        wl_surface::WlSurface,
    },
    Connection, Dispatch, EventQueue, QueueHandle,
};
use wayland_protocols::xdg::shell::client::{
    xdg_surface::{self, XdgSurface},
    xdg_toplevel::{self, XdgToplevel},
    xdg_wm_base::{self, XdgWmBase},
};

use super::{
    AdvertisedGlobal, Capability, CapabilitySet, DispatchMode, ProtocolClient, ProtocolEvent,
    WindowRequest,
};
use crate::error::{StartupError, StartupStep};

/// `wl_display*` of the live connection, handed to `eglGetPlatformDisplay`.
#[derive(Debug, Clone, Copy)]
pub struct WaylandDisplay(NonNull<c_void>);

// SAFETY: libwayland-client's wl_display is thread-safe, and the pointer is
// only ever passed to EGL which has its own locking.
unsafe impl Send for WaylandDisplay {}

impl WaylandDisplay {
    pub fn as_ptr(&self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// Event sink for the queue; callbacks only record, the caller decides.
#[derive(Debug, Default)]
struct WaylandState {
    events: Vec<ProtocolEvent>,
    pings_answered: u64,
}

pub struct WaylandClient {
    connection: Option<Connection>,
    queue: Option<EventQueue<WaylandState>>,
    globals: Option<GlobalList>,
    state: WaylandState,
    compositor: Option<WlCompositor>,
    wm_base: Option<XdgWmBase>,
    xdg_surface: Option<XdgSurface>,
    toplevel: Option<XdgToplevel>,
}

impl WaylandClient {
    pub fn new() -> Self {
        Self {
            connection: None,
            queue: None,
            globals: None,
            state: WaylandState::default(),
            compositor: None,
            wm_base: None,
            xdg_surface: None,
            toplevel: None,
        }
    }

    pub fn pings_answered(&self) -> u64 {
        self.state.pings_answered
    }

    fn connection(&self) -> Result<&Connection, StartupError> {
        self.connection
            .as_ref()
            .ok_or_else(|| StartupError::Connection("not connected".into()))
    }

    fn queue_handle(&self) -> Result<QueueHandle<WaylandState>, StartupError> {
        self.queue
            .as_ref()
            .map(|q| q.handle())
            .ok_or(StartupError::CapabilitiesNotBound)
    }

    /// Reads whatever the socket has within `timeout` into the queue.
    fn read_events(&mut self, timeout: Option<Duration>) -> Result<(), StartupError> {
        let queue = self
            .queue
            .as_mut()
            .ok_or(StartupError::CapabilitiesNotBound)?;
        queue.flush().map_err(dispatch_error)?;

        // None means events are already queued and can be dispatched directly.
        let Some(guard) = queue.prepare_read() else {
            return Ok(());
        };
        let fd = guard.connection_fd().as_raw_fd();
        if poll_readable(fd, timeout)? {
            match guard.read() {
                Ok(count) => trace!("Read {} wayland events", count),
                Err(WaylandError::Io(err)) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(dispatch_error(err)),
            }
        }
        Ok(())
    }

    fn dispatch_pending(&mut self) -> Result<(), StartupError> {
        let queue = self
            .queue
            .as_mut()
            .ok_or(StartupError::CapabilitiesNotBound)?;
        queue.dispatch_pending(&mut self.state).map_err(|e| {
            StartupError::dispatch(StartupStep::NegotiateConfigure, e.to_string())
        })?;
        Ok(())
    }
}

impl Default for WaylandClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolClient for WaylandClient {
    type Display = WaylandDisplay;
    type Window = WlSurface;

    fn connect(&mut self) -> Result<WaylandDisplay, StartupError> {
        let connection =
            Connection::connect_to_env().map_err(|e| StartupError::Connection(e.to_string()))?;
        let display = NonNull::new(connection.backend().display_ptr() as *mut c_void)
            .ok_or_else(|| StartupError::Connection("null wl_display".into()))?;
        debug!("Connected to Wayland compositor");
        self.connection = Some(connection);
        Ok(WaylandDisplay(display))
    }

    fn enumerate_globals(&mut self) -> Result<Vec<AdvertisedGlobal>, StartupError> {
        let (globals, queue) = registry_queue_init::<WaylandState>(self.connection()?)
            .map_err(|e| {
                StartupError::dispatch(
                    StartupStep::DiscoverCapabilities,
                    format!("registry round-trip: {}", e),
                )
            })?;

        let advertised = globals.contents().with_list(|list| {
            list.iter()
                .map(|g| AdvertisedGlobal::new(g.name, &g.interface, g.version))
                .collect::<Vec<_>>()
        });
        self.globals = Some(globals);
        self.queue = Some(queue);
        Ok(advertised)
    }

    fn bind_capabilities(&mut self, capabilities: &CapabilitySet) -> Result<(), StartupError> {
        capabilities.ensure_complete()?;
        let qh = self.queue_handle()?;
        let registry = self
            .globals
            .as_ref()
            .map(|g| g.registry().clone())
            .ok_or_else(|| {
                StartupError::dispatch(
                    StartupStep::DiscoverCapabilities,
                    "registry round-trip has not run",
                )
            })?;

        for capability in Capability::REQUIRED {
            let Some(binding) = capabilities.get(capability) else {
                continue;
            };
            match capability {
                Capability::SurfaceFactory => {
                    self.compositor = Some(registry.bind::<WlCompositor, _, _>(
                        binding.global_name,
                        binding.version,
                        &qh,
                        (),
                    ));
                }
                Capability::Shell => {
                    self.wm_base = Some(registry.bind::<XdgWmBase, _, _>(
                        binding.global_name,
                        binding.version,
                        &qh,
                        (),
                    ));
                }
            }
        }
        Ok(())
    }

    fn create_window(
        &mut self,
        capabilities: &CapabilitySet,
        request: &WindowRequest,
    ) -> Result<WlSurface, StartupError> {
        capabilities.ensure_complete()?;
        let (Some(compositor), Some(wm_base)) = (&self.compositor, &self.wm_base) else {
            return Err(StartupError::CapabilitiesNotBound);
        };
        let qh = self.queue_handle()?;

        let surface = compositor.create_surface(&qh, ());
        let xdg_surface = wm_base.get_xdg_surface(&surface, &qh, ());
        let toplevel = xdg_surface.get_toplevel(&qh, ());
        toplevel.set_title(request.title.clone());
        toplevel.set_app_id(request.app_id.clone());

        // Initial commit without a buffer asks the compositor for a configure.
        surface.commit();
        self.xdg_surface = Some(xdg_surface);
        self.toplevel = Some(toplevel);
        self.flush().map_err(|e| e.during(StartupStep::CreateSurface))?;
        Ok(surface)
    }

    fn ack_configure(&mut self, serial: u32) -> Result<(), StartupError> {
        let xdg_surface = self
            .xdg_surface
            .as_ref()
            .ok_or_else(|| {
                StartupError::dispatch(
                    StartupStep::NegotiateConfigure,
                    "ack_configure without xdg_surface",
                )
            })?;
        xdg_surface.ack_configure(serial);
        Ok(())
    }

    fn dispatch(&mut self, mode: DispatchMode) -> Result<Vec<ProtocolEvent>, StartupError> {
        self.dispatch_pending()?;
        if self.state.events.is_empty() {
            let timeout = match mode {
                DispatchMode::Pending => Some(Duration::ZERO),
                DispatchMode::Blocking { timeout } => timeout,
            };
            self.read_events(timeout)?;
            self.dispatch_pending()?;
        }
        // Pongs queued by the ping handler leave within this same call.
        self.flush()?;
        Ok(std::mem::take(&mut self.state.events))
    }

    fn flush(&mut self) -> Result<(), StartupError> {
        self.connection()?.flush().map_err(dispatch_error)
    }
}

fn dispatch_error(err: WaylandError) -> StartupError {
    StartupError::dispatch(StartupStep::NegotiateConfigure, err.to_string())
}

/// Waits for the fd to become readable. `None` waits indefinitely.
fn poll_readable(fd: RawFd, timeout: Option<Duration>) -> Result<bool, StartupError> {
    let timeout_ms = match timeout {
        // Round up so a sub-millisecond remainder still blocks.
        Some(t) => t.as_micros().div_ceil(1000).min(libc::c_int::MAX as u128) as libc::c_int,
        None => -1,
    };
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(StartupError::dispatch(
                StartupStep::NegotiateConfigure,
                format!("poll: {}", err),
            ));
        }
        return Ok(ret > 0 && pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0);
    }
}

impl Dispatch<WlRegistry, GlobalListContents> for WaylandState {
    fn event(
        _state: &mut Self,
        _registry: &WlRegistry,
        _event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        // Globals appearing after startup are irrelevant to a single window.
    }
}

impl Dispatch<XdgWmBase, ()> for WaylandState {
    fn event(
        state: &mut Self,
        wm_base: &XdgWmBase,
        event: xdg_wm_base::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            trace!("Ping {} from compositor", serial);
            wm_base.pong(serial);
            state.pings_answered += 1;
        }
    }
}

impl Dispatch<XdgSurface, ()> for WaylandState {
    fn event(
        state: &mut Self,
        _xdg_surface: &XdgSurface,
        event: xdg_surface::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_surface::Event::Configure { serial } = event {
            state.events.push(ProtocolEvent::SurfaceConfigure { serial });
        }
    }
}

impl Dispatch<XdgToplevel, ()> for WaylandState {
    fn event(
        state: &mut Self,
        _toplevel: &XdgToplevel,
        event: xdg_toplevel::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            xdg_toplevel::Event::Configure { width, height, .. } => {
                state
                    .events
                    .push(ProtocolEvent::ToplevelConfigure { width, height });
            }
            xdg_toplevel::Event::Close => state.events.push(ProtocolEvent::CloseRequested),
            _ => {}
        }
    }
}

delegate_noop!(WaylandState: WlCompositor);
delegate_noop!(WaylandState: ignore WlSurface);
