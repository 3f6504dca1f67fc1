//! Configure/acknowledge handshake
//!
//! Surface state machine:
//!
//! ```text
//! Created --initial commit--> ConfigurePending --ack(serial)--> Configured
//!                                                   ^                |
//!                                                   +--- configure --+
//! ```
//!
//! Transitions are driven by compositor events; the client only ever
//! acknowledges. Presentation is legal from the first `Configured` onwards.
//! Later configures (resizes) are acknowledged without leaving `Configured`.

use std::fmt;

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::error::StartupError;
use crate::protocol::ProtocolEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SurfaceState {
    /// Surface objects exist, initial commit not yet sent
    Created,
    /// Initial commit sent, waiting for the first configure
    ConfigurePending,
    /// At least one configure acknowledged; presenting is allowed
    Configured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowGeometry {
    pub width: u32,
    pub height: u32,
}

impl WindowGeometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Applies a toplevel configure. Each axis is taken only when positive.
    pub fn apply_configure(&mut self, width: i32, height: i32) -> bool {
        let before = *self;
        if width > 0 {
            self.width = width as u32;
        }
        if height > 0 {
            self.height = height as u32;
        }
        *self != before
    }
}

impl Default for WindowGeometry {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl fmt::Display for WindowGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("surface must be in {expected:?} but is {actual:?}")]
    UnexpectedState {
        expected: SurfaceState,
        actual: SurfaceState,
    },

    #[error("acknowledging serial {serial} that the compositor never sent (pending: {pending:?})")]
    UnknownSerial { serial: u32, pending: Option<u32> },

    #[error("present attempted while surface is {state:?}")]
    PresentBeforeConfigure { state: SurfaceState },
}

/// Result of an acknowledgement request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The ack went out
    Sent,
    /// Serial was already acknowledged; nothing sent
    Duplicate,
}

/// Handshake counters reported at the end of startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NegotiationStats {
    pub configures_received: u32,
    pub acks_sent: u32,
    pub duplicates_ignored: u32,
    pub resizes: u32,
}

#[derive(Debug)]
pub struct SurfaceNegotiator {
    state: SurfaceState,
    geometry: WindowGeometry,
    pending_serial: Option<u32>,
    last_acked: Option<u32>,
    close_requested: bool,
    stats: NegotiationStats,
}

impl SurfaceNegotiator {
    pub fn new(initial: WindowGeometry) -> Self {
        Self {
            state: SurfaceState::Created,
            geometry: initial,
            pending_serial: None,
            last_acked: None,
            close_requested: false,
            stats: NegotiationStats::default(),
        }
    }

    pub fn state(&self) -> SurfaceState {
        self.state
    }

    pub fn geometry(&self) -> WindowGeometry {
        self.geometry
    }

    pub fn is_configured(&self) -> bool {
        self.state == SurfaceState::Configured
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    pub fn last_acked(&self) -> Option<u32> {
        self.last_acked
    }

    pub fn stats(&self) -> NegotiationStats {
        self.stats
    }

    /// The initial (bufferless) commit went out.
    pub fn surface_committed(&mut self) -> Result<(), NegotiationError> {
        if self.state != SurfaceState::Created {
            return Err(NegotiationError::UnexpectedState {
                expected: SurfaceState::Created,
                actual: self.state,
            });
        }
        self.transition(SurfaceState::ConfigurePending);
        Ok(())
    }

    /// Folds one compositor event into the negotiated state.
    ///
    /// Returns the serial to acknowledge for surface configures.
    pub fn handle_event(&mut self, event: &ProtocolEvent) -> Option<u32> {
        match *event {
            ProtocolEvent::ToplevelConfigure { width, height } => {
                if self.geometry.apply_configure(width, height) {
                    if self.is_configured() {
                        self.stats.resizes += 1;
                    }
                    debug!("Compositor requested geometry {}", self.geometry);
                } else {
                    debug!(
                        "Toplevel configure {}x{} leaves geometry at {}",
                        width, height, self.geometry
                    );
                }
                None
            }
            ProtocolEvent::SurfaceConfigure { serial } => {
                self.stats.configures_received += 1;
                self.pending_serial = Some(serial);
                Some(serial)
            }
            ProtocolEvent::CloseRequested => {
                info!("Compositor asked the toplevel to close");
                self.close_requested = true;
                None
            }
        }
    }

    /// Acknowledges `serial` through `send`, exactly once per serial.
    ///
    /// A serial equal to the last acknowledged one is ignored. A serial the
    /// compositor never sent is rejected before anything goes out. The first
    /// successful ack moves the surface to `Configured`.
    pub fn acknowledge<F>(&mut self, serial: u32, send: F) -> Result<AckOutcome, StartupError>
    where
        F: FnOnce(u32) -> Result<(), StartupError>,
    {
        if self.last_acked == Some(serial) && self.pending_serial != Some(serial) {
            debug!("Serial {} already acknowledged, ignoring", serial);
            self.stats.duplicates_ignored += 1;
            return Ok(AckOutcome::Duplicate);
        }
        if self.pending_serial != Some(serial) {
            warn!(
                "Refusing to acknowledge serial {} (pending: {:?})",
                serial, self.pending_serial
            );
            return Err(NegotiationError::UnknownSerial {
                serial,
                pending: self.pending_serial,
            }
            .into());
        }
        if self.state == SurfaceState::Created {
            return Err(NegotiationError::UnexpectedState {
                expected: SurfaceState::ConfigurePending,
                actual: self.state,
            }
            .into());
        }

        send(serial)?;
        self.pending_serial = None;
        self.last_acked = Some(serial);
        self.stats.acks_sent += 1;
        debug!("Acknowledged configure serial {}", serial);

        if self.state == SurfaceState::ConfigurePending {
            self.transition(SurfaceState::Configured);
            info!("Surface configured at {}", self.geometry);
        }
        Ok(AckOutcome::Sent)
    }

    /// Gate checked before every present.
    pub fn ensure_presentable(&self) -> Result<(), NegotiationError> {
        if self.is_configured() {
            Ok(())
        } else {
            Err(NegotiationError::PresentBeforeConfigure { state: self.state })
        }
    }

    fn transition(&mut self, next: SurfaceState) {
        if self.state != next {
            debug!("Surface state transition: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}
