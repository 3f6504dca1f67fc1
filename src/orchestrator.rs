//! Startup sequencing
//!
//! ```text
//! Connecting -> WarmingUp -> CreatingSurface -> Negotiating -> Binding
//!            -> FirstFrame -> Presenting -> Finished
//! ```
//!
//! `WarmingUp` is where the two independent bring-up paths run. With
//! [`InitStrategy::Overlapped`] the driver and a surfaceless context are
//! created on a scoped worker thread while this thread performs capability
//! discovery; the phase ends when both are done. Nothing after it runs
//! until the compositor's first configure has been acknowledged.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{StartupError, StartupStep};
use crate::graphics::{ClearColor, GraphicsContext, GraphicsContextFactory};
use crate::negotiator::{NegotiationStats, SurfaceNegotiator, WindowGeometry};
use crate::pacing::{FramePacer, FrameStats};
use crate::presentation::PresentationLoop;
use crate::protocol::{CapabilitySet, DispatchMode, ProtocolClient, WindowRequest};
use crate::timeline::{Milestone, StartupTimeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPhase {
    Connecting,
    WarmingUp,
    CreatingSurface,
    Negotiating,
    Binding,
    FirstFrame,
    Presenting,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InitStrategy {
    /// Driver and context on a worker thread, discovery on this one
    #[default]
    Overlapped,
    /// Driver init, then discovery, then context creation, one thread
    Sequential,
}

#[derive(Debug, Clone)]
pub struct StartupOptions {
    pub window: WindowRequest,
    /// Used until the compositor proposes a size
    pub initial_geometry: WindowGeometry,
    pub strategy: InitStrategy,
    /// `None` waits for the first configure indefinitely
    pub configure_timeout: Option<Duration>,
    /// Frames presented by the fixed-rate loop after the first frame
    pub frame_count: u64,
    pub frame_interval: Duration,
    pub clear_color: ClearColor,
    pub present_retry_limit: u32,
}

impl Default for StartupOptions {
    fn default() -> Self {
        Self {
            window: WindowRequest {
                title: "swiftpane".into(),
                app_id: "org.swiftpane.Swiftpane".into(),
            },
            initial_geometry: WindowGeometry::default(),
            strategy: InitStrategy::default(),
            configure_timeout: Some(Duration::from_millis(5000)),
            frame_count: 0,
            frame_interval: Duration::from_millis(16),
            clear_color: ClearColor::default(),
            present_retry_limit: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    pub strategy: InitStrategy,
    pub geometry: WindowGeometry,
    pub context_valid: bool,
    /// Whether the first frame reached the compositor
    pub first_frame_presented: bool,
    /// All presents, the first frame included
    pub frames_presented: u64,
    /// Cycles run by the fixed-rate loop
    pub loop_cycles: u64,
    pub frames_skipped: u64,
    pub closed_by_compositor: bool,
    pub negotiation: NegotiationStats,
    pub frame_stats: FrameStats,
    pub timeline: StartupTimeline,
}

pub struct StartupOrchestrator {
    options: StartupOptions,
    phase: StartupPhase,
    timeline: StartupTimeline,
}

impl StartupOrchestrator {
    pub fn new(options: StartupOptions) -> Self {
        Self::with_timeline(options, StartupTimeline::new())
    }

    /// Measures milestones against an existing timeline, normally one
    /// started at the top of `main`.
    pub fn with_timeline(options: StartupOptions, timeline: StartupTimeline) -> Self {
        Self {
            options,
            phase: StartupPhase::Connecting,
            timeline,
        }
    }

    pub fn phase(&self) -> StartupPhase {
        self.phase
    }

    pub fn timeline(&self) -> &StartupTimeline {
        &self.timeline
    }

    /// Runs the whole startup sequence and the fixed-rate loop.
    ///
    /// Any setup failure aborts immediately; the error names the step.
    pub fn run<P, G>(&mut self, client: &mut P, factory: &G) -> Result<StartupReport, StartupError>
    where
        P: ProtocolClient,
        G: GraphicsContextFactory<Display = P::Display> + Sync,
        G::Context: GraphicsContext<Window = P::Window>,
    {
        let strategy = self.options.strategy;

        self.enter(StartupPhase::Connecting);
        let display = client.connect()?;
        self.timeline.mark(Milestone::Connected);

        self.enter(StartupPhase::WarmingUp);
        let (capabilities, mut context) = match strategy {
            InitStrategy::Overlapped => self.warm_up_overlapped(client, factory, display)?,
            InitStrategy::Sequential => self.warm_up_sequential(client, factory, display)?,
        };
        let context_valid = context.is_valid();
        if !context_valid {
            return Err(StartupError::ContextCreation(
                "driver returned an invalid context".into(),
            ));
        }

        self.enter(StartupPhase::CreatingSurface);
        let window = client
            .create_window(&capabilities, &self.options.window)
            .map_err(|e| e.during(StartupStep::CreateSurface))?;
        self.timeline.mark(Milestone::WindowCreated);
        let mut negotiator = SurfaceNegotiator::new(self.options.initial_geometry);
        negotiator.surface_committed()?;

        self.enter(StartupPhase::Negotiating);
        self.await_configure(client, &mut negotiator)?;
        if negotiator.close_requested() && !negotiator.is_configured() {
            warn!("Compositor closed the window before configuring it");
            self.enter(StartupPhase::Finished);
            self.timeline.mark(Milestone::Finished);
            return Ok(StartupReport {
                strategy,
                geometry: negotiator.geometry(),
                context_valid,
                first_frame_presented: false,
                frames_presented: 0,
                loop_cycles: 0,
                frames_skipped: 0,
                closed_by_compositor: true,
                negotiation: negotiator.stats(),
                frame_stats: FrameStats::default(),
                timeline: self.timeline.clone(),
            });
        }
        self.timeline.mark(Milestone::Configured);

        self.enter(StartupPhase::Binding);
        let mut presentation = PresentationLoop::bind_surface(
            &mut context,
            &window,
            &negotiator,
            self.options.clear_color,
            self.options.present_retry_limit,
        )?;
        self.timeline.mark(Milestone::SurfaceBound);

        self.enter(StartupPhase::FirstFrame);
        presentation.render_frame()?;
        presentation.present(&negotiator)?;
        client.flush().map_err(|e| e.during(StartupStep::Present))?;
        self.timeline.mark(Milestone::FirstFrame);
        if let Some(ttfp) = self.timeline.time_to_first_pixel() {
            info!(
                "First frame presented at {} after {:.3}ms",
                negotiator.geometry(),
                ttfp.as_secs_f64() * 1000.0
            );
        }

        self.enter(StartupPhase::Presenting);
        let mut pacer = FramePacer::new(self.options.frame_interval);
        let summary = presentation.run_fixed_rate(
            &mut pacer,
            self.options.frame_count,
            &mut negotiator,
            |negotiator| {
                pump_events(client, negotiator, DispatchMode::Pending)
                    .and_then(|_| client.flush())
                    .map_err(|e| e.during(StartupStep::Present))
            },
        )?;

        self.enter(StartupPhase::Finished);
        self.timeline.mark(Milestone::Finished);

        Ok(StartupReport {
            strategy,
            geometry: negotiator.geometry(),
            context_valid,
            first_frame_presented: true,
            frames_presented: presentation.frames_presented(),
            loop_cycles: summary.cycles,
            frames_skipped: summary.frames_skipped,
            closed_by_compositor: summary.closed_by_compositor,
            negotiation: negotiator.stats(),
            frame_stats: summary.frame_stats,
            timeline: self.timeline.clone(),
        })
    }

    fn warm_up_overlapped<P, G>(
        &mut self,
        client: &mut P,
        factory: &G,
        display: P::Display,
    ) -> Result<(CapabilitySet, G::Context), StartupError>
    where
        P: ProtocolClient,
        G: GraphicsContextFactory<Display = P::Display> + Sync,
    {
        let (discovery, graphics, discovered_at) = thread::scope(|scope| {
            let worker = thread::Builder::new()
                .name("swiftpane-gfx".into())
                .spawn_scoped(scope, move || {
                    let driver = factory.init_driver(display)?;
                    let driver_ready = Instant::now();
                    let context = factory.create_context(driver)?;
                    Ok::<_, StartupError>((context, driver_ready, Instant::now()))
                });

            let discovery = client
                .discover_capabilities()
                .map_err(|e| e.during(StartupStep::DiscoverCapabilities));
            let discovered_at = Instant::now();

            let graphics = match worker {
                Ok(handle) => handle.join().unwrap_or_else(|_| {
                    Err(StartupError::DriverInit("graphics worker panicked".into()))
                }),
                Err(e) => Err(StartupError::DriverInit(format!(
                    "cannot spawn graphics worker: {}",
                    e
                ))),
            };
            (discovery, graphics, discovered_at)
        });

        // Report failures in the order the steps begin.
        match (graphics, discovery) {
            (Err(e), _) if e.step() == StartupStep::InitDriver => Err(e),
            (_, Err(e)) => Err(e),
            (Err(e), Ok(_)) => Err(e),
            (Ok((context, driver_ready, context_ready)), Ok(capabilities)) => {
                self.timeline.mark_at(Milestone::CapabilitiesBound, discovered_at);
                self.timeline.mark_at(Milestone::DriverReady, driver_ready);
                self.timeline.mark_at(Milestone::ContextReady, context_ready);
                Ok((capabilities, context))
            }
        }
    }

    fn warm_up_sequential<P, G>(
        &mut self,
        client: &mut P,
        factory: &G,
        display: P::Display,
    ) -> Result<(CapabilitySet, G::Context), StartupError>
    where
        P: ProtocolClient,
        G: GraphicsContextFactory<Display = P::Display>,
    {
        let driver = factory.init_driver(display)?;
        self.timeline.mark(Milestone::DriverReady);
        let capabilities = client
            .discover_capabilities()
            .map_err(|e| e.during(StartupStep::DiscoverCapabilities))?;
        self.timeline.mark(Milestone::CapabilitiesBound);
        let context = factory.create_context(driver)?;
        self.timeline.mark(Milestone::ContextReady);
        Ok((capabilities, context))
    }

    /// Blocks on the compositor until the first configure is acknowledged,
    /// the window is closed, or the configure timeout runs out.
    fn await_configure<P: ProtocolClient>(
        &mut self,
        client: &mut P,
        negotiator: &mut SurfaceNegotiator,
    ) -> Result<(), StartupError> {
        let started = Instant::now();
        let deadline = self.options.configure_timeout.map(|t| started + t);

        while !negotiator.is_configured() && !negotiator.close_requested() {
            let timeout = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(StartupError::ConfigureTimeout {
                            waited: now - started,
                        });
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            let handled = pump_events(client, negotiator, DispatchMode::Blocking { timeout })?;
            if handled == 0 {
                debug!("Configure wait woke without events");
            }
        }
        Ok(())
    }

    fn enter(&mut self, phase: StartupPhase) {
        if self.phase != phase {
            info!("Startup phase: {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
    }
}

/// Dispatches one batch into the negotiator, acknowledging every surface
/// configure as it is seen. Returns the number of events handled.
fn pump_events<P: ProtocolClient>(
    client: &mut P,
    negotiator: &mut SurfaceNegotiator,
    mode: DispatchMode,
) -> Result<usize, StartupError> {
    let events = client.dispatch(mode)?;
    for event in &events {
        if let Some(serial) = negotiator.handle_event(event) {
            negotiator.acknowledge(serial, |serial| client.ack_configure(serial))?;
        }
    }
    Ok(events.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphics::SoftwareFactory;
    use crate::protocol::scripted::ServerEvent;
    use crate::protocol::{ProtocolEvent, Request, ScriptedCompositor};

    fn options() -> StartupOptions {
        StartupOptions {
            frame_count: 3,
            frame_interval: Duration::ZERO,
            configure_timeout: Some(Duration::from_millis(200)),
            ..StartupOptions::default()
        }
    }

    #[test]
    fn test_phases_end_in_finished() {
        let mut compositor = ScriptedCompositor::well_behaved(800, 600, 7);
        let mut orchestrator = StartupOrchestrator::new(options());
        assert_eq!(orchestrator.phase(), StartupPhase::Connecting);

        let report = orchestrator
            .run(&mut compositor, &SoftwareFactory::new())
            .unwrap();

        assert_eq!(orchestrator.phase(), StartupPhase::Finished);
        assert_eq!(report.geometry, WindowGeometry::new(800, 600));
        assert_eq!(report.frames_presented, 4);
        assert_eq!(report.loop_cycles, 3);
        assert!(report.timeline.time_to_first_pixel().is_some());
    }

    #[test]
    fn test_failure_leaves_phase_at_failing_step() {
        let mut compositor = ScriptedCompositor::new().with_batch(vec![]);
        let mut orchestrator = StartupOrchestrator::new(StartupOptions {
            configure_timeout: Some(Duration::from_millis(20)),
            ..options()
        });

        let err = orchestrator
            .run(&mut compositor, &SoftwareFactory::new())
            .unwrap_err();
        assert!(matches!(err, StartupError::ConfigureTimeout { .. }));
        assert_eq!(orchestrator.phase(), StartupPhase::Negotiating);
    }

    #[test]
    fn test_close_before_configure_finishes_without_presenting() {
        let mut compositor = ScriptedCompositor::new()
            .with_batch(vec![ProtocolEvent::CloseRequested.into()]);
        let mut orchestrator = StartupOrchestrator::new(options());

        let report = orchestrator
            .run(&mut compositor, &SoftwareFactory::new())
            .unwrap();
        assert!(report.closed_by_compositor);
        assert!(!report.first_frame_presented);
        assert_eq!(compositor.buffers_committed(), 0);
    }

    #[test]
    fn test_resize_during_loop_is_acked_before_next_commit() {
        let mut compositor = ScriptedCompositor::well_behaved(640, 480, 1).with_batch(vec![
            ServerEvent::Ping(40),
            ProtocolEvent::ToplevelConfigure {
                width: 1024,
                height: 768,
            }
            .into(),
            ProtocolEvent::SurfaceConfigure { serial: 2 }.into(),
        ]);
        let mut orchestrator = StartupOrchestrator::new(options());

        let report = orchestrator
            .run(&mut compositor, &SoftwareFactory::new())
            .unwrap();

        assert_eq!(report.geometry, WindowGeometry::new(1024, 768));
        assert_eq!(report.negotiation.acks_sent, 2);
        assert_eq!(report.negotiation.resizes, 1);
        assert_eq!(compositor.pongs(), vec![40]);

        let requests = compositor.requests();
        let ack = requests
            .iter()
            .position(|r| *r == Request::AckConfigure(2))
            .unwrap();
        let buffers_before_ack = requests[..ack]
            .iter()
            .filter(|r| **r == Request::Commit { with_buffer: true })
            .count();
        // first frame only; the loop's first commit follows the ack
        assert_eq!(buffers_before_ack, 1);
        assert!(compositor.violations().is_empty());
    }
}
