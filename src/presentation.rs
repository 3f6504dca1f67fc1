//! Render/present cycle after negotiation
//!
//! A [`PresentationLoop`] exists only once the surface has been configured:
//! constructing one binds the rendering context to the window, and that step
//! refuses to run earlier. Every present is gated on the negotiator again,
//! so no path can hand a buffer to the compositor before the first ack.

use log::{debug, info, warn};
use serde::Serialize;

use crate::error::StartupError;
use crate::graphics::{ClearColor, GraphicsContext, PresentableSurface};
use crate::negotiator::SurfaceNegotiator;
use crate::pacing::{FramePacer, FrameStats};

/// Outcome of a fixed-rate run
#[derive(Debug, Clone, Serialize)]
pub struct LoopSummary {
    /// Render/present cycles executed
    pub cycles: u64,
    pub frames_presented: u64,
    /// Frames dropped after a transient present failure
    pub frames_skipped: u64,
    pub closed_by_compositor: bool,
    pub frame_stats: FrameStats,
}

pub struct PresentationLoop<S: PresentableSurface> {
    surface: S,
    color: ClearColor,
    present_retry_limit: u32,
    consecutive_failures: u32,
    frames_presented: u64,
    frames_skipped: u64,
}

impl<S: PresentableSurface> PresentationLoop<S> {
    /// Binds `context` to `window` at the negotiated geometry.
    ///
    /// Fails with [`StartupError::SurfaceBind`] unless the surface is
    /// `Configured`.
    pub fn bind_surface<C>(
        context: &mut C,
        window: &C::Window,
        negotiator: &SurfaceNegotiator,
        color: ClearColor,
        present_retry_limit: u32,
    ) -> Result<Self, StartupError>
    where
        C: GraphicsContext<Surface = S>,
    {
        if !negotiator.is_configured() {
            return Err(StartupError::SurfaceBind(format!(
                "surface is {:?}, not configured",
                negotiator.state()
            )));
        }
        if !context.is_valid() {
            return Err(StartupError::SurfaceBind(
                "rendering context is no longer valid".into(),
            ));
        }

        let surface = context.bind_surface(window, negotiator.geometry())?;
        info!("Surface bound at {}", negotiator.geometry());

        Ok(Self {
            surface,
            color,
            present_retry_limit,
            consecutive_failures: 0,
            frames_presented: 0,
            frames_skipped: 0,
        })
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn render_frame(&mut self) -> Result<(), StartupError> {
        self.surface.render_frame(self.color)
    }

    /// Checks the configure gate, then submits the back buffer.
    pub fn present(&mut self, negotiator: &SurfaceNegotiator) -> Result<(), StartupError> {
        negotiator.ensure_presentable()?;
        self.surface.present()?;
        self.frames_presented += 1;
        Ok(())
    }

    /// Runs exactly `frame_count` cycles at the pacer's interval.
    ///
    /// Each cycle calls `service` first, which is where the caller dispatches
    /// pending compositor events into `negotiator` and acknowledges them. A
    /// geometry change is applied to the surface before rendering. A close
    /// request ends the run after the current cycle's service step.
    ///
    /// Transient present failures drop the frame; more than
    /// `present_retry_limit` in a row is fatal, as is any structural failure.
    pub fn run_fixed_rate<F>(
        &mut self,
        pacer: &mut FramePacer,
        frame_count: u64,
        negotiator: &mut SurfaceNegotiator,
        mut service: F,
    ) -> Result<LoopSummary, StartupError>
    where
        F: FnMut(&mut SurfaceNegotiator) -> Result<(), StartupError>,
    {
        let presented_before = self.frames_presented;
        let skipped_before = self.frames_skipped;
        let mut cycles = 0;
        let mut closed_by_compositor = false;

        while cycles < frame_count {
            pacer.begin_frame();
            service(negotiator)?;
            if negotiator.close_requested() {
                info!("Close requested after {} frames", cycles);
                closed_by_compositor = true;
                break;
            }

            let geometry = negotiator.geometry();
            if geometry != self.surface.geometry() {
                self.surface.resize(geometry);
            }

            self.render_frame()?;
            match self.present(negotiator) {
                Ok(()) => self.consecutive_failures = 0,
                Err(e) if e.is_transient() => {
                    self.consecutive_failures += 1;
                    if self.consecutive_failures > self.present_retry_limit {
                        warn!(
                            "Giving up after {} consecutive present failures",
                            self.consecutive_failures
                        );
                        return Err(e);
                    }
                    self.frames_skipped += 1;
                    debug!("Skipping frame {}: {}", cycles, e);
                }
                Err(e) => return Err(e),
            }

            cycles += 1;
            pacer.end_frame();
            pacer.wait_for_next_frame();
        }

        Ok(LoopSummary {
            cycles,
            frames_presented: self.frames_presented - presented_before,
            frames_skipped: self.frames_skipped - skipped_before,
            closed_by_compositor,
            frame_stats: pacer.stats().clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::StartupStep;
    use crate::graphics::software::{PresentFault, SoftwareContext, SoftwareFactory, SoftwareSurface};
    use crate::graphics::GraphicsContextFactory;
    use crate::negotiator::{SurfaceState, WindowGeometry};
    use crate::protocol::scripted::{ScriptedDisplay, ScriptedWindow};
    use crate::protocol::{
        DispatchMode, ProtocolClient, ProtocolEvent, ScriptedCompositor, WindowRequest,
    };

    struct Fixture {
        compositor: ScriptedCompositor,
        window: ScriptedWindow,
        context: SoftwareContext,
        negotiator: SurfaceNegotiator,
    }

    fn fixture(factory: SoftwareFactory) -> Fixture {
        let mut compositor = ScriptedCompositor::well_behaved(320, 240, 1);
        compositor.connect().unwrap();
        let caps = compositor.discover_capabilities().unwrap();
        let window = compositor
            .create_window(
                &caps,
                &WindowRequest {
                    title: "test".into(),
                    app_id: "test".into(),
                },
            )
            .unwrap();
        let driver = factory
            .init_driver(ScriptedDisplay { connection_id: 1 })
            .unwrap();
        let context = factory.create_context(driver).unwrap();
        let mut negotiator = SurfaceNegotiator::new(WindowGeometry::default());
        negotiator.surface_committed().unwrap();
        Fixture {
            compositor,
            window,
            context,
            negotiator,
        }
    }

    /// Delivers the scripted configure batch and acknowledges it.
    fn configure(fixture: &mut Fixture) {
        let events = fixture.compositor.dispatch(DispatchMode::Pending).unwrap();
        for event in &events {
            if let Some(serial) = fixture.negotiator.handle_event(event) {
                let compositor = &mut fixture.compositor;
                fixture
                    .negotiator
                    .acknowledge(serial, |s| compositor.ack_configure(s))
                    .unwrap();
            }
        }
        assert!(fixture.negotiator.is_configured());
    }

    fn bound(fixture: &mut Fixture, retry_limit: u32) -> PresentationLoop<SoftwareSurface> {
        PresentationLoop::bind_surface(
            &mut fixture.context,
            &fixture.window,
            &fixture.negotiator,
            ClearColor::default(),
            retry_limit,
        )
        .unwrap()
    }

    #[test]
    fn test_bind_refused_before_configure() {
        let mut fixture = fixture(SoftwareFactory::new());
        let result = PresentationLoop::bind_surface(
            &mut fixture.context,
            &fixture.window,
            &fixture.negotiator,
            ClearColor::default(),
            0,
        );
        assert!(matches!(result, Err(StartupError::SurfaceBind(_))));
        assert_eq!(fixture.negotiator.state(), SurfaceState::ConfigurePending);
    }

    #[test]
    fn test_runs_exact_frame_count() {
        let mut fixture = fixture(SoftwareFactory::new());
        configure(&mut fixture);
        let mut presentation = bound(&mut fixture, 0);
        let mut pacer = FramePacer::new(Duration::from_millis(1));
        let mut serviced = 0;

        let summary = presentation
            .run_fixed_rate(&mut pacer, 25, &mut fixture.negotiator, |_| {
                serviced += 1;
                Ok(())
            })
            .unwrap();

        assert_eq!(summary.cycles, 25);
        assert_eq!(summary.frames_presented, 25);
        assert_eq!(serviced, 25);
        assert_eq!(presentation.surface().presented(), 25);
        assert_eq!(fixture.compositor.buffers_committed(), 25);
        assert!(fixture.compositor.violations().is_empty());
    }

    #[test]
    fn test_close_stops_loop_early() {
        let mut fixture = fixture(SoftwareFactory::new());
        configure(&mut fixture);
        let mut presentation = bound(&mut fixture, 0);
        let mut pacer = FramePacer::new(Duration::ZERO);
        let mut tick = 0;

        let summary = presentation
            .run_fixed_rate(&mut pacer, 100, &mut fixture.negotiator, |negotiator| {
                tick += 1;
                if tick == 4 {
                    negotiator.handle_event(&ProtocolEvent::CloseRequested);
                }
                Ok(())
            })
            .unwrap();

        assert!(summary.closed_by_compositor);
        assert_eq!(summary.cycles, 3);
        assert_eq!(summary.frames_presented, 3);
    }

    #[test]
    fn test_resize_is_applied_before_render() {
        let mut fixture = fixture(SoftwareFactory::new());
        configure(&mut fixture);
        let mut presentation = bound(&mut fixture, 0);
        let mut pacer = FramePacer::new(Duration::ZERO);

        presentation
            .run_fixed_rate(&mut pacer, 2, &mut fixture.negotiator, |negotiator| {
                negotiator.handle_event(&ProtocolEvent::ToplevelConfigure {
                    width: 10,
                    height: 10,
                });
                Ok(())
            })
            .unwrap();

        assert_eq!(presentation.surface().geometry(), WindowGeometry::new(10, 10));
        assert_eq!(presentation.surface().front_buffer().len(), 100);
    }

    #[test]
    fn test_transient_failures_are_skipped_within_limit() {
        let factory = SoftwareFactory::new().with_present_faults(vec![
            None,
            Some(PresentFault::Transient),
            Some(PresentFault::Transient),
            None,
        ]);
        let mut fixture = fixture(factory);
        configure(&mut fixture);
        let mut presentation = bound(&mut fixture, 2);
        let mut pacer = FramePacer::new(Duration::ZERO);

        let summary = presentation
            .run_fixed_rate(&mut pacer, 5, &mut fixture.negotiator, |_| Ok(()))
            .unwrap();

        assert_eq!(summary.cycles, 5);
        assert_eq!(summary.frames_skipped, 2);
        assert_eq!(summary.frames_presented, 3);
    }

    #[test]
    fn test_transient_failures_beyond_limit_are_fatal() {
        let factory = SoftwareFactory::new()
            .with_present_faults(vec![Some(PresentFault::Transient); 3]);
        let mut fixture = fixture(factory);
        configure(&mut fixture);
        let mut presentation = bound(&mut fixture, 2);
        let mut pacer = FramePacer::new(Duration::ZERO);

        let err = presentation
            .run_fixed_rate(&mut pacer, 10, &mut fixture.negotiator, |_| Ok(()))
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(presentation.frames_presented(), 0);
    }

    #[test]
    fn test_zero_retry_limit_fails_on_first_transient() {
        let factory =
            SoftwareFactory::new().with_present_faults(vec![Some(PresentFault::Transient)]);
        let mut fixture = fixture(factory);
        configure(&mut fixture);
        let mut presentation = bound(&mut fixture, 0);
        let mut pacer = FramePacer::new(Duration::ZERO);

        assert!(presentation
            .run_fixed_rate(&mut pacer, 3, &mut fixture.negotiator, |_| Ok(()))
            .is_err());
    }

    #[test]
    fn test_fatal_failure_is_not_retried() {
        let factory = SoftwareFactory::new().with_present_faults(vec![Some(PresentFault::Fatal)]);
        let mut fixture = fixture(factory);
        configure(&mut fixture);
        let mut presentation = bound(&mut fixture, 5);
        let mut pacer = FramePacer::new(Duration::ZERO);

        let err = presentation
            .run_fixed_rate(&mut pacer, 3, &mut fixture.negotiator, |_| Ok(()))
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_service_error_aborts_loop() {
        let mut fixture = fixture(SoftwareFactory::new());
        configure(&mut fixture);
        let mut presentation = bound(&mut fixture, 0);
        let mut pacer = FramePacer::new(Duration::ZERO);

        let err = presentation
            .run_fixed_rate(&mut pacer, 3, &mut fixture.negotiator, |_| {
                Err(StartupError::dispatch(StartupStep::Present, "connection reset"))
            })
            .unwrap_err();
        assert!(matches!(err, StartupError::Dispatch { .. }));
        assert_eq!(presentation.frames_presented(), 0);
    }
}
