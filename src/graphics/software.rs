//! Headless software context
//!
//! Renders into a CPU framebuffer and commits through a
//! [`ScriptedWindow`], so the simulated compositor sees every present.
//! Used by `--headless` and by tests; supports simulated driver latency and
//! fault injection at each stage.

use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, trace};

use super::{ClearColor, GraphicsContext, GraphicsContextFactory, PresentableSurface};
use crate::error::StartupError;
use crate::negotiator::WindowGeometry;
use crate::protocol::scripted::{ScriptedDisplay, ScriptedWindow};

/// Injected present outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentFault {
    /// Skippable (compositor busy, buffer not released in time)
    Transient,
    /// Surface lost for good
    Fatal,
}

#[derive(Debug, Clone, Default)]
pub struct SoftwareFactory {
    driver_latency: Duration,
    fail_driver: bool,
    fail_context: bool,
    fail_bind: bool,
    present_faults: VecDeque<Option<PresentFault>>,
}

impl SoftwareFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time `init_driver` spends "loading the driver"
    pub fn with_driver_latency(mut self, latency: Duration) -> Self {
        self.driver_latency = latency;
        self
    }

    pub fn failing_driver(mut self) -> Self {
        self.fail_driver = true;
        self
    }

    pub fn failing_context(mut self) -> Self {
        self.fail_context = true;
        self
    }

    pub fn failing_bind(mut self) -> Self {
        self.fail_bind = true;
        self
    }

    /// Outcomes for successive presents; `None` entries succeed.
    pub fn with_present_faults(mut self, faults: Vec<Option<PresentFault>>) -> Self {
        self.present_faults = faults.into();
        self
    }
}

/// Loaded "driver" for one display connection
#[derive(Debug)]
pub struct SoftwareDriver {
    connection_id: u32,
}

#[derive(Debug)]
pub struct SoftwareContext {
    connection_id: u32,
    valid: bool,
    fail_bind: bool,
    present_faults: VecDeque<Option<PresentFault>>,
}

impl SoftwareContext {
    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }
}

impl GraphicsContextFactory for SoftwareFactory {
    type Display = ScriptedDisplay;
    type Driver = SoftwareDriver;
    type Context = SoftwareContext;

    fn init_driver(&self, display: ScriptedDisplay) -> Result<SoftwareDriver, StartupError> {
        if !self.driver_latency.is_zero() {
            std::thread::sleep(self.driver_latency);
        }
        if self.fail_driver {
            return Err(StartupError::DriverInit(
                "software rasterizer unavailable".into(),
            ));
        }
        debug!(
            "Software driver ready for connection {}",
            display.connection_id
        );
        Ok(SoftwareDriver {
            connection_id: display.connection_id,
        })
    }

    fn create_context(&self, driver: SoftwareDriver) -> Result<SoftwareContext, StartupError> {
        if self.fail_context {
            return Err(StartupError::ContextCreation(
                "no matching software config".into(),
            ));
        }
        Ok(SoftwareContext {
            connection_id: driver.connection_id,
            valid: true,
            fail_bind: self.fail_bind,
            present_faults: self.present_faults.clone(),
        })
    }
}

impl GraphicsContext for SoftwareContext {
    type Window = ScriptedWindow;
    type Surface = SoftwareSurface;

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn bind_surface(
        &mut self,
        window: &ScriptedWindow,
        geometry: WindowGeometry,
    ) -> Result<SoftwareSurface, StartupError> {
        if self.fail_bind {
            return Err(StartupError::SurfaceBind(format!(
                "surface {} rejected by software context",
                window.surface_id()
            )));
        }
        Ok(SoftwareSurface {
            window: window.clone(),
            geometry,
            back: vec![0; pixel_count(geometry)],
            front: Vec::new(),
            faults: std::mem::take(&mut self.present_faults),
            rendered: false,
            presented: 0,
        })
    }
}

/// Double-buffered CPU surface
#[derive(Debug)]
pub struct SoftwareSurface {
    window: ScriptedWindow,
    geometry: WindowGeometry,
    back: Vec<u32>,
    front: Vec<u32>,
    faults: VecDeque<Option<PresentFault>>,
    rendered: bool,
    presented: u64,
}

impl SoftwareSurface {
    pub fn presented(&self) -> u64 {
        self.presented
    }

    /// Last presented frame
    pub fn front_buffer(&self) -> &[u32] {
        &self.front
    }
}

impl PresentableSurface for SoftwareSurface {
    fn geometry(&self) -> WindowGeometry {
        self.geometry
    }

    fn resize(&mut self, geometry: WindowGeometry) {
        debug!("Software surface resized {} -> {}", self.geometry, geometry);
        self.geometry = geometry;
        self.back = vec![0; pixel_count(geometry)];
    }

    fn render_frame(&mut self, color: ClearColor) -> Result<(), StartupError> {
        self.back.fill(color.to_argb8888());
        self.rendered = true;
        Ok(())
    }

    fn present(&mut self) -> Result<(), StartupError> {
        match self.faults.pop_front().flatten() {
            Some(PresentFault::Transient) => {
                return Err(StartupError::Present {
                    reason: "buffer still held by compositor".into(),
                    transient: true,
                })
            }
            Some(PresentFault::Fatal) => {
                return Err(StartupError::Present {
                    reason: "surface lost".into(),
                    transient: false,
                })
            }
            None => {}
        }
        if !self.rendered {
            trace!("Presenting a frame that was never rendered");
        }
        std::mem::swap(&mut self.front, &mut self.back);
        if self.back.len() != self.front.len() {
            self.back = vec![0; self.front.len()];
        }
        self.window.commit_buffer();
        self.rendered = false;
        self.presented += 1;
        Ok(())
    }
}

fn pixel_count(geometry: WindowGeometry) -> usize {
    geometry.width as usize * geometry.height as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ProtocolClient, ScriptedCompositor, WindowRequest};

    fn window() -> (ScriptedCompositor, ScriptedWindow) {
        let mut compositor = ScriptedCompositor::new();
        compositor.connect().unwrap();
        let caps = compositor.discover_capabilities().unwrap();
        let window = compositor
            .create_window(
                &caps,
                &WindowRequest {
                    title: "t".into(),
                    app_id: "a".into(),
                },
            )
            .unwrap();
        (compositor, window)
    }

    #[test]
    fn test_context_needs_no_surface() {
        let factory = SoftwareFactory::new();
        let driver = factory
            .init_driver(ScriptedDisplay { connection_id: 3 })
            .unwrap();
        let context = factory.create_context(driver).unwrap();
        assert!(context.is_valid());
        assert_eq!(context.connection_id(), 3);
    }

    #[test]
    fn test_present_commits_cleared_frame() {
        let (compositor, window) = window();
        let factory = SoftwareFactory::new();
        let driver = factory
            .init_driver(ScriptedDisplay { connection_id: 1 })
            .unwrap();
        let mut context = factory.create_context(driver).unwrap();
        let mut surface = context
            .bind_surface(&window, WindowGeometry::new(4, 2))
            .unwrap();

        let color = ClearColor::new(1.0, 0.0, 0.0, 1.0);
        surface.render_frame(color).unwrap();
        surface.present().unwrap();

        assert_eq!(surface.front_buffer(), &[0xFFFF_0000; 8][..]);
        assert_eq!(surface.presented(), 1);
        assert_eq!(compositor.buffers_committed(), 1);
    }

    #[test]
    fn test_injected_faults_surface_as_present_errors() {
        let (_compositor, window) = window();
        let factory = SoftwareFactory::new().with_present_faults(vec![
            Some(PresentFault::Transient),
            None,
            Some(PresentFault::Fatal),
        ]);
        let driver = factory
            .init_driver(ScriptedDisplay { connection_id: 1 })
            .unwrap();
        let mut context = factory.create_context(driver).unwrap();
        let mut surface = context
            .bind_surface(&window, WindowGeometry::new(2, 2))
            .unwrap();

        assert!(surface.present().unwrap_err().is_transient());
        assert!(surface.present().is_ok());
        let fatal = surface.present().unwrap_err();
        assert!(!fatal.is_transient());
        assert_eq!(surface.presented(), 1);
    }

    #[test]
    fn test_resize_reallocates_back_buffer() {
        let (_compositor, window) = window();
        let factory = SoftwareFactory::new();
        let driver = factory
            .init_driver(ScriptedDisplay { connection_id: 1 })
            .unwrap();
        let mut context = factory.create_context(driver).unwrap();
        let mut surface = context
            .bind_surface(&window, WindowGeometry::new(2, 2))
            .unwrap();

        surface.resize(WindowGeometry::new(3, 3));
        surface.render_frame(ClearColor::default()).unwrap();
        surface.present().unwrap();
        assert_eq!(surface.front_buffer().len(), 9);
        assert_eq!(surface.geometry(), WindowGeometry::new(3, 3));
    }

    #[test]
    fn test_driver_failure_is_driver_init_error() {
        let factory = SoftwareFactory::new().failing_driver();
        assert!(matches!(
            factory.init_driver(ScriptedDisplay { connection_id: 1 }),
            Err(StartupError::DriverInit(_))
        ));
    }
}
