//! Graphics context bring-up and presentable surfaces
//!
//! Context creation is split from surface creation on purpose: the driver
//! and a surfaceless context can be brought up while the compositor
//! handshake is still in flight, and only the cheap window-surface step
//! waits for the surface to be configured.

pub mod egl;
pub mod software;

use serde::{Deserialize, Serialize};

use crate::error::StartupError;
use crate::negotiator::WindowGeometry;

pub use egl::EglFactory;
pub use software::SoftwareFactory;

/// Flat clear colour, RGBA in `0.0..=1.0`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClearColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl ClearColor {
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn is_normalized(&self) -> bool {
        [self.r, self.g, self.b, self.a]
            .iter()
            .all(|c| (0.0..=1.0).contains(c))
    }

    /// Packs into `0xAARRGGBB`
    pub fn to_argb8888(&self) -> u32 {
        let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u32;
        (channel(self.a) << 24) | (channel(self.r) << 16) | (channel(self.g) << 8) | channel(self.b)
    }
}

impl Default for ClearColor {
    fn default() -> Self {
        Self::new(0.2, 0.5, 0.7, 1.0)
    }
}

/// Brings up the driver and creates surfaceless contexts.
///
/// Nothing here may depend on the compositor's capabilities or on the
/// surface state; that independence is what lets the orchestrator overlap
/// it with discovery.
pub trait GraphicsContextFactory {
    /// Native display handle the driver binds to
    type Display: Copy + Send;
    type Driver: Send;
    type Context: GraphicsContext + Send;

    /// Loads the driver for the connection's platform display.
    fn init_driver(&self, display: Self::Display) -> Result<Self::Driver, StartupError>;

    /// Creates a context with no bound surface. Implementations warm the
    /// pipeline and leave the context released so any thread can bind it.
    fn create_context(&self, driver: Self::Driver) -> Result<Self::Context, StartupError>;
}

/// A surfaceless rendering context, ready to be bound to a window.
pub trait GraphicsContext {
    /// Windowing-layer surface a presentable surface is created from
    type Window;
    type Surface: PresentableSurface;

    fn is_valid(&self) -> bool;

    /// Creates the presentable surface for `window` and makes the context
    /// current on it.
    fn bind_surface(
        &mut self,
        window: &Self::Window,
        geometry: WindowGeometry,
    ) -> Result<Self::Surface, StartupError>;
}

pub trait PresentableSurface {
    fn geometry(&self) -> WindowGeometry;

    fn resize(&mut self, geometry: WindowGeometry);

    /// Fills the back buffer.
    fn render_frame(&mut self, color: ClearColor) -> Result<(), StartupError>;

    /// Hands the back buffer to the compositor.
    fn present(&mut self) -> Result<(), StartupError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_color_packs_as_argb() {
        assert!(ClearColor::default().is_normalized());
        assert_eq!(ClearColor::new(1.0, 0.0, 0.5, 1.0).to_argb8888(), 0xFFFF_0080);
        assert_eq!(ClearColor::new(0.0, 0.0, 0.0, 0.0).to_argb8888(), 0);
    }

    #[test]
    fn test_out_of_range_channel_is_not_normalized() {
        assert!(!ClearColor::new(1.2, 0.0, 0.0, 1.0).is_normalized());
        assert!(!ClearColor::new(0.0, -0.1, 0.0, 1.0).is_normalized());
    }
}
