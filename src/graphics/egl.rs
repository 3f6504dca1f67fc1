//! EGL / GLES2 on Wayland
//!
//! The driver is initialised on the Wayland platform display as soon as the
//! connection exists. A GLES2 context is created and made current once
//! without any surface (EGL_KHR_surfaceless_context) so the driver finishes
//! its lazy setup before the compositor has configured anything.

use std::ffi::{c_void, CStr};
use std::ptr;
use std::sync::Arc;

use khronos_egl as egl;
use log::{debug, info, warn};
use wayland_client::protocol::wl_surface::WlSurface;
use wayland_client::Proxy;
use wayland_egl::WlEglSurface;

use super::{ClearColor, GraphicsContext, GraphicsContextFactory, PresentableSurface};
use crate::error::StartupError;
use crate::negotiator::WindowGeometry;
use crate::protocol::wayland::WaylandDisplay;

type EglInstance = egl::Instance<egl::Static>;

const EGL_PLATFORM_WAYLAND_KHR: egl::Enum = 0x31D8;

const CONFIG_ATTRIBS: [egl::Int; 11] = [
    egl::SURFACE_TYPE,
    egl::WINDOW_BIT,
    egl::RENDERABLE_TYPE,
    egl::OPENGL_ES2_BIT,
    egl::RED_SIZE,
    8,
    egl::GREEN_SIZE,
    8,
    egl::BLUE_SIZE,
    8,
    egl::NONE,
];

const CONTEXT_ATTRIBS: [egl::Int; 3] = [egl::CONTEXT_CLIENT_VERSION, 2, egl::NONE];

pub struct EglFactory {
    egl: Arc<EglInstance>,
}

impl EglFactory {
    pub fn new() -> Self {
        Self {
            egl: Arc::new(egl::Instance::new(egl::Static)),
        }
    }
}

impl Default for EglFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialised EGL display
pub struct EglDriver {
    egl: Arc<EglInstance>,
    display: egl::Display,
}

// SAFETY: EGLDisplay handles are process-wide and may be used from any
// thread; EGL serialises access internally.
unsafe impl Send for EglDriver {}

pub struct EglContext {
    egl: Arc<EglInstance>,
    display: egl::Display,
    config: egl::Config,
    context: egl::Context,
}

// SAFETY: the context is released (not current on any thread) when it
// leaves `create_context`, so moving it to another thread is allowed.
unsafe impl Send for EglContext {}

impl GraphicsContextFactory for EglFactory {
    type Display = WaylandDisplay;
    type Driver = EglDriver;
    type Context = EglContext;

    fn init_driver(&self, display: WaylandDisplay) -> Result<EglDriver, StartupError> {
        let egl_display = unsafe {
            self.egl.get_platform_display(
                EGL_PLATFORM_WAYLAND_KHR,
                display.as_ptr(),
                &[egl::ATTRIB_NONE],
            )
        }
        .map_err(|e| StartupError::DriverInit(format!("eglGetPlatformDisplay: {}", e)))?;

        let (major, minor) = self
            .egl
            .initialize(egl_display)
            .map_err(|e| StartupError::DriverInit(format!("eglInitialize: {}", e)))?;
        info!("EGL {}.{} initialised on Wayland display", major, minor);

        Ok(EglDriver {
            egl: Arc::clone(&self.egl),
            display: egl_display,
        })
    }

    fn create_context(&self, driver: EglDriver) -> Result<EglContext, StartupError> {
        let EglDriver { egl, display } = driver;
        egl.bind_api(egl::OPENGL_ES_API)
            .map_err(|e| StartupError::ContextCreation(format!("eglBindAPI: {}", e)))?;

        let config = egl
            .choose_first_config(display, &CONFIG_ATTRIBS)
            .map_err(|e| StartupError::ContextCreation(format!("eglChooseConfig: {}", e)))?
            .ok_or_else(|| {
                StartupError::ContextCreation("no RGB888 GLES2 window config".into())
            })?;

        let context = egl
            .create_context(display, config, None, &CONTEXT_ATTRIBS)
            .map_err(|e| StartupError::ContextCreation(format!("eglCreateContext: {}", e)))?;

        // Surfaceless make-current forces the driver to finish context setup.
        egl.make_current(display, None, None, Some(context))
            .map_err(|e| StartupError::ContextCreation(format!("surfaceless make current: {}", e)))?;
        gl::load_with(|name| {
            egl.get_proc_address(name)
                .map_or(ptr::null(), |f| f as *const c_void)
        });
        if let Some(renderer) = gl_string(gl::RENDERER) {
            info!("GLES renderer: {}", renderer);
        }
        egl.make_current(display, None, None, None)
            .map_err(|e| StartupError::ContextCreation(format!("release context: {}", e)))?;

        Ok(EglContext {
            egl,
            display,
            config,
            context,
        })
    }
}

impl GraphicsContext for EglContext {
    type Window = WlSurface;
    type Surface = EglWindowSurface;

    fn is_valid(&self) -> bool {
        !self.context.as_ptr().is_null()
    }

    fn bind_surface(
        &mut self,
        window: &WlSurface,
        geometry: WindowGeometry,
    ) -> Result<EglWindowSurface, StartupError> {
        let native = WlEglSurface::new(
            window.id(),
            geometry.width as i32,
            geometry.height as i32,
        )
        .map_err(|e| StartupError::SurfaceBind(format!("wl_egl_window_create: {}", e)))?;

        let surface = unsafe {
            self.egl.create_window_surface(
                self.display,
                self.config,
                native.ptr() as egl::NativeWindowType,
                None,
            )
        }
        .map_err(|e| StartupError::SurfaceBind(format!("eglCreateWindowSurface: {}", e)))?;

        if let Err(e) = self
            .egl
            .make_current(self.display, Some(surface), Some(surface), Some(self.context))
        {
            let _ = self.egl.destroy_surface(self.display, surface);
            return Err(StartupError::SurfaceBind(format!("eglMakeCurrent: {}", e)));
        }
        debug!("EGL window surface bound at {}", geometry);

        Ok(EglWindowSurface {
            egl: Arc::clone(&self.egl),
            display: self.display,
            surface,
            native,
            geometry,
        })
    }
}

impl Drop for EglContext {
    fn drop(&mut self) {
        if let Err(e) = self.egl.destroy_context(self.display, self.context) {
            warn!("eglDestroyContext failed: {}", e);
        }
    }
}

pub struct EglWindowSurface {
    egl: Arc<EglInstance>,
    display: egl::Display,
    surface: egl::Surface,
    // Must outlive `surface`; dropped after it in `Drop`.
    native: WlEglSurface,
    geometry: WindowGeometry,
}

impl PresentableSurface for EglWindowSurface {
    fn geometry(&self) -> WindowGeometry {
        self.geometry
    }

    fn resize(&mut self, geometry: WindowGeometry) {
        self.native
            .resize(geometry.width as i32, geometry.height as i32, 0, 0);
        self.geometry = geometry;
    }

    fn render_frame(&mut self, color: ClearColor) -> Result<(), StartupError> {
        unsafe {
            gl::Viewport(0, 0, self.geometry.width as i32, self.geometry.height as i32);
            gl::ClearColor(color.r, color.g, color.b, color.a);
            gl::Clear(gl::COLOR_BUFFER_BIT);
        }
        Ok(())
    }

    fn present(&mut self) -> Result<(), StartupError> {
        self.egl
            .swap_buffers(self.display, self.surface)
            .map_err(|e| StartupError::Present {
                reason: format!("eglSwapBuffers: {}", e),
                transient: is_transient(e),
            })
    }
}

impl Drop for EglWindowSurface {
    fn drop(&mut self) {
        let _ = self.egl.make_current(self.display, None, None, None);
        if let Err(e) = self.egl.destroy_surface(self.display, self.surface) {
            warn!("eglDestroySurface failed: {}", e);
        }
    }
}

/// Errors after which the surface or context is gone for good.
fn is_transient(error: egl::Error) -> bool {
    !matches!(
        error,
        egl::Error::BadSurface
            | egl::Error::BadNativeWindow
            | egl::Error::BadDisplay
            | egl::Error::NotInitialized
            | egl::Error::ContextLost
    )
}

fn gl_string(name: gl::types::GLenum) -> Option<String> {
    unsafe {
        let raw = gl::GetString(name);
        if raw.is_null() {
            None
        } else {
            Some(
                CStr::from_ptr(raw as *const _)
                    .to_string_lossy()
                    .into_owned(),
            )
        }
    }
}
