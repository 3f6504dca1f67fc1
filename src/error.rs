//! Startup error taxonomy
//!
//! Every setup-phase failure is fatal: the binary prints one line naming the
//! failed step and exits non-zero. The only error that may be recovered
//! locally is a transient [`StartupError::Present`] during steady-state
//! presentation.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::negotiator::NegotiationError;
use crate::protocol::Capability;

/// The startup step a failure belongs to, used for the diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStep {
    Connect,
    DiscoverCapabilities,
    InitDriver,
    CreateContext,
    CreateSurface,
    NegotiateConfigure,
    BindSurface,
    Present,
}

impl StartupStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartupStep::Connect => "connect",
            StartupStep::DiscoverCapabilities => "discover-capabilities",
            StartupStep::InitDriver => "init-driver",
            StartupStep::CreateContext => "create-context",
            StartupStep::CreateSurface => "create-surface",
            StartupStep::NegotiateConfigure => "negotiate-configure",
            StartupStep::BindSurface => "bind-surface",
            StartupStep::Present => "present",
        }
    }
}

impl fmt::Display for StartupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StartupError {
    /// The compositor session cannot be reached
    #[error("cannot reach compositor: {0}")]
    Connection(String),

    /// A required global is not advertised by the compositor
    #[error("compositor does not advertise required capabilities: {}", format_missing(.missing))]
    MissingCapability { missing: Vec<Capability> },

    #[error("graphics driver initialization failed: {0}")]
    DriverInit(String),

    #[error("rendering context creation failed: {0}")]
    ContextCreation(String),

    /// Reading, dispatching or flushing protocol traffic failed
    #[error("protocol dispatch failed: {reason}")]
    Dispatch { step: StartupStep, reason: String },

    /// Surface objects requested before the required globals were bound
    #[error("required capabilities have not been bound")]
    CapabilitiesNotBound,

    #[error("no configure event from compositor within {waited:?}")]
    ConfigureTimeout { waited: Duration },

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("binding rendering context to surface failed: {0}")]
    SurfaceBind(String),

    #[error("presenting frame failed: {reason}")]
    Present { reason: String, transient: bool },
}

impl StartupError {
    /// Names the step that failed.
    pub fn step(&self) -> StartupStep {
        match self {
            StartupError::Connection(_) => StartupStep::Connect,
            StartupError::MissingCapability { .. } => StartupStep::DiscoverCapabilities,
            StartupError::DriverInit(_) => StartupStep::InitDriver,
            StartupError::ContextCreation(_) => StartupStep::CreateContext,
            StartupError::Dispatch { step, .. } => *step,
            StartupError::CapabilitiesNotBound => StartupStep::CreateSurface,
            StartupError::ConfigureTimeout { .. } => StartupStep::NegotiateConfigure,
            StartupError::Negotiation(NegotiationError::PresentBeforeConfigure { .. }) => {
                StartupStep::Present
            }
            StartupError::Negotiation(_) => StartupStep::NegotiateConfigure,
            StartupError::SurfaceBind(_) => StartupStep::BindSurface,
            StartupError::Present { .. } => StartupStep::Present,
        }
    }

    /// Transport failure while performing `step`.
    pub fn dispatch(step: StartupStep, reason: impl Into<String>) -> Self {
        StartupError::Dispatch {
            step,
            reason: reason.into(),
        }
    }

    /// Attributes a transport failure to the step that was running when it
    /// surfaced. Other errors already know their step and pass through.
    pub fn during(self, step: StartupStep) -> Self {
        match self {
            StartupError::Dispatch { reason, .. } => StartupError::Dispatch { step, reason },
            other => other,
        }
    }

    /// Whether a steady-state loop may skip the frame and try again.
    pub fn is_transient(&self) -> bool {
        matches!(self, StartupError::Present { transient: true, .. })
    }

    /// The single diagnostic line printed before aborting.
    pub fn diagnostic(&self) -> String {
        format!("{} failed: {}", self.step(), self)
    }
}

fn format_missing(missing: &[Capability]) -> String {
    missing
        .iter()
        .map(|c| format!("{} ({})", c, c.interface()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_capability_names_step_and_interfaces() {
        let err = StartupError::MissingCapability {
            missing: vec![Capability::Shell],
        };
        assert_eq!(err.step(), StartupStep::DiscoverCapabilities);
        let line = err.diagnostic();
        assert!(line.starts_with("discover-capabilities failed"));
        assert!(line.contains("xdg_wm_base"));
    }

    #[test]
    fn test_only_transient_present_is_recoverable() {
        let transient = StartupError::Present {
            reason: "busy".into(),
            transient: true,
        };
        let fatal = StartupError::Present {
            reason: "surface lost".into(),
            transient: false,
        };
        assert!(transient.is_transient());
        assert!(!fatal.is_transient());
        assert!(!StartupError::Connection("x".into()).is_transient());
    }

    #[test]
    fn test_dispatch_failure_reports_the_step_it_happened_in() {
        let err = StartupError::dispatch(StartupStep::DiscoverCapabilities, "registry round-trip: eof");
        assert!(err
            .diagnostic()
            .starts_with("discover-capabilities failed: protocol dispatch failed: registry round-trip"));

        let err = StartupError::dispatch(StartupStep::NegotiateConfigure, "broken pipe")
            .during(StartupStep::Present);
        assert_eq!(err.step(), StartupStep::Present);
    }

    #[test]
    fn test_during_keeps_the_step_of_other_errors() {
        let err = StartupError::ConfigureTimeout {
            waited: Duration::from_millis(5),
        }
        .during(StartupStep::Present);
        assert_eq!(err.step(), StartupStep::NegotiateConfigure);
        assert_eq!(
            StartupError::CapabilitiesNotBound.step(),
            StartupStep::CreateSurface
        );
    }

    #[test]
    fn test_present_gate_violation_reports_present_step() {
        let err: StartupError = NegotiationError::PresentBeforeConfigure {
            state: crate::negotiator::SurfaceState::ConfigurePending,
        }
        .into();
        assert_eq!(err.step(), StartupStep::Present);
    }
}
