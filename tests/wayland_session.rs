// Integration test: bring a window up on the compositor named by
// WAYLAND_DISPLAY and present a handful of frames through EGL.

#![cfg(feature = "live-compositor")]

use std::time::Duration;

use anyhow::Result;

use swiftpane::{
    EglFactory, InitStrategy, StartupOptions, StartupOrchestrator, WaylandClient,
};

#[test]
fn test_live_compositor_first_frame() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    for strategy in [InitStrategy::Overlapped, InitStrategy::Sequential] {
        let mut client = WaylandClient::new();
        let mut orchestrator = StartupOrchestrator::new(StartupOptions {
            strategy,
            frame_count: 10,
            frame_interval: Duration::from_millis(16),
            ..StartupOptions::default()
        });

        let report = orchestrator.run(&mut client, &EglFactory::new())?;
        assert!(report.first_frame_presented);
        assert!(report.context_valid);
        assert!(report.negotiation.acks_sent >= 1);
        assert!(report.timeline.time_to_first_pixel().is_some());
    }

    Ok(())
}
