//! Shared fixtures for the end-to-end tests

#![allow(dead_code)]

use std::sync::Arc;

use reflash_core::{
    EventSink, FirmwareImage, ReflashEvent, ReflashSettings, Reflasher, TargetDescriptor,
};
use reflash_sim::SimulatedEcu;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

/// Log to the test output when RUST_LOG is set
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic, compressible image: runs of 32 equal bytes
pub fn base_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i >> 5) as u8) ^ ((i >> 13) as u8)).collect()
}

/// Loader binary the simulator accepts
pub fn loader() -> Vec<u8> {
    (0..1000u32).map(|i| (i % 251) as u8).collect()
}

/// Default settings with a short teardown backoff
pub fn settings() -> ReflashSettings {
    ReflashSettings::builder().teardown(10, 5).build()
}

pub struct Bench {
    pub ecu: Arc<SimulatedEcu>,
    pub reflasher: Reflasher,
    pub events: UnboundedReceiver<ReflashEvent>,
}

impl Bench {
    pub fn new(ecu: SimulatedEcu, target: TargetDescriptor) -> Self {
        Self::with_settings(ecu, target, settings())
    }

    pub fn with_settings(
        ecu: SimulatedEcu,
        target: TargetDescriptor,
        settings: ReflashSettings,
    ) -> Self {
        init_tracing();
        let ecu = Arc::new(ecu);
        let (sink, events) = EventSink::channel();
        let reflasher = Reflasher::new(ecu.clone(), target, settings, loader()).with_events(sink);
        Self {
            ecu,
            reflasher,
            events,
        }
    }

    /// Drain events seen so far into (progress values, info messages)
    pub fn drain(&mut self) -> (Vec<u8>, Vec<String>) {
        let mut progress = Vec::new();
        let mut info = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            match event {
                ReflashEvent::Progress(p) => progress.push(p),
                ReflashEvent::Info(message) => info.push(message),
            }
        }
        (progress, info)
    }
}

pub fn image(data: &[u8]) -> FirmwareImage {
    FirmwareImage::from_bytes(data.to_vec())
}

/// Progress must rise strictly and end at 100
pub fn assert_progress_complete(progress: &[u8]) {
    assert!(!progress.is_empty(), "no progress events");
    assert!(
        progress.windows(2).all(|w| w[0] < w[1]),
        "progress not increasing: {:?}",
        progress
    );
    assert_eq!(progress.last(), Some(&100));
}
