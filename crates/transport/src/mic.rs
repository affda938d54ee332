//! Microphone capture abstraction
//!
//! The microphone is the one exclusive OS resource this layer touches.
//! Acquisition is scoped: a capture handle releases the device when it
//! is dropped, so every exit path of the transport, normal or not,
//! gives the device back.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MicError {
    #[error("Microphone unavailable: {0}")]
    Unavailable(String),
}

/// One frame of captured PCM16 audio
#[derive(Debug, Clone)]
pub struct MicFrame {
    pub samples: Vec<i16>,
    pub sample_rate_hz: u32,
}

/// An open capture handle; dropping it releases the device
#[async_trait]
pub trait MicCapture: Send {
    /// Next frame of audio, or `None` once the device is gone.
    async fn next_frame(&mut self) -> Option<MicFrame>;
}

/// A capture device that can be acquired for the length of a session
#[async_trait]
pub trait MicrophoneSource: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn MicCapture>, MicError>;
}

/// Silent capture source for headless deployments and tests
///
/// Produces zeroed frames at the configured cadence and counts open
/// captures, which is how tests assert the device is released on every
/// teardown path.
pub struct SilenceMicSource {
    sample_rate_hz: u32,
    frame_ms: u32,
    active: Arc<AtomicUsize>,
}

impl SilenceMicSource {
    pub fn new(sample_rate_hz: u32, frame_ms: u32) -> Self {
        Self {
            sample_rate_hz,
            frame_ms,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of capture handles currently open
    pub fn active_captures(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MicrophoneSource for SilenceMicSource {
    async fn acquire(&self) -> Result<Box<dyn MicCapture>, MicError> {
        self.active.fetch_add(1, Ordering::SeqCst);
        let samples_per_frame = (self.sample_rate_hz * self.frame_ms / 1000) as usize;
        Ok(Box::new(SilenceCapture {
            interval: tokio::time::interval(Duration::from_millis(self.frame_ms as u64)),
            samples_per_frame,
            sample_rate_hz: self.sample_rate_hz,
            active: self.active.clone(),
        }))
    }
}

struct SilenceCapture {
    interval: tokio::time::Interval,
    samples_per_frame: usize,
    sample_rate_hz: u32,
    active: Arc<AtomicUsize>,
}

#[async_trait]
impl MicCapture for SilenceCapture {
    async fn next_frame(&mut self) -> Option<MicFrame> {
        self.interval.tick().await;
        Some(MicFrame {
            samples: vec![0; self.samples_per_frame],
            sample_rate_hz: self.sample_rate_hz,
        })
    }
}

impl Drop for SilenceCapture {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
