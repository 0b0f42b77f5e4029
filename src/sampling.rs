//! Sampling-mode profiler seam.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::{DEFAULT_SAMPLING_PERIOD_MS, ProfilerError, ProfilerResult, ProfilerState};

pub trait SamplingProfiler: Send + Sync {
    /// `Ready` or `Running`; an error when the collector cannot be reached.
    fn state(&self) -> ProfilerResult<ProfilerState>;
    fn resume(&self) -> ProfilerResult<()>;
    fn suspend(&self) -> ProfilerResult<()>;
    fn clear(&self) -> ProfilerResult<()>;
    fn set_sampling_period(&self, period_ms: u32) -> ProfilerResult<()>;
}

/// Sampler living in the monitor process.
#[derive(Debug)]
pub struct LocalSampler {
    running: AtomicBool,
    connected: AtomicBool,
    period_ms: AtomicU32,
}

impl Default for LocalSampler {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            period_ms: AtomicU32::new(DEFAULT_SAMPLING_PERIOD_MS),
        }
    }
}

impl LocalSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn period_ms(&self) -> u32 {
        self.period_ms.load(Ordering::SeqCst)
    }

    fn check(&self) -> ProfilerResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProfilerError::RemoteUnreachable(
                "sampling collector unreachable".to_string(),
            ))
        }
    }
}

impl SamplingProfiler for LocalSampler {
    fn state(&self) -> ProfilerResult<ProfilerState> {
        self.check()?;
        Ok(if self.running.load(Ordering::SeqCst) {
            ProfilerState::Running
        } else {
            ProfilerState::Ready
        })
    }

    fn resume(&self) -> ProfilerResult<()> {
        self.check()?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn suspend(&self) -> ProfilerResult<()> {
        self.check()?;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn clear(&self) -> ProfilerResult<()> {
        self.check()
    }

    fn set_sampling_period(&self, period_ms: u32) -> ProfilerResult<()> {
        self.check()?;
        self.period_ms.store(period_ms, Ordering::SeqCst);
        Ok(())
    }
}
