// src/utils/host.rs
//! Host capacity probing
//!
//! The admission controller scales its ceiling with the host's core count and
//! sheds spawns when the host is loaded. Both readings come through
//! [`HostProbe`] so capacity math can be exercised without a real host.

use std::num::NonZeroUsize;

pub trait HostProbe: Send + Sync {
    /// Cores available to this process
    fn available_cores(&self) -> usize;

    /// Host load per core. Callers clamp it to `[0, 1]`.
    fn load_fraction(&self) -> f64;
}

/// Reads the live host: `available_parallelism` and the 1-minute load average
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHostProbe;

impl HostProbe for SystemHostProbe {
    fn available_cores(&self) -> usize {
        std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    }

    #[cfg(unix)]
    fn load_fraction(&self) -> f64 {
        let mut loads = [0f64; 3];
        // SAFETY: getloadavg writes at most `nelem` doubles into the buffer.
        let written = unsafe { libc::getloadavg(loads.as_mut_ptr(), 1) };
        if written < 1 {
            return 0.0;
        }
        (loads[0] / self.available_cores() as f64).clamp(0.0, 1.0)
    }

    #[cfg(not(unix))]
    fn load_fraction(&self) -> f64 {
        0.0
    }
}

/// Fixed readings, for tests and for hosts that manage capacity externally
#[derive(Debug, Clone, Copy)]
pub struct FixedHostProbe {
    pub cores: usize,
    pub load: f64,
}

impl FixedHostProbe {
    pub fn new(cores: usize) -> Self {
        Self { cores, load: 0.0 }
    }

    pub fn with_load(mut self, load: f64) -> Self {
        self.load = load;
        self
    }
}

impl HostProbe for FixedHostProbe {
    fn available_cores(&self) -> usize {
        self.cores
    }

    fn load_fraction(&self) -> f64 {
        self.load
    }
}
