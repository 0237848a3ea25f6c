use crate::shaper::{LoadShaper, TrapezoidalShaper};
use std::time::Duration;
use trapeze_core::{ConfigError, LoadProfile, ProfileMode};

/// Trapezoid quantized to batches of `step` users.
///
/// A batch of `step` users joins every `step / ramp_rate` seconds; the plateau is the exact
/// user count even when it is not a multiple of `step`.
#[derive(Debug, Clone)]
pub struct StepShaper {
    inner: TrapezoidalShaper,
    step: usize,
}

impl StepShaper {
    pub fn new(profile: &LoadProfile) -> Result<Self, ConfigError> {
        let ProfileMode::Step { step } = profile.mode else {
            return Err(ConfigError::ZeroStep);
        };
        let inner = TrapezoidalShaper::new(profile)?;
        Ok(Self {
            inner,
            step: step as usize,
        })
    }
}

impl LoadShaper for StepShaper {
    fn target_concurrency(&self, elapsed: Duration) -> usize {
        let target = self.inner.target_concurrency(elapsed);
        if target == self.inner.users() as usize {
            target
        } else {
            target - target % self.step
        }
    }

    fn total_duration(&self) -> Duration {
        self.inner.total_duration()
    }
}
