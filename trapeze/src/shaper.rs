//! Load shapes: how many virtual users should be live at a given point of a run.
mod constant;
mod step;
mod trapezoidal;

pub use constant::ConstantShaper;
pub use step::StepShaper;
pub use trapezoidal::TrapezoidalShaper;

use std::time::Duration;
use trapeze_core::{ConfigError, LoadProfile, ProfileMode};

pub trait LoadShaper: Send + Sync {
    /// Target number of live virtual users at `elapsed` into the run.
    fn target_concurrency(&self, elapsed: Duration) -> usize;

    /// Point after which the target is zero for good.
    fn total_duration(&self) -> Duration;
}

/// Build the shaper for a profile, rejecting invalid profiles.
pub fn shaper_for(profile: &LoadProfile) -> Result<Box<dyn LoadShaper>, ConfigError> {
    let shaper: Box<dyn LoadShaper> = match profile.mode {
        ProfileMode::Trapezoidal => Box::new(TrapezoidalShaper::new(profile)?),
        ProfileMode::Step { .. } => Box::new(StepShaper::new(profile)?),
        ProfileMode::Constant => Box::new(ConstantShaper::new(profile)?),
    };
    Ok(shaper)
}
