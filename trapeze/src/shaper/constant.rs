use crate::shaper::LoadShaper;
use std::time::Duration;
use trapeze_core::{ConfigError, LoadProfile};

/// Every user from the first tick until `duration`.
#[derive(Debug, Clone)]
pub struct ConstantShaper {
    users: usize,
    duration: Duration,
}

impl ConstantShaper {
    pub fn new(profile: &LoadProfile) -> Result<Self, ConfigError> {
        profile.validate()?;
        Ok(Self {
            users: profile.users as usize,
            duration: profile.duration,
        })
    }
}

impl LoadShaper for ConstantShaper {
    fn target_concurrency(&self, elapsed: Duration) -> usize {
        if elapsed < self.duration {
            self.users
        } else {
            0
        }
    }

    fn total_duration(&self) -> Duration {
        self.duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_then_zero() {
        let shaper =
            ConstantShaper::new(&LoadProfile::constant(8, Duration::from_secs(30))).unwrap();
        assert_eq!(shaper.target_concurrency(Duration::ZERO), 8);
        assert_eq!(shaper.target_concurrency(Duration::from_secs(29)), 8);
        assert_eq!(shaper.target_concurrency(Duration::from_secs(30)), 0);
        assert_eq!(shaper.total_duration(), Duration::from_secs(30));
    }
}
