use crate::shaper::LoadShaper;
use std::time::Duration;
use trapeze_core::{ConfigError, LoadProfile};

/// Linear ramp-up at `ramp_rate`, plateau at `users` until `duration`, then linear ramp-down.
///
/// Fractional targets truncate, so the curve never overshoots the profile. If `duration`
/// ends before the ramp-up completes, ramp-down starts from the level reached so far.
#[derive(Debug, Clone)]
pub struct TrapezoidalShaper {
    users: u32,
    ramp_rate: f64,
    ramp_down_rate: f64,
    ramp_up: Duration,
    hold_until: Duration,
    peak: u32,
    ramp_down: Duration,
    total: Duration,
}

impl TrapezoidalShaper {
    pub fn new(profile: &LoadProfile) -> Result<Self, ConfigError> {
        profile.validate()?;

        let users = profile.users;
        let ramp_rate = profile.ramp_rate;
        let ramp_down_rate = profile.ramp_down_rate();
        let ramp_up = ramp_time(users, ramp_rate)?;
        let hold_until = profile.duration;

        let peak = if hold_until >= ramp_up {
            users
        } else {
            ramp_level(users, ramp_rate, hold_until)
        };
        let ramp_down = ramp_time(peak, ramp_down_rate)?;
        let total = hold_until
            .checked_add(ramp_down)
            .ok_or(ConfigError::RampTooLong {
                users: peak,
                rate: ramp_down_rate,
            })?;

        Ok(Self {
            users,
            ramp_rate,
            ramp_down_rate,
            ramp_up,
            hold_until,
            peak,
            ramp_down,
            total,
        })
    }

    pub fn ramp_up_duration(&self) -> Duration {
        self.ramp_up.min(self.hold_until)
    }

    pub fn ramp_down_duration(&self) -> Duration {
        self.ramp_down
    }

    pub fn users(&self) -> u32 {
        self.users
    }
}

/// Time to move `users` users at `rate` users per second.
fn ramp_time(users: u32, rate: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(f64::from(users) / rate)
        .map_err(|_| ConfigError::RampTooLong { users, rate })
}

fn ramp_level(users: u32, rate: f64, elapsed: Duration) -> u32 {
    let level = (elapsed.as_secs_f64() * rate).floor();
    if level >= f64::from(users) {
        users
    } else {
        level as u32
    }
}

impl LoadShaper for TrapezoidalShaper {
    fn target_concurrency(&self, elapsed: Duration) -> usize {
        if elapsed < self.hold_until {
            if elapsed >= self.ramp_up {
                return self.users as usize;
            }
            return ramp_level(self.users, self.ramp_rate, elapsed) as usize;
        }

        if elapsed >= self.total_duration() {
            return 0;
        }

        let down = (elapsed - self.hold_until).as_secs_f64();
        let remaining = (f64::from(self.peak) - down * self.ramp_down_rate).floor();
        remaining.max(0.) as usize
    }

    fn total_duration(&self) -> Duration {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn fifty_users_at_five_per_second() {
        let shaper =
            TrapezoidalShaper::new(&LoadProfile::trapezoidal(50, 5., Duration::from_secs(600)))
                .unwrap();

        assert_eq!(shaper.target_concurrency(Duration::ZERO), 0);
        assert_eq!(shaper.target_concurrency(secs(1.)), 5);
        assert_eq!(shaper.target_concurrency(secs(10.)), 50);
        assert_eq!(shaper.target_concurrency(secs(300.)), 50);
        assert_eq!(shaper.target_concurrency(secs(605.)), 25);
        assert_eq!(shaper.target_concurrency(secs(610.)), 0);
        assert_eq!(shaper.total_duration(), secs(610.));
    }

    #[test]
    fn fractional_targets_truncate() {
        let shaper =
            TrapezoidalShaper::new(&LoadProfile::trapezoidal(10, 3., Duration::from_secs(20)))
                .unwrap();
        assert_eq!(shaper.target_concurrency(secs(0.5)), 1);
        assert_eq!(shaper.target_concurrency(secs(3.2)), 9);
        assert_eq!(shaper.target_concurrency(secs(3.5)), 10);
        // 10 - 0.5 * 3 = 8.5
        assert_eq!(shaper.target_concurrency(secs(20.5)), 8);
    }

    #[test]
    fn short_duration_cuts_ramp_up() {
        let shaper =
            TrapezoidalShaper::new(&LoadProfile::trapezoidal(100, 2., Duration::from_secs(10)))
                .unwrap();
        assert_eq!(shaper.target_concurrency(secs(9.9)), 19);
        assert_eq!(shaper.target_concurrency(secs(10.)), 20);
        assert_eq!(shaper.total_duration(), secs(20.));
        assert_eq!(shaper.target_concurrency(secs(15.)), 10);
    }

    #[test]
    fn separate_ramp_down_rate() {
        let profile =
            LoadProfile::trapezoidal(20, 10., Duration::from_secs(5)).with_ramp_down_rate(1.);
        let shaper = TrapezoidalShaper::new(&profile).unwrap();
        assert_eq!(shaper.ramp_down_duration(), secs(20.));
        assert_eq!(shaper.target_concurrency(secs(15.)), 10);
    }

    #[test]
    fn zero_users_stays_at_zero() {
        let shaper =
            TrapezoidalShaper::new(&LoadProfile::trapezoidal(0, 5., Duration::from_secs(10)))
                .unwrap();
        for s in 0..20 {
            assert_eq!(shaper.target_concurrency(secs(s as f64)), 0);
        }
        assert_eq!(shaper.total_duration(), secs(10.));
    }

    #[test]
    fn rejects_invalid_profiles() {
        assert!(matches!(
            TrapezoidalShaper::new(&LoadProfile::trapezoidal(10, 0., Duration::from_secs(1))),
            Err(ConfigError::InvalidRampRate(_))
        ));
        assert!(matches!(
            TrapezoidalShaper::new(&LoadProfile::trapezoidal(10, 1., Duration::ZERO)),
            Err(ConfigError::ZeroDuration)
        ));
    }

    #[test]
    fn unrepresentable_ramps_are_rejected() {
        let crawl = LoadProfile::trapezoidal(1, 1e-30, Duration::from_secs(60));
        assert!(crawl.validate().is_ok());
        assert_eq!(
            TrapezoidalShaper::new(&crawl).unwrap_err(),
            ConfigError::RampTooLong {
                users: 1,
                rate: 1e-30
            }
        );

        let endless_hold = LoadProfile::trapezoidal(10, 1., Duration::MAX);
        assert!(matches!(
            TrapezoidalShaper::new(&endless_hold),
            Err(ConfigError::RampTooLong { users: 10, .. })
        ));

        // A slow ramp-down is fine as long as it fits.
        let slow_down =
            LoadProfile::trapezoidal(10, 1., Duration::from_secs(60)).with_ramp_down_rate(0.5);
        let shaper = TrapezoidalShaper::new(&slow_down).unwrap();
        assert_eq!(shaper.total_duration(), Duration::from_secs(80));
    }

    #[test]
    #[ntest::timeout(10_000)]
    fn phases_are_monotonic_for_random_profiles() {
        let mut rng = SmallRng::seed_from_u64(0x7ea7);
        for _ in 0..200 {
            let users = rng.gen_range(0..500);
            let rate = rng.gen_range(0.1..50.);
            let duration = Duration::from_millis(rng.gen_range(100..120_000));
            let mut profile = LoadProfile::trapezoidal(users, rate, duration);
            if rng.gen_bool(0.5) {
                profile = profile.with_ramp_down_rate(rng.gen_range(0.1..50.));
            }
            let shaper = TrapezoidalShaper::new(&profile).unwrap();
            let total = shaper.total_duration();
            let step = (total / 400).max(Duration::from_millis(1));

            let mut prev_up = 0;
            let mut prev_down = None;
            let mut elapsed = Duration::ZERO;
            while elapsed <= total + step {
                let target = shaper.target_concurrency(elapsed);
                assert!(target <= users as usize, "{profile}: {target} > {users}");

                if elapsed < shaper.ramp_up_duration() {
                    assert!(target >= prev_up, "{profile}: ramp-up decreased at {elapsed:?}");
                    prev_up = target;
                } else if elapsed < duration {
                    assert_eq!(target, users as usize, "{profile}: plateau at {elapsed:?}");
                } else {
                    if let Some(prev) = prev_down {
                        assert!(target <= prev, "{profile}: ramp-down increased at {elapsed:?}");
                    }
                    prev_down = Some(target);
                }

                if elapsed >= total {
                    assert_eq!(target, 0, "{profile}: non-zero after {total:?}");
                }

                elapsed += step;
            }
        }
    }
}
