//! conductor-loadavg
//!
//! Exponentially decaying counter of in-flight claims. `load` is the current
//! in-flight count; `echo` is a decaying residual that smooths removals so
//! observed load falls gradually instead of stepping down instantly.

use std::time::Instant;

/// `half_life` of 60 seconds matches the original's default and the
/// cold-shutdown / bottom-floor timings in `conductor-backend`'s
/// `manage_size`.
pub const DEFAULT_HALF_LIFE_SECS: f64 = 60.0;

pub struct LoadAverage {
    half_life: f64,
    alpha: f64,
    load: f64,
    echo: f64,
    start_time: Instant,
    last_change: Instant,
    last_echo_update: Instant,
}

impl LoadAverage {
    pub fn new(half_life_secs: f64) -> Self {
        assert!(half_life_secs > 0.0, "half_life must be > 0");
        let now = Instant::now();
        Self {
            half_life: half_life_secs,
            alpha: 0.5f64.powf(1.0 / half_life_secs),
            load: 0.0,
            echo: 0.0,
            start_time: now,
            last_change: now,
            last_echo_update: now,
        }
    }

    /// Observable load: current load plus the decayed echo term.
    pub fn load(&self) -> f64 {
        let elapsed = self.last_echo_update.elapsed().as_secs_f64();
        let echo = self.echo * self.alpha.powf(elapsed);
        self.load + echo
    }

    pub fn time_since_change(&self) -> std::time::Duration {
        self.last_change.elapsed()
    }

    pub fn time_running(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    pub fn half_life(&self) -> f64 {
        self.half_life
    }

    fn update_echo(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_echo_update).as_secs_f64();
        self.echo *= self.alpha.powf(elapsed);
        self.last_echo_update = now;
    }

    /// Move `amount` (>=0) of mass from echo into load.
    pub fn add(&mut self, amount: f64) {
        assert!(amount >= 0.0, "add amount must be >= 0");
        let now = Instant::now();
        self.last_change = now;
        self.update_echo(now);
        self.load += amount;
        self.echo -= amount;
        if self.echo < 0.0 {
            self.echo = 0.0;
        }
    }

    /// Move `amount` (>=0, clamped to current load) of mass from load back
    /// into echo, where it decays away smoothly.
    pub fn remove(&mut self, amount: f64) {
        assert!(amount >= 0.0, "remove amount must be >= 0");
        let now = Instant::now();
        self.last_change = now;
        let amount = amount.min(self.load);
        self.update_echo(now);
        self.load -= amount;
        self.echo += amount;
    }

    pub fn adjust(&mut self, delta: f64) {
        if delta > 0.0 {
            self.add(delta);
        } else {
            self.remove(-delta);
        }
    }

    pub fn set(&mut self, load: f64) {
        self.adjust(load - self.load);
    }
}

impl Default for LoadAverage {
    fn default() -> Self {
        Self::new(DEFAULT_HALF_LIFE_SECS)
    }
}
