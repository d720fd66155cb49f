//! Feedback-control building blocks.
//!
//! Small stateful pieces shared by the inputs and the mixer:
//! - [`DeltaT`] - elapsed monotonic time between calls
//! - [`Dampener`] - first-order smoothing with a time constant in seconds
//! - [`RateEstimator`] - smoothed samples-per-second measurement
//! - [`PiController`] - proportional-integral controller with anti-windup
//!
//! Every time-dependent call has an `*_at(now)` form taking an explicit
//! [`Instant`] so the engine can evaluate a whole pass against one timestamp.

use std::time::Instant;

/// Measures the time elapsed between successive calls.
#[derive(Clone, Debug, Default)]
pub struct DeltaT {
    last: Option<Instant>,
}

impl DeltaT {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Seconds since the previous call, `None` on the first call.
    pub fn delta(&mut self) -> Option<f64> {
        self.delta_at(Instant::now())
    }

    /// Like [`delta`](Self::delta) against an explicit timestamp.
    ///
    /// A `now` earlier than the previous call counts as zero elapsed time.
    pub fn delta_at(&mut self, now: Instant) -> Option<f64> {
        let dt = self
            .last
            .map(|last| now.saturating_duration_since(last).as_secs_f64());
        self.last = Some(now);
        dt
    }
}

/// First-order low-pass on a stream of values.
///
/// The first value passes straight through; after that the output moves
/// toward each new value by `dt / time_constant` of the remaining distance.
#[derive(Clone, Debug)]
pub struct Dampener {
    time_constant: f64,
    output: Option<f64>,
    delta_t: DeltaT,
}

impl Dampener {
    /// Create a dampener with the given time constant in seconds.
    pub fn new(time_constant: f64) -> Self {
        Self {
            time_constant,
            output: None,
            delta_t: DeltaT::new(),
        }
    }

    pub fn feed(&mut self, value: f64) {
        self.feed_at(value, Instant::now())
    }

    pub fn feed_at(&mut self, value: f64, now: Instant) {
        if !value.is_finite() {
            return;
        }
        let dt = self.delta_t.delta_at(now);

        self.output = match (self.output, dt) {
            (Some(output), Some(dt)) => {
                // never step past the fed value, however long the gap was
                let k = (dt / self.time_constant).min(1.0);
                Some(output + (value - output) * k)
            }
            _ => Some(value),
        };
    }

    /// Smoothed value, `None` until something has been fed.
    #[inline]
    pub fn output(&self) -> Option<f64> {
        self.output
    }

    #[inline]
    pub fn time_constant(&self) -> f64 {
        self.time_constant
    }
}

/// Estimates a sample rate from sample counts reported over time.
///
/// Each [`feed`](Self::feed) reports how many samples moved since the previous
/// one; the instantaneous rate is smoothed through a [`Dampener`].
#[derive(Clone, Debug)]
pub struct RateEstimator {
    initial_rate: f64,
    delta_t: DeltaT,
    dampener: Dampener,
}

impl RateEstimator {
    pub fn new(initial_rate: f64, damp_time: f64) -> Self {
        Self {
            initial_rate,
            delta_t: DeltaT::new(),
            dampener: Dampener::new(damp_time),
        }
    }

    pub fn feed(&mut self, samples: usize) {
        self.feed_at(samples, Instant::now())
    }

    pub fn feed_at(&mut self, samples: usize, now: Instant) {
        match self.delta_t.delta_at(now) {
            Some(dt) if dt > 0.0 => self.dampener.feed_at(samples as f64 / dt, now),
            // zero-length interval carries no rate information
            Some(_) => {}
            None => self.dampener.feed_at(self.initial_rate, now),
        }
    }

    /// Smoothed rate in samples per second.
    #[inline]
    pub fn rate(&self) -> f64 {
        self.dampener.output().unwrap_or(self.initial_rate)
    }
}

/// Proportional-integral controller.
///
/// The integral time base is one second. When output limits are set and the
/// output hits one, integration is frozen from the next call on until the
/// output comes back inside the limits (anti-windup).
#[derive(Clone, Debug)]
pub struct PiController {
    set_point: f64,
    process_variable: f64,
    p: f64,
    i: f64,
    invert: bool,
    integral: f64,
    min_output: Option<f64>,
    max_output: Option<f64>,
    anti_windup: bool,
    delta_t: DeltaT,
}

impl PiController {
    /// Create a controller with proportional gain `p` and integral gain `i`.
    pub fn new(p: f64, i: f64) -> Self {
        Self {
            set_point: 0.0,
            process_variable: 1.0,
            p,
            i,
            invert: false,
            integral: 0.0,
            min_output: None,
            max_output: None,
            anti_windup: false,
            delta_t: DeltaT::new(),
        }
    }

    /// Invert the response: error becomes `pv - sp` instead of `sp - pv`.
    pub fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }

    /// Clamp the output to `[min, max]`.
    pub fn with_output_limits(mut self, min: f64, max: f64) -> Self {
        self.min_output = Some(min);
        self.max_output = Some(max);
        self
    }

    pub fn with_set_point(mut self, set_point: f64) -> Self {
        self.set_point = set_point;
        self
    }

    #[inline]
    pub fn set_point(&self) -> f64 {
        self.set_point
    }

    #[inline]
    pub fn set_set_point(&mut self, set_point: f64) {
        self.set_point = set_point;
    }

    #[inline]
    pub fn process_variable(&self) -> f64 {
        self.process_variable
    }

    #[inline]
    pub fn set_process_variable(&mut self, pv: f64) {
        self.process_variable = pv;
    }

    /// Accumulated integral term.
    #[inline]
    pub fn integral(&self) -> f64 {
        self.integral
    }

    /// Whether the previous output was clamped, freezing the integral.
    #[inline]
    pub fn is_winding_up(&self) -> bool {
        self.anti_windup
    }

    pub fn output(&mut self) -> f64 {
        self.output_at(Instant::now())
    }

    /// Compute the control variable for the current set point and process
    /// variable.
    pub fn output_at(&mut self, now: Instant) -> f64 {
        let dt = self.delta_t.delta_at(now);
        let error = if self.invert {
            self.process_variable - self.set_point
        } else {
            self.set_point - self.process_variable
        };

        let proportional = error * self.p;
        if let Some(dt) = dt {
            if !self.anti_windup {
                self.integral += error * self.i * dt;
            }
        }

        let raw = proportional + self.integral;
        match (self.min_output, self.max_output) {
            (Some(min), _) if raw < min => {
                self.anti_windup = true;
                min
            }
            (_, Some(max)) if raw > max => {
                self.anti_windup = true;
                max
            }
            _ => {
                self.anti_windup = false;
                raw
            }
        }
    }
}

impl Default for PiController {
    fn default() -> Self {
        Self::new(1.0, 0.0)
    }
}
