//! Stateful aquarium sensor simulator for local development.
//!
//! Models plausible tank behaviour:
//! - Temporal coherence via random walk with mean reversion
//! - Slight water heating while the UV lamp is on
//! - Per-reading electronic noise
//! - Occasional spikes (sensor flakiness)

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Hovers near the setpoints.  Low noise, rare spikes.  Default.
    Stable,
    /// High noise, ~8% spike rate.  Exercises the hub's tolerance for
    /// jittery readings.
    Flaky,
    /// Warm tank drifting upward, pH slowly acidifying.  Exercises the
    /// dashboard with values away from the midpoints.
    Summer,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "flaky" => Self::Flaky,
            "summer" => Self::Summer,
            _ => Self::Stable,
        }
    }

    fn temp_setpoint(self) -> f64 {
        match self {
            Self::Stable | Self::Flaky => 25.0,
            Self::Summer => 28.5,
        }
    }

    fn ph_setpoint(self) -> f64 {
        match self {
            Self::Stable | Self::Flaky => 7.0,
            Self::Summer => 6.6,
        }
    }

    fn noise_sigma(self) -> f64 {
        match self {
            Self::Stable | Self::Summer => 0.03,
            Self::Flaky => 0.15,
        }
    }

    fn spike_chance(self) -> f64 {
        match self {
            Self::Stable | Self::Summer => 0.01,
            Self::Flaky => 0.08,
        }
    }
}

// ---------------------------------------------------------------------------
// Tank simulation
// ---------------------------------------------------------------------------

/// Fraction of the distance to the setpoint recovered per step.
const MEAN_REVERSION: f64 = 0.05;

/// Degrees added per step while the UV lamp is running.
const UV_HEATING_PER_STEP: f64 = 0.02;

pub struct TankSim {
    scenario: Scenario,
    temp_c: f64,
    ph: f64,
}

impl TankSim {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            scenario,
            temp_c: scenario.temp_setpoint(),
            ph: scenario.ph_setpoint(),
        }
    }

    /// Advance the simulation one step.
    pub fn step(&mut self, uv_on: bool) {
        let s = self.scenario;

        self.temp_c += MEAN_REVERSION * (s.temp_setpoint() - self.temp_c);
        self.temp_c += gaussian(0.0, s.noise_sigma());
        if uv_on {
            self.temp_c += UV_HEATING_PER_STEP;
        }
        self.temp_c = self.temp_c.clamp(15.0, 35.0);

        self.ph += MEAN_REVERSION * (s.ph_setpoint() - self.ph);
        self.ph += gaussian(0.0, s.noise_sigma() * 0.4);
        self.ph = self.ph.clamp(5.0, 9.0);
    }

    /// A single reading, with per-read noise and the occasional spike.
    pub fn read(&self) -> (f32, f32) {
        let s = self.scenario;
        let mut temp = gaussian(self.temp_c, s.noise_sigma());
        let mut ph = gaussian(self.ph, s.noise_sigma() * 0.4);

        if fastrand::f64() < s.spike_chance() {
            temp += gaussian(0.0, 2.0);
            ph += gaussian(0.0, 0.5);
        }

        (temp as f32, ph as f32)
    }

    /// Fake pH probe voltage for the raw sensor endpoint.
    pub fn ph_voltage(&self) -> f32 {
        // Typical analog pH boards output ~0.18V per pH unit around 2.5V.
        (2.5 + (7.0 - self.ph) * 0.18) as f32
    }
}

// ===========================================================================
// Tests
// ===========================================================================
