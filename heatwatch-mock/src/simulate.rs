use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Process temperature in °C over the day: warm-up in the morning, peak at noon.
pub fn simulated_temperature<R: Rng + ?Sized>(
    day_fraction: f64,
    min_temp: f64,
    max_temp: f64,
    rng: &mut R,
) -> f64 {
    let radians = day_fraction * 2.0 * std::f64::consts::PI;
    let middle = (min_temp + max_temp) / 2.0;
    let amplitude = (max_temp - min_temp) / 4.0;

    // sine peaks at day_fraction 0.5 after the phase shift
    let curve = middle + (radians - std::f64::consts::FRAC_PI_2).sin() * amplitude;

    match Normal::new(0.0, 1.5) {
        Ok(noise) => curve + noise.sample(rng),
        Err(_) => curve,
    }
}

/// A reading above the upper limit, as seen when a burner overshoots.
pub fn excursion<R: Rng + ?Sized>(max_temp: f64, rng: &mut R) -> f64 {
    max_temp + rng.random_range(2.0..15.0)
}

pub fn simulated_humidity<R: Rng + ?Sized>(day_fraction: f64, rng: &mut R) -> f64 {
    let radians = day_fraction * 2.0 * std::f64::consts::PI;

    let base = if (0.3..=0.7).contains(&day_fraction) {
        (radians.sin().max(0.0) * 25.0) + 55.0
    } else {
        (radians.cos().max(0.0) * 30.0) + 50.0
    };

    (base + rng.random_range(-2.0..2.0)).clamp(0.0, 100.0)
}
