/**
 * MOTEUR DE VARIATION - Évolution des lectures entre deux publications
 *
 * RÔLE : Bruit uniforme borné sur température / produit / eau, puis tendance
 * de consommation sur le produit, puis clamp dans les plages physiques.
 *
 * ROBUSTESSE : aucune entrée (variance énorme, NaN) ne fait paniquer le
 * tirage ; le scheduler appelle ce module sous le verrou partagé.
 */

use crate::models::{Reading, VariationProfile, PRODUCT_RANGE, TEMP_RANGE, WATER_RANGE};
use rand::Rng;

/// Applique variation puis tendance à `reading`, `elapsed_secs` servant de base
/// de temps pour la consommation.
pub fn evolve<R: Rng + ?Sized>(
    reading: &mut Reading,
    profile: &VariationProfile,
    elapsed_secs: f64,
    rng: &mut R,
) {
    if profile.auto_variation {
        apply_noise(reading, profile, rng);
    }
    if profile.simulate_trend {
        apply_trend(reading, profile.consumption_rate, elapsed_secs);
    }
    clamp(reading);
}

fn apply_noise<R: Rng + ?Sized>(reading: &mut Reading, profile: &VariationProfile, rng: &mut R) {
    reading.temperature += delta(rng, profile.temp_variance);
    reading.product_level += delta(rng, profile.product_variance);
    reading.water_level += delta(rng, profile.water_variance);
}

fn delta<R: Rng + ?Sized>(rng: &mut R, variance: f64) -> f64 {
    let variance = variance.abs();
    if variance == 0.0 || !variance.is_finite() {
        return 0.0;
    }
    // tirage sur [-1, 1] puis mise à l'échelle : `-v..=v` déborde pour v > f64::MAX / 2
    rng.random_range(-1.0..=1.0) * variance
}

fn apply_trend(reading: &mut Reading, rate_per_minute: f64, elapsed_secs: f64) {
    let drawdown = rate_per_minute / 60.0 * elapsed_secs.max(0.0);
    if !drawdown.is_finite() {
        return;
    }
    reading.product_level = (reading.product_level - drawdown).max(0.0);
}

pub fn clamp(reading: &mut Reading) {
    reading.temperature = reading.temperature.clamp(TEMP_RANGE.0, TEMP_RANGE.1);
    reading.product_level = reading.product_level.clamp(PRODUCT_RANGE.0, PRODUCT_RANGE.1);
    reading.water_level = reading.water_level.clamp(WATER_RANGE.0, WATER_RANGE.1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn trend_only(rate: f64) -> VariationProfile {
        VariationProfile { simulate_trend: true, consumption_rate: rate, ..Default::default() }
    }

    #[test]
    fn test_ranges_hold_under_heavy_noise() {
        let mut rng = StdRng::seed_from_u64(7);
        let profile = VariationProfile {
            auto_variation: true,
            temp_variance: 50.0,
            product_variance: 900.0,
            water_variance: 40.0,
            simulate_trend: true,
            consumption_rate: 120.0,
        };
        let mut reading = Reading::default();
        for _ in 0..5_000 {
            evolve(&mut reading, &profile, 2.0, &mut rng);
            assert!((-20.0..=60.0).contains(&reading.temperature));
            assert!((0.0..=3000.0).contains(&reading.product_level));
            assert!((0.0..=100.0).contains(&reading.water_level));
        }
    }

    #[test]
    fn test_trend_one_minute() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut reading = Reading { product_level: 1000.0, ..Default::default() };
        evolve(&mut reading, &trend_only(0.5), 60.0, &mut rng);
        assert!((reading.product_level - 999.5).abs() < 1e-9);
    }

    #[test]
    fn test_trend_never_below_zero() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut reading = Reading { product_level: 3.0, ..Default::default() };
        evolve(&mut reading, &trend_only(600.0), 60.0, &mut rng);
        assert_eq!(reading.product_level, 0.0);
    }

    #[test]
    fn test_no_flags_leaves_reading_untouched() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut reading = Reading { status: "4".into(), request_type: 2, ..Default::default() };
        let before = reading.clone();
        evolve(&mut reading, &VariationProfile::default(), 3600.0, &mut rng);
        assert_eq!(reading, before);
    }

    #[test]
    fn test_extreme_profile_does_not_panic() {
        let mut rng = StdRng::seed_from_u64(5);
        let profile = VariationProfile {
            auto_variation: true,
            temp_variance: 1e308,
            product_variance: f64::MAX,
            water_variance: f64::NAN,
            simulate_trend: true,
            consumption_rate: f64::INFINITY,
        };
        let mut reading = Reading::default();
        for _ in 0..100 {
            evolve(&mut reading, &profile, 1.0, &mut rng);
            assert!((-20.0..=60.0).contains(&reading.temperature));
            assert!((0.0..=3000.0).contains(&reading.product_level));
            assert_eq!(reading.water_level, 12.98);
        }
    }

    #[test]
    fn test_noise_stays_within_variance() {
        let mut rng = StdRng::seed_from_u64(11);
        let profile = VariationProfile { auto_variation: true, ..Default::default() };
        for _ in 0..200 {
            let mut reading = Reading::default();
            evolve(&mut reading, &profile, 1.0, &mut rng);
            assert!((reading.temperature - 25.13).abs() <= 0.5 + 1e-9);
            assert!((reading.product_level - 1230.0).abs() <= 2.0 + 1e-9);
            assert!((reading.water_level - 12.98).abs() <= 0.5 + 1e-9);
        }
    }
}
