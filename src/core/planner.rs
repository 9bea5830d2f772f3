use chrono::{DateTime, Utc};

/// Minimum average power required to reach `target_soc` by `deadline`.
///
/// Returns an advisory floor in watts, never a command: the loadpoint takes
/// the greater of this and its surplus-derived target, capped at the
/// charger's maximum. A deadline in the past means full power immediately.
/// A target at or below the current SoC yields no floor (remaining energy
/// clamps to zero).
pub fn required_power_w(
    current_soc: f64,
    target_soc: f64,
    capacity_kwh: f64,
    deadline: DateTime<Utc>,
    charger_max_power_w: f64,
    now: DateTime<Utc>,
) -> f64 {
    let remaining_wh = (capacity_kwh * 1000.0 * (target_soc - current_soc) / 100.0).max(0.0);
    if remaining_wh == 0.0 {
        return 0.0;
    }

    let remaining = deadline - now;
    let remaining_secs = remaining.num_seconds();
    if remaining_secs <= 0 {
        return charger_max_power_w;
    }

    let required_w = remaining_wh * 3600.0 / remaining_secs as f64;
    required_w.min(charger_max_power_w)
}

/// Energy still to be charged in kWh, clamped at zero when the target is
/// already met.
pub fn remaining_energy_kwh(current_soc: f64, target_soc: f64, capacity_kwh: f64) -> f64 {
    (capacity_kwh * (target_soc - current_soc) / 100.0).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rstest::rstest;

    #[test]
    fn half_to_eighty_percent_in_two_hours() {
        let now = Utc::now();
        let floor = required_power_w(50.0, 80.0, 60.0, now + Duration::hours(2), 11000.0, now);
        // 60 kWh * 30% over 2 h = 9 kW
        assert!((floor - 9000.0).abs() < 1.0);
    }

    #[test]
    fn deadline_passed_requires_full_power() {
        let now = Utc::now();
        let floor = required_power_w(50.0, 80.0, 60.0, now - Duration::minutes(5), 11000.0, now);
        assert_eq!(floor, 11000.0);
    }

    #[test]
    fn floor_clamped_to_charger_maximum() {
        let now = Utc::now();
        let floor = required_power_w(0.0, 100.0, 100.0, now + Duration::hours(1), 11000.0, now);
        assert_eq!(floor, 11000.0);
    }

    #[rstest]
    #[case(80.0, 80.0)]
    #[case(90.0, 80.0)]
    fn target_at_or_below_soc_yields_no_floor(#[case] soc: f64, #[case] target: f64) {
        let now = Utc::now();
        let floor = required_power_w(soc, target, 60.0, now + Duration::hours(2), 11000.0, now);
        assert_eq!(floor, 0.0);
    }

    #[test]
    fn remaining_energy_clamps_at_zero() {
        assert_eq!(remaining_energy_kwh(50.0, 80.0, 60.0), 18.0);
        assert_eq!(remaining_energy_kwh(90.0, 80.0, 60.0), 0.0);
    }
}
