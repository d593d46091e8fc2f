use chrono::{DateTime, Utc};

/// Whole minutes between `start` and `end`, rounded down. Never negative.
pub fn billable_minutes(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_milliseconds().max(0) / 60_000
}

/// Amount owed for `minutes` at `rate_per_hour`, rounded to cents.
pub fn amount_due(minutes: i64, rate_per_hour: f64) -> f64 {
    round_cents(minutes as f64 / 60.0 * rate_per_hour)
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_partial_minutes_are_dropped() {
        let start = Utc::now();
        assert_eq!(billable_minutes(start, start + Duration::seconds(59)), 0);
        assert_eq!(billable_minutes(start, start + Duration::milliseconds(90 * 60_000 + 59_999)), 90);
        assert_eq!(billable_minutes(start, start - Duration::minutes(3)), 0);
    }

    #[test]
    fn test_amount_is_rounded_to_cents() {
        assert_eq!(amount_due(90, 100.0), 150.0);
        assert_eq!(amount_due(1, 100.0), 1.67);
        assert_eq!(amount_due(20, 125.0), 41.67);
        assert_eq!(amount_due(0, 250.0), 0.0);
    }
}
