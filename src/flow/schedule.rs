use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::{ChampionResult, ConfigError};

/// Cron trigger authored in the deployment timezone (default IST) and
/// evaluated in UTC.
///
/// Expressions use the seven-field cron form, e.g. weekdays at 18:00
/// IST: `0 0 18 * * Mon-Fri *`.
pub struct FlowSchedule {
    schedule: Schedule,
    tz: Tz,
}

impl FlowSchedule {
    pub fn new(expr: &str, tz: Tz) -> ChampionResult<Self> {
        let schedule = Schedule::from_str(expr).map_err(|e| ConfigError::Cron {
            expr: expr.to_string(),
            msg: e.to_string(),
        })?;
        Ok(Self { schedule, tz })
    }

    /// Next fire time strictly after `after`, in UTC.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.tz))
            .next()
            .map(|local| local.with_timezone(&Utc))
    }

    /// The next `n` fire times after `after`, in UTC.
    pub fn upcoming(&self, after: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.tz))
            .take(n)
            .map(|local| local.with_timezone(&Utc))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use chrono_tz::Asia::Kolkata;

    use super::*;

    #[test]
    fn weekday_six_pm_ist_translates_to_utc() {
        let schedule = FlowSchedule::new("0 0 18 * * Mon-Fri *", Kolkata).unwrap();
        // Tuesday 2024-01-02 00:00 UTC.
        let after = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let next = schedule.next_after(after).unwrap();
        // 18:00 IST == 12:30 UTC.
        assert_eq!(
            next.format("%Y-%m-%d %H:%M").to_string(),
            "2024-01-02 12:30"
        );
    }

    #[test]
    fn weekends_are_skipped() {
        let schedule = FlowSchedule::new("0 0 18 * * Mon-Fri *", Kolkata).unwrap();
        // Friday 2024-01-05 19:00 IST: the next weekday slot is Monday.
        let after = Utc.with_ymd_and_hms(2024, 1, 5, 14, 0, 0).unwrap();
        let next = schedule.next_after(after).unwrap();
        assert_eq!(next.format("%Y-%m-%d").to_string(), "2024-01-08");
    }

    #[test]
    fn invalid_expressions_are_config_errors() {
        let err = FlowSchedule::new("every full moon", Kolkata).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn upcoming_returns_consecutive_slots() {
        let schedule = FlowSchedule::new("0 0 18 * * Mon-Fri *", Kolkata).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let slots = schedule.upcoming(after, 5);
        assert_eq!(slots.len(), 5);
        assert!(slots.windows(2).all(|w| w[0] < w[1]));
    }
}
