use std::{collections::HashMap, path::Path, sync::RwLock};

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use polars::prelude::*;

use crate::{
    datasets::{Dataset, DayType, Exchange},
    envelope::{EventTime, Stamper},
    error::ParseError,
    fetch::TradingDayOracle,
    parse::{
        BulletinParser, ColumnKind, ColumnSpec, TableSpec, date_from_epoch_days, days_since_epoch,
        eod_event_time_ms, read_table,
    },
};

const HOLIDAY_SPEC: TableSpec = TableSpec {
    dataset: "trading_calendar",
    columns: &[
        ColumnSpec::required("Date", "date", ColumnKind::Date("%d-%b-%Y")),
        ColumnSpec::required("Description", "description", ColumnKind::String),
        ColumnSpec::optional("Day", "weekday", ColumnKind::Tag),
        ColumnSpec::optional("Session", "session", ColumnKind::Tag),
    ],
};

/// Parser for exchange holiday bulletins, expanded into a full-year
/// calendar: every date in the bulletin's year is classified TRADING,
/// WEEKEND, HOLIDAY or SPECIAL.
pub struct TradingCalendarParser {
    stamper: Stamper,
    exchange: Exchange,
}

impl TradingCalendarParser {
    pub fn new(stamper: Stamper, exchange: Exchange) -> Self {
        Self { stamper, exchange }
    }
}

impl BulletinParser for TradingCalendarParser {
    fn dataset(&self) -> Dataset {
        Dataset::TradingCalendar
    }

    fn parse(
        &self,
        path: &Path,
        date: NaiveDate,
        ingest_time: DateTime<Utc>,
    ) -> Result<Option<DataFrame>, ParseError> {
        let holidays = read_table(path, &HOLIDAY_SPEC)?;

        let mut special: HashMap<NaiveDate, String> = HashMap::new();
        let mut closed: HashMap<NaiveDate, String> = HashMap::new();
        let dates = holidays.column("date")?.date()?;
        let descriptions = holidays.column("description")?.str()?;
        let sessions = holidays.column("session").ok().map(|c| c.str()).transpose()?;
        for row in 0..holidays.height() {
            let Some(day) = dates.phys.get(row).and_then(date_from_epoch_days) else {
                continue;
            };
            let description = descriptions.get(row).unwrap_or_default().to_string();
            let is_special = sessions
                .as_ref()
                .and_then(|s| s.get(row))
                .is_some_and(|s| s.eq_ignore_ascii_case("special"));
            if is_special {
                special.insert(day, description);
            } else {
                closed.insert(day, description);
            }
        }

        let year = date.year();
        let mut out_dates = Vec::new();
        let mut day_types = Vec::new();
        let mut notes: Vec<Option<String>> = Vec::new();
        let mut day = NaiveDate::from_ymd_opt(year, 1, 1).expect("jan 1 exists");
        while day.year() == year {
            let day_type = classify(day, &special, &closed);
            out_dates.push(days_since_epoch(day));
            day_types.push(day_type.to_string());
            notes.push(special.get(&day).or_else(|| closed.get(&day)).cloned());
            day = day.succ_opt().expect("in-range date");
        }

        let mut df = DataFrame::new(vec![
            Series::new("date".into(), out_dates)
                .cast(&DataType::Date)?
                .into(),
            Series::new("day_type".into(), day_types).into(),
            Series::new("note".into(), notes).into(),
        ])?;
        df.with_column(Series::new(
            "exchange".into(),
            vec![self.exchange.to_string(); df.height()],
        ))?;

        let stamped = self.stamper.stamp_batch(
            df,
            &["exchange", "date"],
            EventTime::Constant(eod_event_time_ms(date)?),
            ingest_time,
        )?;
        Ok(Some(stamped))
    }
}

fn classify(
    day: NaiveDate,
    special: &HashMap<NaiveDate, String>,
    closed: &HashMap<NaiveDate, String>,
) -> DayType {
    if special.contains_key(&day) {
        // Special sessions trade even on weekends (e.g. Muhurat trading).
        DayType::Special
    } else if matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
        DayType::Weekend
    } else if closed.contains_key(&day) {
        DayType::Holiday
    } else {
        DayType::Trading
    }
}

// ================================================================================================
// Materialized calendar
// ================================================================================================

/// In-memory trading calendar the fetcher consults to decide whether a
/// 404 is authoritative. Thread-safe; years are loaded incrementally.
#[derive(Default)]
pub struct TradingCalendar {
    days: RwLock<HashMap<(Exchange, NaiveDate), DayType>>,
}

impl TradingCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a parsed calendar batch (envelope columns are ignored).
    pub fn load_batch(&self, exchange: Exchange, df: &DataFrame) -> Result<(), ParseError> {
        let dates = df.column("date")?.date()?;
        let day_types = df.column("day_type")?.str()?;
        let mut days = self.days.write().expect("calendar lock poisoned");
        for row in 0..df.height() {
            let (Some(date), Some(day_type)) = (
                dates.phys.get(row).and_then(date_from_epoch_days),
                day_types.get(row),
            ) else {
                continue;
            };
            if let Ok(parsed) = day_type.parse::<DayType>() {
                days.insert((exchange, date), parsed);
            }
        }
        Ok(())
    }

    pub fn day_type(&self, exchange: Exchange, date: NaiveDate) -> Option<DayType> {
        self.days
            .read()
            .expect("calendar lock poisoned")
            .get(&(exchange, date))
            .copied()
    }
}

impl TradingDayOracle for TradingCalendar {
    fn is_trading_day(&self, exchange: Exchange, date: NaiveDate) -> Option<bool> {
        self.day_type(exchange, date)
            .map(|d| matches!(d, DayType::Trading | DayType::Special))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::envelope::SchemaVersion;

    fn parse_fixture() -> DataFrame {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("holidays_2024.csv");
        std::fs::write(
            &path,
            "Date,Description,Day,Session\n\
             26-Jan-2024,Republic Day,Friday,\n\
             01-Nov-2024,Diwali Muhurat Trading,Friday,Special\n",
        )
        .unwrap();

        let parser = TradingCalendarParser::new(
            Stamper::new("nse_trading_calendar", SchemaVersion(1)),
            Exchange::Nse,
        );
        parser
            .parse(
                &path,
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 1, 4, 0, 0).unwrap(),
            )
            .unwrap()
            .unwrap()
    }

    #[test]
    fn expands_to_a_full_year() {
        let df = parse_fixture();
        assert_eq!(df.height(), 366, "2024 is a leap year");
    }

    #[test]
    fn classifies_all_four_day_types() {
        let df = parse_fixture();
        let calendar = TradingCalendar::new();
        calendar.load_batch(Exchange::Nse, &df).unwrap();

        let day = |y, m, d| NaiveDate::from_ymd_opt(y, m, d).unwrap();
        assert_eq!(
            calendar.day_type(Exchange::Nse, day(2024, 1, 26)),
            Some(DayType::Holiday)
        );
        assert_eq!(
            calendar.day_type(Exchange::Nse, day(2024, 1, 27)),
            Some(DayType::Weekend)
        );
        assert_eq!(
            calendar.day_type(Exchange::Nse, day(2024, 1, 2)),
            Some(DayType::Trading)
        );
        assert_eq!(
            calendar.day_type(Exchange::Nse, day(2024, 11, 1)),
            Some(DayType::Special)
        );
    }

    #[test]
    fn oracle_answers_none_outside_coverage() {
        let calendar = TradingCalendar::new();
        assert_eq!(
            calendar.is_trading_day(Exchange::Nse, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()),
            None
        );
    }
}
