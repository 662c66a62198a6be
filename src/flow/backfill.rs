use chrono::NaiveDate;
use futures::{StreamExt, stream};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use crate::error::ChampionResult;

/// Expands a date range into independent per-date runs with a bounded
/// parallelism cap.
pub struct Backfill {
    parallelism: usize,
    show_progress: bool,
}

impl Backfill {
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
            show_progress: false,
        }
    }

    pub fn with_progress(mut self) -> Self {
        self.show_progress = true;
        self
    }

    /// Runs `run_date` once per date in `[start, end]` (inclusive) and
    /// returns each date's result. Dates are independent: one failed day
    /// never stops the others.
    pub async fn run<F, Fut, T>(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        run_date: F,
    ) -> Vec<(NaiveDate, ChampionResult<T>)>
    where
        F: Fn(NaiveDate) -> Fut,
        Fut: Future<Output = ChampionResult<T>>,
    {
        let dates = expand_range(start, end);
        info!(
            start = %start,
            end = %end,
            days = dates.len(),
            parallelism = self.parallelism,
            "backfill started"
        );

        let bar = if self.show_progress {
            let bar = ProgressBar::new(dates.len() as u64);
            if let Ok(style) =
                ProgressStyle::with_template("{bar:40} {pos}/{len} days {elapsed_precise}")
            {
                bar.set_style(style);
            }
            Some(bar)
        } else {
            None
        };

        let results: Vec<(NaiveDate, ChampionResult<T>)> = stream::iter(dates)
            .map(|date| {
                let bar = bar.clone();
                let fut = run_date(date);
                async move {
                    let result = fut.await;
                    if let Some(bar) = &bar {
                        bar.inc(1);
                    }
                    (date, result)
                }
            })
            .buffer_unordered(self.parallelism)
            .collect()
            .await;

        if let Some(bar) = bar {
            bar.finish();
        }
        let failures = results.iter().filter(|(_, r)| r.is_err()).count();
        info!(days = results.len(), failures, "backfill finished");
        results
    }
}

fn expand_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let mut day = start;
    while day <= end {
        dates.push(day);
        let Some(next) = day.succ_opt() else { break };
        day = next;
    }
    dates
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::error::{ChampionError, FetchError};

    #[tokio::test]
    async fn covers_every_date_once() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_ref = calls.clone();
        let results = Backfill::new(3)
            .run(start, end, move |_date| {
                let calls = calls_ref.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(results.len(), 10);
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn one_bad_day_does_not_stop_the_rest() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let bad = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();

        let results = Backfill::new(2)
            .run(start, end, move |date| async move {
                if date == bad {
                    Err(ChampionError::from(FetchError::NotFound {
                        source_id: "nse_cm_bhavcopy".to_string(),
                        date: date.to_string(),
                    }))
                } else {
                    Ok(date)
                }
            })
            .await;

        let failures: Vec<_> = results.iter().filter(|(_, r)| r.is_err()).collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, bad);
        assert_eq!(results.iter().filter(|(_, r)| r.is_ok()).count(), 4);
    }

    #[test]
    fn range_is_inclusive() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(expand_range(day, day).len(), 1);
    }
}
