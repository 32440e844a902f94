//! Periodic triggers for ingestion and export.
//!
//! Every invocation runs in its own tokio task. The triggering loop never
//! awaits a job, so a slow or failing job cannot delay or stop later ticks.
//! Jobs report their own errors; panics end only the task they happen in.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::export::archive::ArchiveClient;
use crate::export::Exporter;
use crate::ingest::Ingestor;

/// Timer settings
#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    /// Ingestion cadence
    pub ingest_interval: Duration,
    /// Daily export trigger, evaluated in `timezone`
    pub export_schedule: Schedule,
    /// Publication timezone of the dataset
    pub timezone: Tz,
}

/// Drives the ingestion ticker and the daily export trigger.
pub struct Scheduler<A> {
    ingestor: Arc<Ingestor>,
    exporter: Arc<Exporter<A>>,
    settings: ScheduleSettings,
}

impl<A: ArchiveClient + 'static> Scheduler<A> {
    pub fn new(
        ingestor: Arc<Ingestor>,
        exporter: Arc<Exporter<A>>,
        settings: ScheduleSettings,
    ) -> Self {
        Self {
            ingestor,
            exporter,
            settings,
        }
    }

    /// Run both timers until `shutdown` flips.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!(
            ingest_interval = ?self.settings.ingest_interval,
            export_schedule = %self.settings.export_schedule,
            timezone = %self.settings.timezone,
            "Starting scheduler"
        );

        let ingestor = self.ingestor;
        let ingest = run_every(
            self.settings.ingest_interval,
            "ingest",
            move || {
                let ingestor = Arc::clone(&ingestor);
                async move {
                    ingestor.run_cycle().await;
                }
            },
            shutdown.clone(),
        );

        let exporter = self.exporter;
        let export = run_daily(
            self.settings.export_schedule,
            self.settings.timezone,
            "export",
            move || {
                let exporter = Arc::clone(&exporter);
                async move {
                    daily_export(&exporter).await;
                }
            },
            shutdown,
        );

        tokio::join!(ingest, export);
        info!("Scheduler stopped");
    }
}

/// Export yesterday and log the outcome. Returns whether both entities
/// reached the archive.
async fn daily_export<A: ArchiveClient>(exporter: &Exporter<A>) -> bool {
    match exporter.export_yesterday().await {
        Ok(report) if report.is_success() => true,
        Ok(report) => {
            warn!(date = %report.window.date, "Daily export incomplete");
            false
        }
        Err(e) => {
            error!(error = %e, "Daily export could not start");
            false
        }
    }
}

/// Spawn `job` every `period` without waiting for earlier invocations.
///
/// Missed ticks (e.g. after the process was suspended) are skipped, not
/// replayed in a burst.
pub async fn run_every<F, Fut>(
    period: Duration,
    name: &'static str,
    mut job: F,
    mut shutdown: watch::Receiver<bool>,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let in_flight = Arc::new(AtomicUsize::new(0));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let running = in_flight.fetch_add(1, Ordering::Relaxed);
                if running > 0 {
                    debug!(job = name, in_flight = running + 1, "Overlapping invocation");
                }
                let in_flight = Arc::clone(&in_flight);
                let run = job();
                spawn_guarded(name, async move {
                    job_with_counter(in_flight, run).await;
                });
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn job_with_counter<Fut: Future<Output = ()>>(in_flight: Arc<AtomicUsize>, job: Fut) {
    struct Done(Arc<AtomicUsize>);
    impl Drop for Done {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::Relaxed);
        }
    }

    // Decrements on completion and on panic alike
    let _done = Done(in_flight);
    job.await;
}

/// Spawn `job` at every upcoming time of `schedule` in `tz`.
pub async fn run_daily<F, Fut>(
    schedule: Schedule,
    tz: Tz,
    name: &'static str,
    job: F,
    shutdown: watch::Receiver<bool>,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    run_on_schedule(schedule, tz, name, job, shutdown, Utc::now).await;
}

/// [`run_daily`] with the wall clock supplied by `clock`.
pub async fn run_on_schedule<F, Fut, C>(
    schedule: Schedule,
    tz: Tz,
    name: &'static str,
    mut job: F,
    mut shutdown: watch::Receiver<bool>,
    clock: C,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
    C: Fn() -> DateTime<Utc>,
{
    let mut last_fired: Option<DateTime<Utc>> = None;

    loop {
        let now = clock();
        // Never schedule at or before the last fire time, even if the wall
        // clock lags the timer slightly.
        let from = match last_fired {
            Some(last) if last > now => last,
            _ => now,
        };
        let Some(next) = next_fire(&schedule, tz, from) else {
            warn!(job = name, "Schedule has no upcoming run, stopping trigger");
            break;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        info!(job = name, next = %next, "Next run scheduled");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                last_fired = Some(next);
                spawn_guarded(name, job());
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// First time of `schedule` strictly after `now`, evaluated in `tz`.
pub fn next_fire(schedule: &Schedule, tz: Tz, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&now.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Spawn a job and report if it panicked.
fn spawn_guarded<Fut>(name: &'static str, job: Fut)
where
    Fut: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(job);
    tokio::spawn(async move {
        if let Err(e) = handle.await {
            if e.is_panic() {
                error!(job = name, "Scheduled job panicked");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn export_schedule() -> Schedule {
        Schedule::from_str("0 1 1 * * *").unwrap()
    }

    #[test]
    fn test_next_fire_winter() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let next = next_fire(&export_schedule(), chrono_tz::Europe::Paris, now).unwrap();
        // 01:01 in Paris is 00:01 UTC in winter
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 2, 0, 1, 0).unwrap());
    }

    #[test]
    fn test_next_fire_summer() {
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap();
        let next = next_fire(&export_schedule(), chrono_tz::Europe::Paris, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 7, 1, 23, 1, 0).unwrap());
    }

    #[test]
    fn test_next_fire_is_strictly_after() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 0, 1, 0).unwrap();
        let next = next_fire(&export_schedule(), chrono_tz::Europe::Paris, at).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 3, 0, 1, 0).unwrap());
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_job_does_not_stop_ticker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(false);

        let counter = Arc::clone(&calls);
        let ticker = tokio::spawn(run_every(
            Duration::from_secs(1),
            "test",
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n % 2 == 0 {
                        panic!("job {n} failed");
                    }
                }
            },
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        tx.send(true).unwrap();
        ticker.await.unwrap();
        settle().await;

        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_job_does_not_delay_next_tick() {
        let started = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(false);

        let counter = Arc::clone(&started);
        let ticker = tokio::spawn(run_every(
            Duration::from_secs(1),
            "test",
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
            },
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        settle().await;
        // Each job is still sleeping, yet every tick started a new one
        assert!(started.load(Ordering::SeqCst) >= 3);

        tx.send(true).unwrap();
        ticker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_scheduled_job_keeps_firing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(false);

        // Wall clock that follows tokio's paused time
        let origin = tokio::time::Instant::now();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = move || start + chrono::TimeDelta::from_std(origin.elapsed()).unwrap();

        let counter = Arc::clone(&calls);
        let trigger = tokio::spawn(run_on_schedule(
            Schedule::from_str("* * * * * *").unwrap(),
            chrono_tz::UTC,
            "test",
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("first export failed");
                    }
                }
            },
            rx,
            clock,
        ));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        settle().await;
        tx.send(true).unwrap();
        trigger.await.unwrap();
        settle().await;

        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    struct RejectingArchive;

    impl ArchiveClient for RejectingArchive {
        async fn put_file(
            &self,
            _owner: &str,
            _repo: &str,
            _path: &str,
            _message: &str,
            _content: String,
        ) -> Result<(), crate::export::archive::ArchiveError> {
            Err(crate::export::archive::ArchiveError::HttpStatus {
                status: 403,
                message: "Resource not accessible".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_daily_export_reports_archive_failure() {
        let db = crate::storage::Database::open(":memory:").await.unwrap();
        let target = crate::export::ExportTarget {
            owner: "owner".to_string(),
            repo: "dataset".to_string(),
        };
        let exporter = Exporter::new(db, RejectingArchive, target, chrono_tz::UTC);

        assert!(!daily_export(&exporter).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_daily_trigger() {
        let (tx, rx) = watch::channel(false);
        let trigger = tokio::spawn(run_daily(
            export_schedule(),
            chrono_tz::Europe::Paris,
            "test",
            || async {},
            rx,
        ));

        tx.send(true).unwrap();
        trigger.await.unwrap();
    }
}
