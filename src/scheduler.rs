//! Named periodic jobs.
//!
//! Each registered job gets its own tokio loop that sleeps until the next
//! occurrence of its [`Cadence`] and then spawns one run. A job never has
//! more than one run in flight: a tick that finds the previous run still
//! executing is skipped, not queued. Job errors are logged and counted here
//! and never reach other jobs.

use crate::error::{DbError, DbResult};
use crate::metrics::MetricsSink;
use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime, Utc, Weekday};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type JobFuture = Pin<Box<dyn Future<Output = DbResult<()>> + Send>>;
pub type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// When a job fires. All calendar cadences are in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Every `n` seconds, aligned to multiples of `n` since the UNIX epoch
    Interval(Duration),
    Daily {
        hour: u32,
        minute: u32,
    },
    Weekly {
        weekday: Weekday,
        hour: u32,
        minute: u32,
    },
    /// `day` is clamped to 1..=28 so every month has it
    Monthly {
        day: u32,
        hour: u32,
        minute: u32,
    },
}

impl Cadence {
    pub fn every(period: Duration) -> Self {
        Self::Interval(period)
    }

    pub fn daily(hour: u32, minute: u32) -> Self {
        Self::Daily { hour, minute }
    }

    pub fn weekly(weekday: Weekday, hour: u32, minute: u32) -> Self {
        Self::Weekly {
            weekday,
            hour,
            minute,
        }
    }

    pub fn monthly(day: u32, hour: u32, minute: u32) -> Self {
        Self::Monthly { day, hour, minute }
    }

    /// The first occurrence strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Self::Interval(period) => {
                let secs = period.as_secs().max(1) as i64;
                let next = (now.timestamp().div_euclid(secs) + 1) * secs;
                DateTime::from_timestamp(next, 0).unwrap_or(now + period)
            }
            Self::Daily { hour, minute } => {
                let candidate = at(now.date_naive(), hour, minute);
                if candidate > now {
                    candidate
                } else {
                    candidate + Days::new(1)
                }
            }
            Self::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let ahead = (7 + weekday.num_days_from_monday()
                    - now.weekday().num_days_from_monday())
                    % 7;
                let candidate = at(now.date_naive() + Days::new(ahead.into()), hour, minute);
                if candidate > now {
                    candidate
                } else {
                    candidate + Days::new(7)
                }
            }
            Self::Monthly { day, hour, minute } => {
                let day = day.clamp(1, 28);
                let this_month = NaiveDate::from_ymd_opt(now.year(), now.month(), day)
                    .unwrap_or_else(|| now.date_naive());
                let candidate = at(this_month, hour, minute);
                if candidate > now {
                    candidate
                } else {
                    candidate + Months::new(1)
                }
            }
        }
    }
}

fn at(date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour.min(23), minute.min(59), 0).unwrap_or(NaiveTime::MIN);
    date.and_time(time).and_utc()
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interval(period) => write!(f, "every {}s", period.as_secs()),
            Self::Daily { hour, minute } => write!(f, "daily at {hour:02}:{minute:02} UTC"),
            Self::Weekly {
                weekday,
                hour,
                minute,
            } => write!(f, "weekly on {weekday:?} at {hour:02}:{minute:02} UTC"),
            Self::Monthly { day, hour, minute } => {
                write!(f, "monthly on day {day} at {hour:02}:{minute:02} UTC")
            }
        }
    }
}

/// What happened when a tick fired.
#[derive(Debug)]
pub enum TickOutcome {
    /// A run was spawned; the handle completes when the run does
    Started(JoinHandle<()>),
    /// The previous run was still executing
    Skipped,
}

impl TickOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// Counters for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStats {
    pub started: u64,
    pub skipped: u64,
    pub failed: u64,
}

struct Job {
    name: String,
    cadence: Cadence,
    run: JobFn,
    running: AtomicBool,
    started: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Clears the running flag when a run ends, including on panic.
struct RunningGuard(Arc<Job>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

/// Owns the named jobs and their loops.
pub struct Scheduler {
    jobs: Vec<Arc<Job>>,
    metrics: Arc<dyn MetricsSink>,
    shutdown: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            jobs: Vec::new(),
            metrics,
            shutdown,
            loops: Vec::new(),
        }
    }

    /// Register a job. Registering an existing name replaces that job.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, cadence: Cadence, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DbResult<()>> + Send + 'static,
    {
        let name = name.into();
        let run: JobFn = Arc::new(move || Box::pin(job()) as JobFuture);
        self.jobs.retain(|j| j.name != name);
        debug!(job = %name, cadence = %cadence, "Registered job");
        self.jobs.push(Arc::new(Job {
            name,
            cadence,
            run,
            running: AtomicBool::new(false),
            started: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }));
    }

    /// Registered job names, in registration order.
    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.name.as_str()).collect()
    }

    pub fn cadence(&self, name: &str) -> Option<Cadence> {
        self.find(name).map(|j| j.cadence)
    }

    pub fn stats(&self, name: &str) -> Option<JobStats> {
        self.find(name).map(|j| JobStats {
            started: j.started.load(Ordering::Relaxed),
            skipped: j.skipped.load(Ordering::Relaxed),
            failed: j.failed.load(Ordering::Relaxed),
        })
    }

    /// Spawn one loop per registered job. Calling it again has no effect.
    pub fn start(&mut self) {
        if !self.loops.is_empty() {
            return;
        }
        // Allow a restart after stop()
        self.shutdown.send_replace(false);

        for job in &self.jobs {
            let job = Arc::clone(job);
            let metrics = Arc::clone(&self.metrics);
            let shutdown = self.shutdown.subscribe();
            info!(job = %job.name, cadence = %job.cadence, "Scheduling job");
            self.loops.push(tokio::spawn(run_loop(job, metrics, shutdown)));
        }
    }

    /// Fire a job now, under the same single-flight guard as its schedule.
    pub fn trigger(&self, name: &str) -> DbResult<TickOutcome> {
        let job = self
            .find(name)
            .ok_or_else(|| DbError::invalid_input(format!("Unknown job '{name}'")))?;
        Ok(fire(job, &self.metrics))
    }

    /// Stop every loop. Runs already in flight finish first.
    pub async fn stop(&mut self) {
        self.shutdown.send_replace(true);
        for handle in self.loops.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler loop ended abnormally");
            }
        }
        info!("Scheduler stopped");
    }

    fn find(&self, name: &str) -> Option<&Arc<Job>> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

async fn run_loop(job: Arc<Job>, metrics: Arc<dyn MetricsSink>, mut shutdown: watch::Receiver<bool>) {
    let mut in_flight: Option<JoinHandle<()>> = None;
    let mut last_fired: Option<DateTime<Utc>> = None;

    while !*shutdown.borrow() {
        let now = Utc::now();
        let next = next_tick(&job.cadence, now, last_fired);
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                last_fired = Some(next);
                if let TickOutcome::Started(handle) = fire(&job, &metrics) {
                    in_flight = Some(handle);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(handle) = in_flight {
        if !handle.is_finished() {
            info!(job = %job.name, "Waiting for in-flight run");
        }
        let _ = handle.await;
    }
}

/// Next boundary strictly after both `now` and the boundary that last fired.
///
/// The sleep runs on the monotonic clock, so the wall clock may still read
/// just before the boundary that fired.
pub fn next_tick(
    cadence: &Cadence,
    now: DateTime<Utc>,
    last_fired: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    let from = last_fired.map_or(now, |fired| fired.max(now));
    cadence.next_after(from)
}

fn fire(job: &Arc<Job>, metrics: &Arc<dyn MetricsSink>) -> TickOutcome {
    if job
        .running
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        job.skipped.fetch_add(1, Ordering::Relaxed);
        metrics.increment(&format!("scheduler.{}.skipped", job.name), 1);
        warn!(job = %job.name, "Previous run still in progress, skipping tick");
        return TickOutcome::Skipped;
    }

    job.started.fetch_add(1, Ordering::Relaxed);
    let guard = RunningGuard(Arc::clone(job));
    let future = (job.run)();
    let metrics = Arc::clone(metrics);

    TickOutcome::Started(tokio::spawn(async move {
        let job = &guard.0;
        let start = Instant::now();
        debug!(job = %job.name, "Job started");
        match future.await {
            Ok(()) => {
                debug!(
                    job = %job.name,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Job finished"
                );
            }
            Err(e) => {
                job.failed.fetch_add(1, Ordering::Relaxed);
                metrics.increment(&format!("scheduler.{}.error", job.name), 1);
                error!(job = %job.name, error = %e, "Scheduled job failed");
            }
        }
        drop(guard);
    }))
}
