// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Background job scheduler.
//!
//! Jobs run on the cooperative async-std loop, one task per job, so a job
//! never runs concurrently with itself. Interval jobs fire every N seconds;
//! cron jobs fire daily at a fixed UTC time with a 5-minute misfire grace.
//! A job error is logged at ERROR and terminates that job's schedule rather
//! than being swallowed.
//!
//! The fallback driver exists for environments where spawning long-lived
//! tasks is unavailable; it still runs interval jobs but warns loudly that
//! cron jobs will not execute.

use crate::helpers::now_unix;
use async_std::task::{self, JoinHandle};
use futures::future::BoxFuture;
use snafu::Snafu;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const MISFIRE_GRACE: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug, Snafu)]
#[snafu(display("job failed: {}", msg))]
pub struct JobError {
    pub msg: String,
}

pub type JobResult = Result<(), JobError>;
type JobFn = Arc<dyn Fn() -> BoxFuture<'static, JobResult> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Trigger {
    Interval { every: Duration },
    DailyUtc { hour: u32, minute: u32 },
}

struct Job {
    id: String,
    trigger: Trigger,
    func: JobFn,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Driver {
    EventLoop,
    Fallback,
}

pub struct Scheduler {
    driver: Driver,
    jobs: Mutex<Vec<Arc<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            driver: Driver::EventLoop,
            jobs: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Degraded driver without cron support.
    pub fn fallback() -> Self {
        Self {
            driver: Driver::Fallback,
            jobs: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.driver == Driver::Fallback
    }

    pub fn add_interval_job<F>(&self, id: &str, every: Duration, func: F)
    where
        F: Fn() -> BoxFuture<'static, JobResult> + Send + Sync + 'static,
    {
        let mut jobs = self.jobs.lock().expect("scheduler lock poisoned");
        jobs.push(Arc::new(Job {
            id: id.to_string(),
            trigger: Trigger::Interval { every },
            func: Arc::new(func),
        }));
        tracing::info!("registered interval job {} (every {:?})", id, every);
    }

    pub fn add_cron_job<F>(&self, id: &str, hour: u32, minute: u32, func: F)
    where
        F: Fn() -> BoxFuture<'static, JobResult> + Send + Sync + 'static,
    {
        if self.driver == Driver::Fallback {
            tracing::warn!(
                "cron job {} registered on the fallback driver and will NOT execute; \
                 run the event-loop scheduler for cron support",
                id
            );
        }
        let mut jobs = self.jobs.lock().expect("scheduler lock poisoned");
        jobs.push(Arc::new(Job {
            id: id.to_string(),
            trigger: Trigger::DailyUtc { hour, minute },
            func: Arc::new(func),
        }));
        tracing::info!("registered cron job {} ({:02}:{:02} UTC)", id, hour, minute);
    }

    /// Spawn one task per registered job.
    pub fn start(&self) {
        let jobs: Vec<Arc<Job>> = self
            .jobs
            .lock()
            .expect("scheduler lock poisoned")
            .clone();
        let mut handles = self.handles.lock().expect("scheduler lock poisoned");
        for job in jobs {
            match job.trigger {
                Trigger::Interval { every } => {
                    handles.push(task::spawn(run_interval(job, every)));
                }
                Trigger::DailyUtc { hour, minute } => {
                    if self.driver == Driver::Fallback {
                        continue;
                    }
                    handles.push(task::spawn(run_daily(job, hour, minute)));
                }
            }
        }
        tracing::info!("scheduler started");
    }

    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().expect("scheduler lock poisoned");
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            handle.cancel().await;
        }
        tracing::info!("scheduler stopped");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_interval(job: Arc<Job>, every: Duration) {
    loop {
        task::sleep(every).await;
        if let Err(err) = (job.func)().await {
            tracing::error!(
                "interval job {} failed, terminating its schedule: {}",
                job.id,
                err
            );
            break;
        }
    }
}

async fn run_daily(job: Arc<Job>, hour: u32, minute: u32) {
    loop {
        let delay = secs_until_daily(now_unix(), hour, minute);
        let scheduled_at = now_unix() + delay;
        task::sleep(Duration::from_secs(delay)).await;

        let lateness = now_unix().saturating_sub(scheduled_at);
        if lateness > MISFIRE_GRACE.as_secs() {
            tracing::warn!(
                "cron job {} misfired by {}s, coalescing to the next run",
                job.id,
                lateness
            );
            continue;
        }
        if let Err(err) = (job.func)().await {
            tracing::error!("cron job {} failed, terminating its schedule: {}", job.id, err);
            break;
        }
    }
}

/// Seconds until the next daily HH:MM UTC, strictly in the future.
fn secs_until_daily(now: u64, hour: u32, minute: u32) -> u64 {
    const DAY: u64 = 24 * 3600;
    let target = (hour as u64) * 3600 + (minute as u64) * 60;
    let elapsed_today = now % DAY;
    if target > elapsed_today {
        target - elapsed_today
    } else {
        DAY - elapsed_today + target
    }
}
