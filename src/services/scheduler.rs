//! In-process job scheduler for task executions.
//!
//! Durability comes from the database, not the registry: schedules are
//! reconstructed from the tasks table on startup (reconciliation), so the
//! registry itself is a plain in-memory map. Two trigger kinds exist: a
//! one-shot date (the primary mode, driven by the agent's next_run) and a
//! recurring cron expression evaluated in UTC.
//!
//! System maintenance (stale-execution reaping and the webhook retry sweep)
//! runs as shutdown-aware background workers next to the tick loop.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDateTime, Utc};
use cron::Schedule;
use sqlx::SqlitePool;

use crate::db::models::TaskState;
use crate::db::repository::{ExecutionRepository, TaskRepository};
use crate::error::{AppError, AppResult};
use crate::AppState;

pub const REAPER_JOB_ID: &str = "reap-stale-executions";
pub const WEBHOOK_RETRY_JOB_ID: &str = "webhook-retry-job";

const STALE_EXECUTION_MESSAGE: &str = "execution exceeded maximum runtime";

pub fn task_job_id(task_id: &str) -> String {
    format!("task-{}", task_id)
}

#[derive(Debug, Clone)]
pub enum Trigger {
    /// One-shot; consumed when it fires.
    Date(NaiveDateTime),
    /// Standard 5-field cron expression, UTC.
    Cron(String),
}

#[derive(Debug, Clone)]
struct Job {
    trigger: Trigger,
    next_fire: Option<NaiveDateTime>,
    paused: bool,
    task_id: String,
    user_id: String,
    task_name: String,
}

/// A job that came due on the current tick.
#[derive(Debug, Clone)]
pub struct FiredJob {
    pub job_id: String,
    pub task_id: String,
    pub user_id: String,
    pub task_name: String,
}

/// Snapshot of one registry entry, for reconciliation and tests.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub job_id: String,
    pub paused: bool,
    pub next_fire: Option<NaiveDateTime>,
}

/// Identity of the task a job will run, needed when reconciliation or a
/// state transition has to (re)create the job.
#[derive(Debug, Clone)]
pub struct JobArgs {
    pub task_id: String,
    pub user_id: String,
    pub task_name: String,
}

/// Cloneable handle over the shared job registry.
///
/// Registry methods are synchronous and never held across an await point.
#[derive(Clone, Default)]
pub struct Scheduler {
    jobs: Arc<Mutex<HashMap<String, Job>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a one-shot job, replacing any existing job with the same id.
    pub fn add_date_job(&self, job_id: &str, run_at: NaiveDateTime, args: JobArgs) {
        let job = Job {
            trigger: Trigger::Date(run_at),
            next_fire: Some(run_at),
            paused: false,
            task_id: args.task_id,
            user_id: args.user_id,
            task_name: args.task_name,
        };
        self.jobs.lock().unwrap().insert(job_id.to_string(), job);
        tracing::debug!("Registered date job {} for {}", job_id, run_at);
    }

    /// Register a recurring cron job, replacing any existing job.
    pub fn add_cron_job(&self, job_id: &str, expression: &str, args: JobArgs) -> AppResult<()> {
        let next = cron_next_after(expression, Utc::now()).ok_or_else(|| {
            AppError::Scheduler(format!("invalid cron expression '{}'", expression))
        })?;

        let job = Job {
            trigger: Trigger::Cron(expression.to_string()),
            next_fire: Some(next),
            paused: false,
            task_id: args.task_id,
            user_id: args.user_id,
            task_name: args.task_name,
        };
        self.jobs.lock().unwrap().insert(job_id.to_string(), job);
        tracing::debug!("Registered cron job {} ({})", job_id, expression);
        Ok(())
    }

    /// Pause a job. Returns false when no such job exists.
    pub fn pause_job(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(job_id) {
            Some(job) => {
                job.paused = true;
                true
            }
            None => false,
        }
    }

    /// Resume a paused job. Returns false when no such job exists.
    pub fn resume_job(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(job_id) {
            Some(job) => {
                job.paused = false;
                // A one-shot whose time passed while paused fires promptly.
                if job.next_fire.is_none() {
                    if let Trigger::Cron(expr) = &job.trigger {
                        job.next_fire = cron_next_after(expr, Utc::now());
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Remove a job. Returns false when no such job exists.
    pub fn remove_job(&self, job_id: &str) -> bool {
        self.jobs.lock().unwrap().remove(job_id).is_some()
    }

    pub fn get_job(&self, job_id: &str) -> Option<JobSnapshot> {
        self.jobs.lock().unwrap().get(job_id).map(|job| JobSnapshot {
            job_id: job_id.to_string(),
            paused: job.paused,
            next_fire: job.next_fire,
        })
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.lock().unwrap().keys().cloned().collect()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    /// Collect jobs due at `now`. One-shot jobs are consumed; cron jobs
    /// advance to their next fire time. A job already being consumed cannot
    /// fire twice, so duplicate triggers coalesce here.
    pub fn due_jobs(&self, now: NaiveDateTime) -> Vec<FiredJob> {
        let mut fired = Vec::new();
        let mut jobs = self.jobs.lock().unwrap();
        let mut consumed: Vec<String> = Vec::new();

        for (job_id, job) in jobs.iter_mut() {
            if job.paused {
                continue;
            }
            let Some(next_fire) = job.next_fire else {
                continue;
            };
            if next_fire > now {
                continue;
            }

            fired.push(FiredJob {
                job_id: job_id.clone(),
                task_id: job.task_id.clone(),
                user_id: job.user_id.clone(),
                task_name: job.task_name.clone(),
            });

            match &job.trigger {
                Trigger::Date(_) => consumed.push(job_id.clone()),
                Trigger::Cron(expr) => {
                    job.next_fire = cron_next_after(expr, Utc::now());
                }
            }
        }

        for job_id in consumed {
            jobs.remove(&job_id);
        }

        fired
    }

    /// Bring the registry into agreement with the tasks table. Idempotent;
    /// failures on individual tasks are logged and skipped.
    pub async fn reconcile(&self, pool: &SqlitePool) -> AppResult<()> {
        let tasks = TaskRepository::list_all(pool).await?;
        let mut task_job_ids: Vec<String> = Vec::with_capacity(tasks.len());

        for task in &tasks {
            let job_id = task_job_id(&task.id);
            task_job_ids.push(job_id.clone());

            let Some(state) = task.state() else {
                tracing::warn!("Task {} has unknown state '{}', skipping", task.id, task.state);
                continue;
            };

            let existing = self.get_job(&job_id);
            let args = JobArgs {
                task_id: task.id.clone(),
                user_id: task.user_id.clone(),
                task_name: task.name.clone(),
            };

            let result = match (state, existing) {
                (TaskState::Active, None) => self.create_task_job(&job_id, task, args),
                (TaskState::Active, Some(snapshot)) if snapshot.paused => {
                    self.resume_job(&job_id);
                    Ok(())
                }
                (TaskState::Paused, Some(snapshot)) if !snapshot.paused => {
                    self.pause_job(&job_id);
                    Ok(())
                }
                (TaskState::Paused, None) => {
                    let created = self.create_task_job(&job_id, task, args);
                    if created.is_ok() {
                        self.pause_job(&job_id);
                    }
                    created
                }
                (TaskState::Completed, Some(_)) => {
                    self.remove_job(&job_id);
                    Ok(())
                }
                _ => Ok(()),
            };

            if let Err(e) = result {
                tracing::error!("Reconciliation failed for task {}: {}", task.id, e);
            }
        }

        // Drop jobs that no longer correspond to an extant task.
        for job_id in self.job_ids() {
            if !task_job_ids.contains(&job_id) {
                tracing::info!("Removing orphaned scheduler job {}", job_id);
                self.remove_job(&job_id);
            }
        }

        Ok(())
    }

    /// Create a job for a task: the persisted next_run when it is still in
    /// the future, else the task's cron schedule, else a 24h fallback.
    fn create_task_job(
        &self,
        job_id: &str,
        task: &crate::db::models::Task,
        args: JobArgs,
    ) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        if let Some(next_run) = task.next_run {
            if next_run > now {
                self.add_date_job(job_id, next_run, args);
                return Ok(());
            }
        }

        if let Some(expression) = &task.schedule {
            if self.add_cron_job(job_id, expression, args.clone()).is_ok() {
                return Ok(());
            }
            tracing::warn!(
                "Task {} has invalid schedule '{}', falling back to 24h",
                task.id,
                expression
            );
        }

        self.add_date_job(job_id, now + chrono::Duration::hours(24), args);
        Ok(())
    }
}

/// First fire time of a 5-field cron expression strictly after `after`, UTC.
pub fn cron_next_after(expression: &str, after: DateTime<Utc>) -> Option<NaiveDateTime> {
    let normalized = normalize_cron(expression);
    let schedule = Schedule::from_str(&normalized).ok()?;
    schedule.after(&after).next().map(|dt| dt.naive_utc())
}

/// The cron crate expects a seconds field; standard 5-field expressions get
/// one prepended.
fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    }
}

/// Fallback next-run computation used when activating a task: the cron
/// expression's next fire when present and valid, else now + 24h.
pub fn compute_next_run(schedule: Option<&str>) -> NaiveDateTime {
    let now = Utc::now();
    if let Some(expression) = schedule {
        if let Some(next) = cron_next_after(expression, now) {
            return next;
        }
        tracing::warn!("Failed to parse schedule '{}', using 24h fallback", expression);
    }
    now.naive_utc() + chrono::Duration::hours(24)
}

/// Tick loop: fire due jobs and hand them to the orchestrator. Each firing
/// runs in its own tokio task; per-task serialization is enforced at the
/// storage layer, so a duplicate firing resolves to ExecutionAlreadyRunning.
pub async fn run(state: Arc<AppState>, mut shutdown_rx: tokio::sync::broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::info!("Scheduler tick loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                let fired = state.scheduler.due_jobs(Utc::now().naive_utc());
                for job in fired {
                    tracing::info!("Job {} fired for task {}", job.job_id, job.task_id);
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = crate::services::orchestrator::Orchestrator::execute_scheduled(
                            &state,
                            &job.task_id,
                            &job.user_id,
                            &job.task_name,
                        )
                        .await
                        {
                            match e {
                                AppError::ExecutionAlreadyRunning(_) => {
                                    tracing::debug!(
                                        "Skipping duplicate firing for task {}",
                                        job.task_id
                                    );
                                }
                                other => {
                                    tracing::error!(
                                        "Scheduled execution failed for task {}: {}",
                                        job.task_id,
                                        other
                                    );
                                }
                            }
                        }
                    });
                }
            }
        }
    }
}

/// Spawn the system maintenance workers. Returns their join handles so the
/// caller can await shutdown.
pub fn spawn_system_workers(
    state: Arc<AppState>,
    shutdown: tokio::sync::broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    // Stale execution reaper
    {
        let mut shutdown_rx = shutdown.subscribe();
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            let interval = std::time::Duration::from_secs(
                state.config.scheduler.stale_reap_interval_minutes * 60,
            );
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("{} worker shutting down", REAPER_JOB_ID);
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }

                let cutoff = Utc::now().naive_utc()
                    - chrono::Duration::minutes(state.config.scheduler.stale_execution_minutes);

                match ExecutionRepository::reap_stale(&state.db, cutoff, STALE_EXECUTION_MESSAGE)
                    .await
                {
                    Ok(0) => {}
                    Ok(reaped) => {
                        tracing::warn!("Reaped {} stale running execution(s)", reaped);
                    }
                    Err(e) => {
                        tracing::error!("Stale execution reap failed: {}", e);
                    }
                }
            }
        }));
    }

    // Webhook retry sweep
    {
        let mut shutdown_rx = shutdown.subscribe();
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            let interval = std::time::Duration::from_secs(
                state.config.scheduler.webhook_sweep_interval_minutes * 60,
            );
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("{} worker shutting down", WEBHOOK_RETRY_JOB_ID);
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }

                let dispatcher =
                    crate::services::notifications::NotificationDispatcher::new(&state);
                match dispatcher.run_webhook_retry_sweep().await {
                    Ok(0) => {}
                    Ok(processed) => {
                        tracing::info!("Webhook retry sweep processed {} delivery(ies)", processed);
                    }
                    Err(e) => {
                        tracing::error!("Webhook retry sweep failed: {}", e);
                    }
                }
            }
        }));
    }

    handles
}
