//! Deferred notifications. Jobs live in `scheduled_jobs` and are drained by a polling
//! worker; each job is claimed with a conditional status update before it runs.

use super::{NotificationDispatcher, NotificationError, NotificationEvent};
use crate::{
    db::DbPool,
    entities::scheduled_job::{
        ActiveModel as JobActiveModel, Column, Entity as JobEntity, JobStatus, Model as JobModel,
    },
};
use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const NOTIFICATION_JOB_KIND: &str = "notification";
const MAX_ATTEMPTS: i32 = 5;
const BASE_BACKOFF_SECS: i64 = 30;

pub fn reminder_job_key(booking_id: Uuid) -> String {
    format!("reminder:{booking_id}")
}

/// When a reminder should fire: `lead` before the session, but never in the past.
/// Sessions that are unknown or already started get no reminder.
pub fn reminder_run_at(
    session_start: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    lead: Duration,
) -> Option<DateTime<Utc>> {
    let start = session_start?;
    if start <= now {
        return None;
    }
    Some((start - lead).max(now))
}

#[async_trait::async_trait]
pub trait JobScheduler: Send + Sync {
    /// Schedules `event` for `run_at`, replacing any job with the same key.
    async fn schedule_at(
        &self,
        run_at: DateTime<Utc>,
        job_key: &str,
        event: &NotificationEvent,
    ) -> Result<(), NotificationError>;

    /// Cancels a pending job. Returns whether anything was cancelled.
    async fn cancel(&self, job_key: &str) -> Result<bool, NotificationError>;
}

#[derive(Clone)]
pub struct DbJobScheduler {
    db_pool: Arc<DbPool>,
}

impl DbJobScheduler {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    pub async fn find(&self, job_key: &str) -> Result<Option<JobModel>, NotificationError> {
        Ok(JobEntity::find()
            .filter(Column::JobKey.eq(job_key))
            .one(&*self.db_pool)
            .await?)
    }
}

#[async_trait::async_trait]
impl JobScheduler for DbJobScheduler {
    async fn schedule_at(
        &self,
        run_at: DateTime<Utc>,
        job_key: &str,
        event: &NotificationEvent,
    ) -> Result<(), NotificationError> {
        let now = Utc::now();
        let job = JobActiveModel {
            id: Set(Uuid::new_v4()),
            job_key: Set(job_key.to_string()),
            kind: Set(NOTIFICATION_JOB_KIND.to_string()),
            payload: Set(serde_json::to_string(event)?),
            run_at: Set(run_at),
            status: Set(JobStatus::Pending.to_string()),
            attempts: Set(0),
            last_error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        JobEntity::insert(job)
            .on_conflict(
                OnConflict::column(Column::JobKey)
                    .update_columns([
                        Column::Kind,
                        Column::Payload,
                        Column::RunAt,
                        Column::Status,
                        Column::Attempts,
                        Column::LastError,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&*self.db_pool)
            .await?;
        debug!(job_key, %run_at, "Job scheduled");
        Ok(())
    }

    async fn cancel(&self, job_key: &str) -> Result<bool, NotificationError> {
        let result = JobEntity::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Cancelled.to_string()))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(Column::JobKey.eq(job_key))
            .filter(Column::Status.eq(JobStatus::Pending.to_string()))
            .exec(&*self.db_pool)
            .await?;
        Ok(result.rows_affected > 0)
    }
}

/// Polls for due jobs and emits their notifications.
#[derive(Clone)]
pub struct JobWorker {
    db_pool: Arc<DbPool>,
    dispatcher: Arc<NotificationDispatcher>,
    batch_size: u64,
    poll_interval: std::time::Duration,
}

impl JobWorker {
    pub fn new(
        db_pool: Arc<DbPool>,
        dispatcher: Arc<NotificationDispatcher>,
        batch_size: u64,
        poll_interval: std::time::Duration,
    ) -> Self {
        Self {
            db_pool,
            dispatcher,
            batch_size,
            poll_interval,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        info!(
            batch_size = self.batch_size,
            poll_ms = self.poll_interval.as_millis() as u64,
            "Starting scheduled job worker"
        );
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.drain_due_jobs(Utc::now()).await {
                    error!("scheduled job worker error: {}", e);
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        })
    }

    /// Runs every pending job due at `now`. Returns how many were delivered.
    pub async fn drain_due_jobs(&self, now: DateTime<Utc>) -> Result<usize, NotificationError> {
        let due = JobEntity::find()
            .filter(Column::Status.eq(JobStatus::Pending.to_string()))
            .filter(Column::RunAt.lte(now))
            .order_by_asc(Column::RunAt)
            .limit(self.batch_size)
            .all(&*self.db_pool)
            .await?;

        let mut delivered = 0;
        for job in due {
            if !self.claim(&job).await? {
                continue;
            }
            match self.run(&job).await {
                Ok(()) => {
                    self.finish(&job, JobStatus::Delivered, None, None).await?;
                    delivered += 1;
                }
                Err(e) => {
                    let attempts = job.attempts + 1;
                    if attempts < MAX_ATTEMPTS {
                        let retry_at = Utc::now()
                            + Duration::seconds(BASE_BACKOFF_SECS * 2_i64.pow(attempts as u32 - 1));
                        warn!(job_key = %job.job_key, attempts, %retry_at, error = %e, "Scheduled job failed; will retry");
                        self.finish(&job, JobStatus::Pending, Some(e.to_string()), Some(retry_at))
                            .await?;
                    } else {
                        error!(job_key = %job.job_key, attempts, error = %e, "Scheduled job failed permanently");
                        self.finish(&job, JobStatus::Failed, Some(e.to_string()), None)
                            .await?;
                    }
                }
            }
        }
        Ok(delivered)
    }

    async fn claim(&self, job: &JobModel) -> Result<bool, NotificationError> {
        let result = JobEntity::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Processing.to_string()))
            .col_expr(Column::Attempts, Expr::col(Column::Attempts).add(1))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(Column::Id.eq(job.id))
            .filter(Column::Status.eq(JobStatus::Pending.to_string()))
            .exec(&*self.db_pool)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn run(&self, job: &JobModel) -> Result<(), NotificationError> {
        if job.kind != NOTIFICATION_JOB_KIND {
            return Err(NotificationError::Invalid(format!(
                "unknown job kind '{}'",
                job.kind
            )));
        }
        let event: NotificationEvent = serde_json::from_str(&job.payload)?;
        self.dispatcher.emit(event).await.map(|_| ())
    }

    async fn finish(
        &self,
        job: &JobModel,
        status: JobStatus,
        last_error: Option<String>,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), NotificationError> {
        let mut update = JobEntity::update_many()
            .col_expr(Column::Status, Expr::value(status.to_string()))
            .col_expr(Column::LastError, Expr::value(last_error))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()));
        if let Some(at) = retry_at {
            update = update.col_expr(Column::RunAt, Expr::value(at));
        }
        update
            .filter(Column::Id.eq(job.id))
            .filter(Column::Status.eq(JobStatus::Processing.to_string()))
            .exec(&*self.db_pool)
            .await?;
        Ok(())
    }
}
