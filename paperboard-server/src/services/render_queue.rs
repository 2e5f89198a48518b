//! Durable render job queue backed by the `render_queue` table.
//!
//! Jobs move `pending -> processing -> {completed, failed}`. There is at most
//! one pending job per plugin instance: enqueueing against an existing
//! pending job merges into it instead of inserting a duplicate.

use crate::db::DbPool;
use crate::models::{NewRenderJob, NewRenderedContent, PluginInstance, RenderJob, RenderedContent};
use crate::services::refresh::cadence_or_default;
use crate::services::renderer::RenderArtifact;
use crate::services::sleep_window::owner_timezone;
use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Priority for renders triggered by user-visible changes.
pub const IMMEDIATE_PRIORITY: i32 = 999;
/// Priority for the regular cadence sweep.
pub const PERIODIC_PRIORITY: i32 = 10;

const CLAIM_BATCH: i64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub plugin_instance_id: i32,
    pub priority: i32,
    pub scheduled_for: NaiveDateTime,
    pub independent: bool,
}

impl EnqueueRequest {
    pub fn immediate(plugin_instance_id: i32, now: DateTime<Utc>, independent: bool) -> Self {
        Self {
            plugin_instance_id,
            priority: IMMEDIATE_PRIORITY,
            scheduled_for: now.naive_utc(),
            independent,
        }
    }
}

#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    Inserted(RenderJob),
    /// An already pending job absorbed the request.
    Merged(RenderJob),
}

impl EnqueueOutcome {
    pub fn job(&self) -> &RenderJob {
        match self {
            Self::Inserted(job) | Self::Merged(job) => job,
        }
    }
}

/// Inserts a pending job, or folds the request into the existing pending job
/// for the instance: highest priority, earliest `scheduled_for`, and the job
/// stays independent only if both requests were.
pub fn enqueue(conn: &mut SqliteConnection, req: EnqueueRequest) -> QueryResult<EnqueueOutcome> {
    use crate::schema::render_queue::dsl;

    conn.immediate_transaction(|conn| {
        let existing = dsl::render_queue
            .filter(dsl::plugin_instance_id.eq(req.plugin_instance_id))
            .filter(dsl::status.eq(JobStatus::Pending.as_str()))
            .select(RenderJob::as_select())
            .first(conn)
            .optional()?;

        match existing {
            Some(job) => {
                let merged = diesel::update(dsl::render_queue.find(job.id))
                    .set((
                        dsl::priority.eq(job.priority.max(req.priority)),
                        dsl::scheduled_for.eq(job.scheduled_for.min(req.scheduled_for)),
                        dsl::independent_render.eq(job.independent_render && req.independent),
                    ))
                    .returning(RenderJob::as_select())
                    .get_result(conn)?;
                Ok(EnqueueOutcome::Merged(merged))
            }
            None => {
                let inserted = diesel::insert_into(dsl::render_queue)
                    .values(&NewRenderJob {
                        plugin_instance_id: req.plugin_instance_id,
                        priority: req.priority,
                        scheduled_for: req.scheduled_for,
                        status: JobStatus::Pending.as_str().to_string(),
                        independent_render: req.independent,
                    })
                    .returning(RenderJob::as_select())
                    .get_result(conn)?;
                Ok(EnqueueOutcome::Inserted(inserted))
            }
        }
    })
}

/// Immediate render for a content-affecting change. Daily-family instances
/// get an independent job so their fixed slot is left alone.
pub fn request_render(
    conn: &mut SqliteConnection,
    plugin_instance_id: i32,
    now: DateTime<Utc>,
) -> QueryResult<EnqueueOutcome> {
    use crate::schema::plugin_instances::dsl;

    let refresh_interval: String = dsl::plugin_instances
        .find(plugin_instance_id)
        .select(dsl::refresh_interval)
        .first(conn)?;
    let independent = cadence_or_default(&refresh_interval).is_daily_family();

    enqueue(conn, EnqueueRequest::immediate(plugin_instance_id, now, independent))
}

/// Fire-and-forget variant for request handlers. The triggering mutation has
/// already committed; a failure here only leaves the render stale.
pub fn spawn_render_request(pool: DbPool, plugin_instance_id: i32, reason: &'static str) {
    tokio::task::spawn_blocking(move || {
        let result = pool
            .get()
            .map_err(|e| e.to_string())
            .and_then(|mut conn| {
                request_render(&mut conn, plugin_instance_id, Utc::now()).map_err(|e| e.to_string())
            });

        match result {
            Ok(outcome) => tracing::debug!(
                "Render requested for instance {} ({}): job {}",
                plugin_instance_id,
                reason,
                outcome.job().id
            ),
            Err(e) => tracing::error!(
                "Failed to enqueue render for instance {} ({}): {}",
                plugin_instance_id,
                reason,
                e
            ),
        }
    });
}

/// Claims the next eligible job. The conditional update on `status` makes the
/// claim safe when several workers poll the same table; a lost race just
/// moves on to the next candidate.
pub fn claim_next(conn: &mut SqliteConnection, now: DateTime<Utc>) -> QueryResult<Option<RenderJob>> {
    use crate::schema::render_queue::dsl;

    let now = now.naive_utc();
    loop {
        let candidates: Vec<i32> = dsl::render_queue
            .filter(dsl::status.eq(JobStatus::Pending.as_str()))
            .filter(dsl::scheduled_for.le(now))
            .order((dsl::priority.desc(), dsl::scheduled_for.asc(), dsl::id.asc()))
            .select(dsl::id)
            .limit(CLAIM_BATCH)
            .load(conn)?;

        if candidates.is_empty() {
            return Ok(None);
        }

        for candidate in candidates {
            if let Some(job) = claim(conn, candidate, now)? {
                return Ok(Some(job));
            }
        }
    }
}

/// Conditional `pending -> processing` transition for one job.
pub fn claim(conn: &mut SqliteConnection, job_id: i32, now: NaiveDateTime) -> QueryResult<Option<RenderJob>> {
    use crate::schema::render_queue::dsl;

    diesel::update(
        dsl::render_queue
            .filter(dsl::id.eq(job_id))
            .filter(dsl::status.eq(JobStatus::Pending.as_str())),
    )
    .set((
        dsl::status.eq(JobStatus::Processing.as_str()),
        dsl::started_at.eq(Some(now)),
        dsl::attempts.eq(dsl::attempts + 1),
    ))
    .returning(RenderJob::as_select())
    .get_result(conn)
    .optional()
}

/// Stores the artifact (superseding any previous one for the instance) and
/// completes the job. Non-independent jobs also move the instance's next
/// regular render forward from `now`.
///
/// Returns `false` without touching anything when the job is no longer
/// `processing`, e.g. the stale sweep already failed it.
pub fn mark_completed(
    conn: &mut SqliteConnection,
    job: &RenderJob,
    artifact: &RenderArtifact,
    now: DateTime<Utc>,
) -> QueryResult<bool> {
    use crate::schema::render_queue::dsl as jobs;
    use crate::schema::rendered_content::dsl as content;

    conn.transaction(|conn| {
        let updated = diesel::update(
            jobs::render_queue
                .find(job.id)
                .filter(jobs::status.eq(JobStatus::Processing.as_str())),
        )
        .set((
            jobs::status.eq(JobStatus::Completed.as_str()),
            jobs::completed_at.eq(Some(now.naive_utc())),
            jobs::error_message.eq(None::<String>),
        ))
        .execute(conn)?;
        if updated == 0 {
            tracing::warn!("Render job {} finished after leaving processing; result dropped", job.id);
            return Ok(false);
        }

        diesel::delete(content::rendered_content.filter(content::plugin_instance_id.eq(job.plugin_instance_id)))
            .execute(conn)?;
        diesel::insert_into(content::rendered_content)
            .values(&NewRenderedContent {
                plugin_instance_id: job.plugin_instance_id,
                render_job_id: Some(job.id),
                content: &artifact.content,
                mime_type: &artifact.mime_type,
                rendered_at: now.naive_utc(),
            })
            .execute(conn)?;

        record_render(conn, job, now, true)?;
        Ok(true)
    })
}

/// Fails a `processing` job. Returns `false` when it had already finished.
pub fn mark_failed(
    conn: &mut SqliteConnection,
    job: &RenderJob,
    error: &str,
    now: DateTime<Utc>,
) -> QueryResult<bool> {
    use crate::schema::render_queue::dsl;

    conn.transaction(|conn| {
        let updated = diesel::update(
            dsl::render_queue
                .find(job.id)
                .filter(dsl::status.eq(JobStatus::Processing.as_str())),
        )
        .set((
            dsl::status.eq(JobStatus::Failed.as_str()),
            dsl::completed_at.eq(Some(now.naive_utc())),
            dsl::error_message.eq(Some(error)),
        ))
        .execute(conn)?;
        if updated == 0 {
            return Ok(false);
        }

        record_render(conn, job, now, false)?;
        Ok(true)
    })
}

/// Cadence bookkeeping after a job finishes. Independent renders never touch
/// `next_render_at`; regular ones reschedule from `now` whether they
/// succeeded or not, so a failing instance is retried on its normal cadence.
fn record_render(
    conn: &mut SqliteConnection,
    job: &RenderJob,
    now: DateTime<Utc>,
    succeeded: bool,
) -> QueryResult<()> {
    use crate::schema::plugin_instances::dsl;
    use crate::schema::users;

    if succeeded {
        diesel::update(dsl::plugin_instances.find(job.plugin_instance_id))
            .set(dsl::last_rendered_at.eq(Some(now.naive_utc())))
            .execute(conn)?;
    }

    if job.independent_render {
        return Ok(());
    }

    let Some((refresh_interval, owner_tz)) = dsl::plugin_instances
        .inner_join(users::table)
        .filter(dsl::id.eq(job.plugin_instance_id))
        .select((dsl::refresh_interval, users::timezone))
        .first::<(String, Option<String>)>(conn)
        .optional()?
    else {
        return Ok(());
    };

    let next = cadence_or_default(&refresh_interval).next_due(now, owner_timezone(owner_tz.as_deref()));
    diesel::update(dsl::plugin_instances.find(job.plugin_instance_id))
        .set(dsl::next_render_at.eq(Some(next.naive_utc())))
        .execute(conn)?;
    Ok(())
}

/// Enqueues every instance whose regular render is due. `next_render_at` is
/// cleared once the job exists; completion sets it again.
pub fn enqueue_due_instances(conn: &mut SqliteConnection, now: DateTime<Utc>) -> QueryResult<usize> {
    use crate::schema::plugin_instances::dsl;

    let due: Vec<i32> = dsl::plugin_instances
        .filter(dsl::next_render_at.le(now.naive_utc()))
        .select(dsl::id)
        .load(conn)?;

    for instance_id in &due {
        enqueue(
            conn,
            EnqueueRequest {
                plugin_instance_id: *instance_id,
                priority: PERIODIC_PRIORITY,
                scheduled_for: now.naive_utc(),
                independent: false,
            },
        )?;
        diesel::update(dsl::plugin_instances.find(*instance_id))
            .set(dsl::next_render_at.eq(None::<NaiveDateTime>))
            .execute(conn)?;
    }

    Ok(due.len())
}

/// Jobs left in `processing` by a crashed worker are failed so the instance
/// can be picked up again.
pub fn fail_stale(conn: &mut SqliteConnection, started_before: NaiveDateTime, now: DateTime<Utc>) -> QueryResult<usize> {
    use crate::schema::render_queue::dsl;

    let stale: Vec<RenderJob> = dsl::render_queue
        .filter(dsl::status.eq(JobStatus::Processing.as_str()))
        .filter(dsl::started_at.lt(started_before))
        .select(RenderJob::as_select())
        .load(conn)?;

    const REASON: &str = "worker stopped before the render finished";

    for job in &stale {
        tracing::warn!("Render job {} stuck in processing, marking failed", job.id);
        if let Err(e) = mark_failed(conn, job, REASON, now) {
            // Cadence bookkeeping failed; still release the job.
            tracing::error!("Failed to reschedule instance {} after job {}: {}", job.plugin_instance_id, job.id, e);
            diesel::update(dsl::render_queue.find(job.id))
                .set((
                    dsl::status.eq(JobStatus::Failed.as_str()),
                    dsl::completed_at.eq(Some(now.naive_utc())),
                    dsl::error_message.eq(Some(REASON)),
                ))
                .execute(conn)?;
        }
    }
    Ok(stale.len())
}

/// Drops finished jobs older than the retention horizon.
pub fn purge_finished(conn: &mut SqliteConnection, finished_before: NaiveDateTime) -> QueryResult<usize> {
    use crate::schema::render_queue::dsl;

    diesel::delete(
        dsl::render_queue
            .filter(dsl::status.eq_any(vec![JobStatus::Completed.as_str(), JobStatus::Failed.as_str()]))
            .filter(dsl::completed_at.lt(finished_before)),
    )
    .execute(conn)
}

pub fn latest_artifact(conn: &mut SqliteConnection, plugin_instance_id: i32) -> QueryResult<Option<RenderedContent>> {
    use crate::schema::rendered_content::dsl;

    dsl::rendered_content
        .filter(dsl::plugin_instance_id.eq(plugin_instance_id))
        .select(RenderedContent::as_select())
        .first(conn)
        .optional()
}

pub fn clear_artifact(conn: &mut SqliteConnection, plugin_instance_id: i32) -> QueryResult<usize> {
    use crate::schema::rendered_content::dsl;

    diesel::delete(dsl::rendered_content.filter(dsl::plugin_instance_id.eq(plugin_instance_id))).execute(conn)
}

pub fn recent_jobs(conn: &mut SqliteConnection, plugin_instance_id: i32, limit: i64) -> QueryResult<Vec<RenderJob>> {
    use crate::schema::render_queue::dsl;

    dsl::render_queue
        .filter(dsl::plugin_instance_id.eq(plugin_instance_id))
        .order(dsl::id.desc())
        .limit(limit)
        .select(RenderJob::as_select())
        .load(conn)
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BulkEnqueueReport {
    pub requested: usize,
    pub enqueued: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Re-render after a definition change. Stops early when `cancel` fires or
/// the deadline passes; jobs already enqueued stay queued.
pub fn bulk_enqueue(
    conn: &mut SqliteConnection,
    instance_ids: &[i32],
    cancel: &CancellationToken,
    deadline: Instant,
) -> BulkEnqueueReport {
    let mut report = BulkEnqueueReport {
        requested: instance_ids.len(),
        ..Default::default()
    };

    for instance_id in instance_ids {
        if cancel.is_cancelled() || Instant::now() >= deadline {
            report.cancelled = true;
            break;
        }

        match request_render(conn, *instance_id, Utc::now()) {
            Ok(_) => report.enqueued += 1,
            Err(e) => {
                tracing::error!("Bulk re-render: instance {} not enqueued: {}", instance_id, e);
                report.failed += 1;
            }
        }
    }

    report
}

/// Marks every instance of a definition as out of date and returns their ids.
pub fn instances_needing_update(
    conn: &mut SqliteConnection,
    definition_id: i32,
    schema_version: i32,
) -> QueryResult<Vec<PluginInstance>> {
    use crate::schema::plugin_instances::dsl;

    diesel::update(
        dsl::plugin_instances
            .filter(dsl::plugin_definition_id.eq(definition_id))
            .filter(dsl::schema_version.lt(schema_version)),
    )
    .set(dsl::needs_config_update.eq(true))
    .execute(conn)?;

    dsl::plugin_instances
        .filter(dsl::plugin_definition_id.eq(definition_id))
        .order(dsl::id.asc())
        .select(PluginInstance::as_select())
        .load(conn)
}
