//! Background loop draining the render queue.

use crate::config::RenderConfig;
use crate::db::DbPool;
use crate::models::RenderJob;
use crate::services::render_queue;
use crate::services::renderer::{RenderRequest, Renderer};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerHealth {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub stale_failed: usize,
    pub due_enqueued: usize,
    pub completed: usize,
    pub failed: usize,
    pub purged: usize,
}

struct RunningWorker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct RenderWorker {
    pool: DbPool,
    renderer: Arc<dyn Renderer>,
    config: RenderConfig,
    running: tokio::sync::Mutex<Option<RunningWorker>>,
    health: Mutex<WorkerHealth>,
}

impl RenderWorker {
    pub fn new(pool: DbPool, renderer: Arc<dyn Renderer>, config: RenderConfig) -> Self {
        Self {
            pool,
            renderer,
            config,
            running: tokio::sync::Mutex::new(None),
            health: Mutex::new(WorkerHealth::default()),
        }
    }

    /// Returns false when the worker was already running.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let worker = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { worker.run(token).await });

        self.update_health(|h| {
            h.running = true;
            h.started_at = Some(Utc::now());
        });
        *running = Some(RunningWorker { cancel, handle });
        tracing::info!(
            "Render worker started (poll every {}s)",
            self.config.poll_interval_secs
        );
        true
    }

    /// Cancels the loop and waits for the in-flight tick to finish. Returns
    /// false when nothing was running.
    pub async fn stop(&self) -> bool {
        let Some(worker) = self.running.lock().await.take() else {
            return false;
        };

        worker.cancel.cancel();
        if let Err(e) = worker.handle.await {
            tracing::error!("Render worker task panicked: {}", e);
        }
        self.update_health(|h| h.running = false);
        tracing::info!("Render worker stopped");
        true
    }

    pub fn health(&self) -> WorkerHealth {
        match self.health.lock() {
            Ok(health) => health.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = interval(Duration::from_secs(self.config.poll_interval_secs));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            if let Err(e) = self.tick(&cancel).await {
                tracing::error!("Render worker tick failed: {}", e);
                self.update_health(|h| h.last_error = Some(e.to_string()));
            }
        }
    }

    /// One pass: recover abandoned jobs, enqueue due instances, render up to
    /// `max_jobs_per_tick` jobs and purge old history. A failing job is
    /// recorded and the pass moves on.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickReport> {
        let now = Utc::now();
        let stale_before = (now - ChronoDuration::seconds(self.config.stale_after_secs)).naive_utc();
        let retain_after = (now - ChronoDuration::hours(self.config.job_retention_hours)).naive_utc();

        let mut report = TickReport::default();

        match self
            .blocking(move |conn| render_queue::fail_stale(conn, stale_before, now))
            .await
        {
            Ok(count) => report.stale_failed = count,
            Err(e) => self.record_error(format!("stale sweep failed: {}", e)),
        }
        match self
            .blocking(move |conn| render_queue::enqueue_due_instances(conn, now))
            .await
        {
            Ok(count) => report.due_enqueued = count,
            Err(e) => self.record_error(format!("due sweep failed: {}", e)),
        }

        for _ in 0..self.config.max_jobs_per_tick {
            if cancel.is_cancelled() {
                break;
            }

            let claimed = self
                .blocking(|conn| {
                    let Some(job) = render_queue::claim_next(conn, Utc::now())? else {
                        return Ok(None);
                    };
                    let request = render_request(conn, &job);
                    Ok(Some((job, request)))
                })
                .await?;

            let Some((job, request)) = claimed else {
                break;
            };

            let outcome = match request {
                Ok(request) => self.renderer.render(&request).await,
                Err(e) => Err(anyhow::anyhow!("failed to load plugin instance: {}", e)),
            };

            match outcome {
                Ok(artifact) => {
                    let finished = job.clone();
                    let stored = self
                        .blocking(move |conn| {
                            render_queue::mark_completed(conn, &finished, &artifact, Utc::now())
                        })
                        .await;
                    match stored {
                        Ok(true) => {
                            tracing::debug!("Rendered instance {} (job {})", job.plugin_instance_id, job.id);
                            report.completed += 1;
                            self.update_health(|h| h.jobs_completed += 1);
                        }
                        Ok(false) => {}
                        Err(e) => {
                            // The job stays in processing until the stale sweep releases it.
                            report.failed += 1;
                            self.record_error(format!("failed to store render of job {}: {}", job.id, e));
                            self.update_health(|h| h.jobs_failed += 1);
                        }
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    tracing::warn!(
                        "Render job {} for instance {} failed: {}",
                        job.id,
                        job.plugin_instance_id,
                        message
                    );
                    let failed = job.clone();
                    let stored = message.clone();
                    if let Err(e) = self
                        .blocking(move |conn| render_queue::mark_failed(conn, &failed, &stored, Utc::now()))
                        .await
                    {
                        tracing::error!("Failed to record failure of job {}: {}", job.id, e);
                    }
                    report.failed += 1;
                    self.update_health(|h| {
                        h.jobs_failed += 1;
                        h.last_error = Some(message);
                    });
                }
            }
        }

        report.purged = self
            .blocking(move |conn| render_queue::purge_finished(conn, retain_after))
            .await?;

        self.update_health(|h| h.last_tick_at = Some(now));
        Ok(report)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> QueryResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<T> {
            let mut conn = pool.get()?;
            Ok(f(&mut conn)?)
        })
        .await?
    }

    fn record_error(&self, message: String) {
        tracing::error!("Render worker: {}", message);
        self.update_health(|h| h.last_error = Some(message));
    }

    fn update_health(&self, f: impl FnOnce(&mut WorkerHealth)) {
        let mut health = match self.health.lock() {
            Ok(health) => health,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut health);
    }
}

fn render_request(conn: &mut SqliteConnection, job: &RenderJob) -> QueryResult<RenderRequest> {
    use crate::schema::{plugin_definitions, plugin_instances};

    let (instance_name, settings, definition): (String, String, String) = plugin_instances::table
        .inner_join(plugin_definitions::table)
        .filter(plugin_instances::id.eq(job.plugin_instance_id))
        .select((
            plugin_instances::name,
            plugin_instances::settings,
            plugin_definitions::name,
        ))
        .first(conn)?;

    let settings = serde_json::from_str(&settings).unwrap_or_else(|e| {
        tracing::warn!(
            "Instance {} has unreadable settings ({}); rendering with none",
            job.plugin_instance_id,
            e
        );
        serde_json::json!({})
    });

    Ok(RenderRequest {
        plugin_instance_id: job.plugin_instance_id,
        definition,
        instance_name,
        settings,
    })
}
