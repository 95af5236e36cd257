//! Agent job service: durable task store plus an executor pool running
//! LLM-with-tools loops.
//!
//! Tasks are prompt templates bound to a model with MCP servers; jobs are
//! single executions. Both mirror to JSON files under the configs dir.
//! Cron-scheduled tasks enqueue jobs exactly like API calls do, and job
//! results fan out to webhooks and result-push targets with bounded
//! retries.

mod cron;
mod llm;
mod mcp;

pub use cron::CronScheduler;
pub use llm::{run_tool_loop, LlmClient, ToolLoopCallbacks, ToolLoopSettings};
pub use mcp::{McpSession, McpSessionPool, McpTool};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use modelgate_common::agent::{Job, JobStatus, JobTrace, JobsFile, ResultPush, Task, TasksFile};

use crate::error::{Error, Result};
use crate::model_config::ModelConfigLoader;

const JOB_QUEUE_CAPACITY: usize = 100;
const WORKER_COUNT: usize = 5;
const WEBHOOK_MAX_ATTEMPTS: u32 = 3;

struct JobExecution {
    job_id: String,
    task: Task,
    cancel_rx: watch::Receiver<bool>,
}

pub struct AgentJobService {
    config_loader: Arc<ModelConfigLoader>,
    /// Loopback address of the gateway's own OpenAI surface.
    api_address: String,
    api_key: String,

    tasks: StdMutex<HashMap<String, Task>>,
    jobs: StdMutex<HashMap<String, Job>>,
    tasks_file: PathBuf,
    jobs_file: PathBuf,
    /// Serializes every state-file write.
    file_lock: StdMutex<()>,

    job_tx: mpsc::Sender<JobExecution>,
    job_rx: Mutex<Option<mpsc::Receiver<JobExecution>>>,
    cancellations: StdMutex<HashMap<String, watch::Sender<bool>>>,

    cron: Arc<CronScheduler>,
    mcp_pool: Arc<McpSessionPool>,

    retention_days: StdMutex<u32>,
    http: reqwest::Client,
    /// First retry delay; doubles per attempt. Shortened in tests.
    webhook_backoff: StdMutex<Duration>,
}

impl AgentJobService {
    pub fn new(
        config_loader: Arc<ModelConfigLoader>,
        configs_dir: &std::path::Path,
        api_address: &str,
        api_key: &str,
        retention_days: u32,
    ) -> Arc<Self> {
        let (job_tx, job_rx) = mpsc::channel(JOB_QUEUE_CAPACITY);
        Arc::new(Self {
            config_loader,
            api_address: api_address.to_string(),
            api_key: api_key.to_string(),
            tasks: StdMutex::new(HashMap::new()),
            jobs: StdMutex::new(HashMap::new()),
            tasks_file: configs_dir.join("agent_tasks.json"),
            jobs_file: configs_dir.join("agent_jobs.json"),
            file_lock: StdMutex::new(()),
            job_tx,
            job_rx: Mutex::new(Some(job_rx)),
            cancellations: StdMutex::new(HashMap::new()),
            cron: Arc::new(CronScheduler::new()),
            mcp_pool: Arc::new(McpSessionPool::new()),
            retention_days: StdMutex::new(if retention_days == 0 {
                30
            } else {
                retention_days
            }),
            http: reqwest::Client::new(),
            webhook_backoff: StdMutex::new(Duration::from_secs(1)),
        })
    }

    /// Shrink the delivery backoff (test hook).
    pub fn set_webhook_backoff(&self, base: Duration) {
        *self.webhook_backoff.lock().unwrap() = base;
    }

    pub fn update_retention_days(&self, days: u32) {
        *self.retention_days.lock().unwrap() = if days == 0 { 30 } else { days };
    }

    pub fn cron_scheduler(&self) -> &Arc<CronScheduler> {
        &self.cron
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn load_tasks_from_file(self: &Arc<Self>) -> Result<()> {
        let content = {
            let _guard = self.file_lock.lock().unwrap();
            match std::fs::read_to_string(&self.tasks_file) {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!("agent_tasks.json not found, starting empty");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        };
        let file: TasksFile = serde_json::from_str(&content)?;

        let count = file.tasks.len();
        for task in file.tasks {
            if task.enabled && !task.cron.is_empty() {
                if let Err(e) = self.schedule_cron_task(&task) {
                    tracing::warn!(task = %task.id, error = %e, "could not schedule cron task on load");
                }
            }
            self.tasks.lock().unwrap().insert(task.id.clone(), task);
        }
        tracing::info!(count, "loaded agent tasks");
        Ok(())
    }

    pub fn save_tasks_to_file(&self) -> Result<()> {
        let file = TasksFile {
            tasks: self.tasks.lock().unwrap().values().cloned().collect(),
        };
        let content = serde_json::to_string_pretty(&file)?;
        let _guard = self.file_lock.lock().unwrap();
        std::fs::write(&self.tasks_file, content)?;
        Ok(())
    }

    pub fn load_jobs_from_file(&self) -> Result<()> {
        let content = {
            let _guard = self.file_lock.lock().unwrap();
            match std::fs::read_to_string(&self.jobs_file) {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!("agent_jobs.json not found, starting empty");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        };
        let file: JobsFile = serde_json::from_str(&content)?;

        let count = file.jobs.len();
        let mut jobs = self.jobs.lock().unwrap();
        for job in file.jobs {
            jobs.insert(job.id.clone(), job);
        }
        drop(jobs);
        tracing::info!(count, "loaded agent jobs");
        Ok(())
    }

    pub fn save_jobs_to_file(&self) -> Result<()> {
        let file = JobsFile {
            jobs: self.jobs.lock().unwrap().values().cloned().collect(),
            last_cleanup: Some(Utc::now()),
        };
        let content = serde_json::to_string_pretty(&file)?;
        let _guard = self.file_lock.lock().unwrap();
        std::fs::write(&self.jobs_file, content)?;
        Ok(())
    }

    fn persist_tasks(&self) {
        if let Err(e) = self.save_tasks_to_file() {
            tracing::error!(error = %e, "failed to save agent tasks");
        }
    }

    fn persist_jobs(&self) {
        if let Err(e) = self.save_jobs_to_file() {
            tracing::error!(error = %e, "failed to save agent jobs");
        }
    }

    // ------------------------------------------------------------------
    // Task CRUD
    // ------------------------------------------------------------------

    pub fn create_task(self: &Arc<Self>, mut task: Task) -> Result<String> {
        if task.name.is_empty() {
            return Err(Error::InvalidConfig("task name is required".to_string()));
        }
        if task.model.is_empty() {
            return Err(Error::InvalidConfig("task model is required".to_string()));
        }
        if task.prompt.is_empty() {
            return Err(Error::InvalidConfig("task prompt is required".to_string()));
        }

        let id = Uuid::new_v4().to_string();
        task.id = id.clone();
        let now = Utc::now();
        task.created_at = Some(now);
        task.updated_at = Some(now);
        // New tasks start enabled; disabling is an update-time action.
        task.enabled = true;

        if task.enabled && !task.cron.is_empty() {
            // A broken cron expression fails task creation outright; a
            // silently unscheduled task is worse than an error.
            self.schedule_cron_task(&task)?;
        }

        self.tasks.lock().unwrap().insert(id.clone(), task);
        self.persist_tasks();
        Ok(id)
    }

    pub fn update_task(self: &Arc<Self>, id: &str, mut task: Task) -> Result<()> {
        let existing = self
            .tasks
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task not found: {}", id)))?;

        task.id = id.to_string();
        task.created_at = existing.created_at;
        task.updated_at = Some(Utc::now());

        // Old entry out first, then at most one new entry in.
        if !existing.cron.is_empty() {
            self.unschedule_cron_task(id);
        }
        if task.enabled && !task.cron.is_empty() {
            self.schedule_cron_task(&task)?;
        }

        self.tasks.lock().unwrap().insert(id.to_string(), task);
        self.persist_tasks();
        Ok(())
    }

    pub fn delete_task(&self, id: &str) -> Result<()> {
        if self.tasks.lock().unwrap().remove(id).is_none() {
            return Err(Error::NotFound(format!("task not found: {}", id)));
        }
        self.unschedule_cron_task(id);
        self.persist_tasks();
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.tasks.lock().unwrap().get(id).cloned()
    }

    /// Tasks sorted newest first, name as tiebreak.
    pub fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.lock().unwrap().values().cloned().collect();
        tasks.sort_by(|a, b| match b.created_at.cmp(&a.created_at) {
            std::cmp::Ordering::Equal => a.name.cmp(&b.name),
            other => other,
        });
        tasks
    }

    // ------------------------------------------------------------------
    // Cron wiring
    // ------------------------------------------------------------------

    pub fn schedule_cron_task(self: &Arc<Self>, task: &Task) -> Result<()> {
        if task.cron.is_empty() {
            return Ok(());
        }
        let weak = Arc::downgrade(self);
        let task_id = task.id.clone();
        let params = task.cron_parameters.clone();
        self.cron.add(
            &task.id,
            &task.cron,
            Arc::new(move || {
                let Some(service) = weak.upgrade() else { return };
                let task_id = task_id.clone();
                let params = params.clone();
                tokio::spawn(async move {
                    if let Err(e) = service.execute_job(&task_id, params, "cron").await {
                        tracing::error!(task = %task_id, error = %e, "cron job execution failed");
                    }
                });
            }),
        )?;
        tracing::info!(task = %task.id, cron = %task.cron, "scheduled cron task");
        Ok(())
    }

    pub fn unschedule_cron_task(&self, task_id: &str) {
        if self.cron.remove(task_id) {
            tracing::info!(task = %task_id, "unscheduled cron task");
        }
    }

    // ------------------------------------------------------------------
    // Job lifecycle
    // ------------------------------------------------------------------

    /// Create a pending job and hand it to the executor pool. A full queue
    /// fails the job immediately instead of blocking the caller.
    pub async fn execute_job(
        self: &Arc<Self>,
        task_id: &str,
        parameters: HashMap<String, String>,
        triggered_by: &str,
    ) -> Result<String> {
        let task = self
            .get_task(task_id)
            .ok_or_else(|| Error::NotFound(format!("task not found: {}", task_id)))?;
        if !task.enabled {
            return Err(Error::InvalidConfig(format!(
                "task is disabled: {}",
                task_id
            )));
        }

        let job_id = Uuid::new_v4().to_string();
        let job = Job {
            id: job_id.clone(),
            task_id: task_id.to_string(),
            status: JobStatus::Pending,
            parameters,
            result: String::new(),
            error: String::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            triggered_by: triggered_by.to_string(),
            traces: Vec::new(),
            webhook_sent: false,
            webhook_sent_at: None,
            webhook_error: String::new(),
            result_pushed: false,
            result_pushed_at: None,
            result_push_error: String::new(),
        };
        self.jobs.lock().unwrap().insert(job_id.clone(), job);
        self.persist_jobs();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancellations
            .lock()
            .unwrap()
            .insert(job_id.clone(), cancel_tx);

        let execution = JobExecution {
            job_id: job_id.clone(),
            task,
            cancel_rx,
        };
        if self.job_tx.try_send(execution).is_err() {
            self.update_job(&job_id, |job| {
                job.status = JobStatus::Failed;
                job.error = "job queue is full".to_string();
                job.completed_at = Some(Utc::now());
            });
            self.cancellations.lock().unwrap().remove(&job_id);
            self.persist_jobs();
            return Err(Error::QueueFull("job queue is full".to_string()));
        }

        Ok(job_id)
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.jobs.lock().unwrap().get(id).cloned()
    }

    /// Jobs newest first, optionally filtered by task and status.
    pub fn list_jobs(
        &self,
        task_id: Option<&str>,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| task_id.map_or(true, |t| j.task_id == t))
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if limit > 0 && jobs.len() > limit {
            jobs.truncate(limit);
        }
        jobs
    }

    /// Cancel a pending or running job. A cancelled job never becomes
    /// completed afterwards.
    pub fn cancel_job(&self, id: &str) -> Result<()> {
        let job = self
            .get_job(id)
            .ok_or_else(|| Error::NotFound(format!("job not found: {}", id)))?;
        if job.status.is_terminal() {
            return Err(Error::InvalidConfig(format!(
                "job cannot be cancelled: status is {:?}",
                job.status
            )));
        }

        if let Some(cancel_tx) = self.cancellations.lock().unwrap().remove(id) {
            let _ = cancel_tx.send(true);
        }
        self.update_job(id, |job| {
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(Utc::now());
        });
        self.persist_jobs();
        Ok(())
    }

    pub fn delete_job(&self, id: &str) -> Result<()> {
        if self.jobs.lock().unwrap().remove(id).is_none() {
            return Err(Error::NotFound(format!("job not found: {}", id)));
        }
        self.persist_jobs();
        Ok(())
    }

    /// Drop jobs older than the retention window.
    pub fn cleanup_old_jobs(&self) -> usize {
        let days = *self.retention_days.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);

        let removed = {
            let mut jobs = self.jobs.lock().unwrap();
            let before = jobs.len();
            jobs.retain(|_, job| job.created_at >= cutoff);
            before - jobs.len()
        };
        if removed > 0 {
            tracing::info!(removed, retention_days = days, "cleaned up old agent jobs");
            self.persist_jobs();
        }
        removed
    }

    // ------------------------------------------------------------------
    // Service lifecycle
    // ------------------------------------------------------------------

    /// Load state, start the worker pool, the cron ticker and the daily
    /// cleanup schedule.
    pub async fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.load_tasks_from_file() {
            tracing::warn!(error = %e, "failed to load agent tasks");
        }
        if let Err(e) = self.load_jobs_from_file() {
            tracing::warn!(error = %e, "failed to load agent jobs");
        }

        let rx = self
            .job_rx
            .lock()
            .await
            .take()
            .expect("agent job service started twice");

        // Fixed pool: the receiver is shared and each worker takes the
        // next job as it frees up.
        let rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..WORKER_COUNT {
            let service = self.clone();
            let rx = rx.clone();
            let mut worker_shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let execution = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = worker_shutdown.changed() => return,
                            execution = rx.recv() => execution,
                        }
                    };
                    let Some(execution) = execution else { return };
                    service.run_execution(worker_id, execution).await;
                }
            });
        }

        self.cron.clone().spawn(shutdown.clone());

        // Daily cleanup at midnight plus one pass right away.
        let weak = Arc::downgrade(self);
        if let Err(e) = self.cron.add(
            "__cleanup",
            "0 0 0 * * *",
            Arc::new(move || {
                if let Some(service) = weak.upgrade() {
                    service.cleanup_old_jobs();
                }
            }),
        ) {
            tracing::warn!(error = %e, "failed to schedule daily cleanup");
        }
        self.cleanup_old_jobs();

        tracing::info!(
            retention_days = *self.retention_days.lock().unwrap(),
            "agent job service started"
        );
    }

    async fn run_execution(self: &Arc<Self>, worker_id: usize, execution: JobExecution) {
        let job_id = execution.job_id.clone();

        // A cancellation that landed while the job sat in the queue wins.
        if *execution.cancel_rx.borrow() || self.job_is_cancelled(&job_id) {
            self.update_job(&job_id, |job| {
                if !job.status.is_terminal() {
                    job.status = JobStatus::Cancelled;
                    job.completed_at = Some(Utc::now());
                }
            });
            self.cancellations.lock().unwrap().remove(&job_id);
            self.persist_jobs();
            return;
        }

        tracing::debug!(worker = worker_id, job = %job_id, "executing agent job");
        if let Err(e) = self.execute_job_internal(&execution).await {
            tracing::error!(job = %job_id, error = %e, "agent job failed");
        }
        self.cancellations.lock().unwrap().remove(&job_id);
    }

    async fn execute_job_internal(self: &Arc<Self>, execution: &JobExecution) -> Result<()> {
        let job_id = &execution.job_id;
        let task = &execution.task;

        self.update_job(job_id, |job| {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
        });
        self.persist_jobs();

        let config = match self.config_loader.get(&task.model).await {
            Some(c) => c,
            None => {
                return self.fail_job(job_id, format!("model config not found: {}", task.model));
            }
        };

        if config.mcp.is_empty() {
            return self.fail_job(
                job_id,
                format!("no MCP servers configured for model: {}", task.model),
            );
        }
        let (remote, stdio) = match config.mcp.decode() {
            Ok(decoded) => decoded,
            Err(e) => return self.fail_job(job_id, format!("invalid MCP config: {}", e)),
        };

        let sessions = match self
            .mcp_pool
            .sessions_for_model(&config.name, &remote, &stdio)
            .await
        {
            Ok(s) => s,
            Err(e) => return self.fail_job(job_id, format!("failed to get MCP sessions: {}", e)),
        };
        if sessions.is_empty() {
            return self.fail_job(job_id, "no working MCP servers found".to_string());
        }

        let parameters = self
            .get_job(job_id)
            .map(|j| j.parameters)
            .unwrap_or_default();
        let prompt = render_prompt(&task.prompt, &parameters);

        let llm = LlmClient::new(&self.api_address, &self.api_key, &config.name);
        let settings = ToolLoopSettings {
            max_iterations: if config.agent.max_iterations > 0 {
                config.agent.max_iterations
            } else {
                3
            },
            max_attempts: if config.agent.max_attempts > 0 {
                config.agent.max_attempts
            } else {
                3
            },
            enable_reasoning: config.agent.enable_reasoning,
            enable_re_evaluation: config.agent.enable_re_evaluation,
        };

        let mut callbacks = ToolLoopCallbacks {
            on_status: Box::new(|status: &str| {
                self.append_trace(job_id, trace("status", status, "", None));
            }),
            on_reasoning: Box::new(|reasoning: &str| {
                self.append_trace(job_id, trace("reasoning", reasoning, "", None));
            }),
            on_tool_call: Box::new(|tool: &str, args: &serde_json::Value| {
                self.append_trace(job_id, trace("tool_call", "", tool, Some(args.clone())));
            }),
            on_tool_result: Box::new(|tool: &str, result: &str| {
                self.append_trace(job_id, trace("tool_result", result, tool, None));
            }),
        };

        let mut cancel_rx = execution.cancel_rx.clone();
        let outcome = tokio::select! {
            result = run_tool_loop(&llm, &sessions, &prompt, settings, &mut callbacks) => Some(result),
            _ = cancel_rx.changed() => None,
        };
        drop(callbacks);

        match outcome {
            None => {
                // Cancelled mid-loop; cancel_job already moved the status.
                self.update_job(job_id, |job| {
                    if !job.status.is_terminal() {
                        job.status = JobStatus::Cancelled;
                        job.completed_at = Some(Utc::now());
                    }
                });
                self.persist_jobs();
                Ok(())
            }
            Some(Err(e)) => self.fail_job_with_delivery(job_id, task, e.to_string()).await,
            Some(Ok(result)) => {
                self.update_job(job_id, |job| {
                    if !job.status.is_terminal() {
                        job.status = JobStatus::Completed;
                        job.result = result.clone();
                        job.completed_at = Some(Utc::now());
                    }
                });
                self.persist_jobs();

                let service = self.clone();
                let job_id = job_id.clone();
                let task = task.clone();
                tokio::spawn(async move {
                    service.deliver(&job_id, &task).await;
                });
                Ok(())
            }
        }
    }

    fn fail_job(&self, job_id: &str, message: String) -> Result<()> {
        self.update_job(job_id, |job| {
            if !job.status.is_terminal() {
                job.status = JobStatus::Failed;
                job.error = message.clone();
                job.completed_at = Some(Utc::now());
            }
        });
        self.persist_jobs();
        Err(Error::Internal(message))
    }

    async fn fail_job_with_delivery(
        self: &Arc<Self>,
        job_id: &str,
        task: &Task,
        message: String,
    ) -> Result<()> {
        let result = self.fail_job(job_id, message);
        let service = self.clone();
        let job_id = job_id.to_string();
        let task = task.clone();
        tokio::spawn(async move {
            service.deliver(&job_id, &task).await;
        });
        result
    }

    fn job_is_cancelled(&self, id: &str) -> bool {
        self.get_job(id)
            .map(|j| j.status == JobStatus::Cancelled)
            .unwrap_or(false)
    }

    fn update_job<F: FnOnce(&mut Job)>(&self, id: &str, f: F) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(id) {
            f(job);
        }
    }

    fn append_trace(&self, job_id: &str, trace: JobTrace) {
        self.update_job(job_id, |job| job.traces.push(trace));
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    /// Webhook plus result pushes for a finished job. Delivery errors are
    /// recorded on the job but never change its status.
    async fn deliver(&self, job_id: &str, task: &Task) {
        let job = match self.get_job(job_id) {
            Some(j) => j,
            None => return,
        };

        if !task.webhook_url.is_empty() {
            let payload = self.build_webhook_payload(&job, task);
            let mut headers = HashMap::new();
            if !task.webhook_auth.is_empty() {
                headers.insert("Authorization".to_string(), task.webhook_auth.clone());
            }
            match self
                .post_with_retry("POST", &task.webhook_url, &headers, payload)
                .await
            {
                Ok(()) => {
                    tracing::info!(job = %job_id, url = %task.webhook_url, "webhook delivered");
                    self.update_job(job_id, |job| {
                        job.webhook_sent = true;
                        job.webhook_sent_at = Some(Utc::now());
                        job.webhook_error = String::new();
                    });
                }
                Err(e) => {
                    tracing::error!(job = %job_id, url = %task.webhook_url, error = %e, "webhook delivery failed");
                    self.update_job(job_id, |job| {
                        job.webhook_sent = false;
                        job.webhook_error = e.to_string();
                    });
                }
            }
        }

        let pushes: &[ResultPush] = if job.status == JobStatus::Completed {
            &task.result_push
        } else {
            &task.result_push_failure
        };
        if !pushes.is_empty() {
            let mut errors = Vec::new();
            for push in pushes {
                let payload = if push.payload_template.is_empty() {
                    self.build_webhook_payload(&job, task)
                } else {
                    render_payload_template(&push.payload_template, &job, task)
                };
                let method = if push.method.is_empty() {
                    "POST"
                } else {
                    &push.method
                };
                if let Err(e) = self
                    .post_with_retry(method, &push.url, &push.headers, payload)
                    .await
                {
                    errors.push(format!("{}: {}", push.url, e));
                }
            }
            self.update_job(job_id, |job| {
                if errors.is_empty() {
                    job.result_pushed = true;
                    job.result_pushed_at = Some(Utc::now());
                    job.result_push_error = String::new();
                } else {
                    job.result_pushed = false;
                    job.result_push_error = errors.join("; ");
                }
            });
        }

        self.persist_jobs();
    }

    fn build_webhook_payload(&self, job: &Job, task: &Task) -> String {
        if !task.webhook_template.is_empty() {
            return render_payload_template(&task.webhook_template, job, task);
        }
        json!({
            "job_id": job.id,
            "task_id": job.task_id,
            "task_name": task.name,
            "status": job.status,
            "result": job.result,
            "error": job.error,
            "parameters": job.parameters,
            "started_at": job.started_at,
            "completed_at": job.completed_at,
        })
        .to_string()
    }

    /// Up to three attempts with doubling delays between them.
    async fn post_with_retry(
        &self,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        payload: String,
    ) -> Result<()> {
        let base = *self.webhook_backoff.lock().unwrap();
        let method: reqwest::Method = method
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("bad HTTP method: {}", method)))?;

        let mut last_error = String::new();
        for attempt in 0..WEBHOOK_MAX_ATTEMPTS {
            let mut request = self
                .http
                .request(method.clone(), url)
                .header("Content-Type", "application/json")
                .timeout(Duration::from_secs(30))
                .body(payload.clone());
            for (key, value) in headers {
                request = request.header(key, value);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    last_error = format!("status {}", response.status());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            if attempt + 1 < WEBHOOK_MAX_ATTEMPTS {
                tokio::time::sleep(base * 2u32.pow(attempt)).await;
            }
        }
        Err(Error::Communication(format!(
            "failed after {} attempts: {}",
            WEBHOOK_MAX_ATTEMPTS, last_error
        )))
    }
}

fn trace(
    kind: &str,
    content: &str,
    tool_name: &str,
    arguments: Option<serde_json::Value>,
) -> JobTrace {
    JobTrace {
        kind: kind.to_string(),
        content: content.to_string(),
        timestamp: Utc::now(),
        tool_name: tool_name.to_string(),
        arguments,
    }
}

/// Fill `{{.key}}` placeholders from the parameter map. Unknown keys stay
/// as-is so a misspelled placeholder is visible in the prompt.
pub fn render_prompt(template: &str, parameters: &HashMap<String, String>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in parameters {
        rendered = rendered.replace(&format!("{{{{.{}}}}}", key), value);
        rendered = rendered.replace(&format!("{{{{ .{} }}}}", key), value);
    }
    rendered
}

/// Fill job/task placeholders in a payload template.
pub fn render_payload_template(template: &str, job: &Job, task: &Task) -> String {
    let mut rendered = template.to_string();
    let replacements = [
        (".JobID", job.id.as_str()),
        (".TaskID", job.task_id.as_str()),
        (".TaskName", task.name.as_str()),
        (".Result", job.result.as_str()),
        (".Error", job.error.as_str()),
    ];
    let status = format!("{:?}", job.status).to_lowercase();
    for (key, value) in replacements {
        rendered = rendered.replace(&format!("{{{{{}}}}}", key), value);
        rendered = rendered.replace(&format!("{{{{ {} }}}}", key), value);
    }
    rendered = rendered.replace("{{.Status}}", &status);
    rendered = rendered.replace("{{ .Status }}", &status);
    for (key, value) in &job.parameters {
        rendered = rendered.replace(&format!("{{{{.Parameters.{}}}}}", key), value);
    }
    rendered
}
