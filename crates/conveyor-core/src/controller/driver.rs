//! Per-task driver: runs stages in order and jobs through the backend.
//!
//! The driver never holds the task lock across a backend call. It takes the
//! lock to read what it needs or to record a transition, acknowledges, and
//! releases. Control operations interleave with it at those points.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conveyor_types::event::TaskEvent;
use conveyor_types::status::Status;
use conveyor_types::task::{ApprovalStatus, JobTask, JobTaskSpec, TaskKey};
use tokio::task::JoinSet;

use crate::backend::BackendError;
use crate::backend::debug::DebugChannel;
use crate::backend::execution::{ExecutionBackend, JobReport};
use crate::backend::notify::Notifier;
use crate::repository::task::TaskRepository;
use crate::workflow::approval::ApprovalGate;
use crate::workflow::render::{output_placeholder, render};

use super::Shared;
use super::registry::LiveTask;

pub(super) async fn drive<R, B, D, N>(shared: Arc<Shared<R, B, D, N>>, live: Arc<LiveTask>) -> Status
where
    R: TaskRepository + 'static,
    B: ExecutionBackend + 'static,
    D: DebugChannel + 'static,
    N: Notifier + 'static,
{
    let key = live.key().clone();
    let stage_count = {
        let mut task = live.lock().await;
        task.status = Status::Running;
        task.started_at.get_or_insert_with(Utc::now);
        if let Err(e) = shared.ack(&live, &task).await {
            tracing::warn!(task = %key, "failed to persist task start: {e}");
        }
        shared.publish(TaskEvent::TaskStarted {
            key: key.clone(),
            is_restart: task.is_restart,
        });
        tracing::info!(task = %key, restart = task.is_restart, "task started");
        task.stages.len()
    };

    let mut outcome = Status::Passed;
    for stage_idx in 0..stage_count {
        let status = run_stage(&shared, &live, stage_idx).await;
        if status != Status::Passed {
            outcome = status;
            break;
        }
    }

    finish(&shared, &live, outcome).await
}

async fn finish<R, B, D, N>(shared: &Arc<Shared<R, B, D, N>>, live: &Arc<LiveTask>, outcome: Status) -> Status
where
    R: TaskRepository + 'static,
    B: ExecutionBackend + 'static,
    D: DebugChannel + 'static,
    N: Notifier + 'static,
{
    let key = live.key().clone();
    let (creator, error) = {
        let mut task = live.lock().await;
        task.status = outcome;
        task.ended_at = Some(Utc::now());
        if outcome != Status::Passed && task.error.is_none() {
            task.error = task.stages.iter().find_map(|stage| stage.error.clone());
        }
        if let Err(e) = shared.ack(live, &task).await {
            tracing::error!(task = %key, "failed to persist final task state: {e}");
        }
        shared.registry.remove(&key);
        (task.creator.clone(), task.error.clone())
    };

    shared.publish(TaskEvent::TaskFinished {
        key: key.clone(),
        status: outcome,
    });
    tracing::info!(task = %key, status = %outcome, "task finished");

    let title = format!("{key} {outcome}");
    let sent = if outcome == Status::Passed {
        shared
            .notifier
            .notify_success(&creator, &title, "all stages passed")
            .await
    } else {
        let cause = error.unwrap_or_else(|| outcome.to_string());
        shared.notifier.notify_failure(&creator, &title, &cause).await
    };
    if let Err(e) = sent {
        tracing::warn!(task = %key, "failed to send notification: {e}");
    }

    outcome
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

async fn run_stage<R, B, D, N>(shared: &Arc<Shared<R, B, D, N>>, live: &Arc<LiveTask>, stage_idx: usize) -> Status
where
    R: TaskRepository + 'static,
    B: ExecutionBackend + 'static,
    D: DebugChannel + 'static,
    N: Notifier + 'static,
{
    let key = live.key().clone();

    let (stage_name, gated) = {
        let mut task = live.lock().await;
        let now = Utc::now();
        let stage = &mut task.stages[stage_idx];
        if stage.status.is_terminal() {
            return stage.status;
        }
        let name = stage.name.clone();
        let gated = stage.gated()
            && stage
                .approval
                .as_ref()
                .is_some_and(|approval| approval.status != ApprovalStatus::Passed);
        if gated {
            if let Some(approval) = stage.approval.as_mut() {
                ApprovalGate::new(approval).open(now);
            }
            stage.status = Status::Pending;
            stage.started_at.get_or_insert(now);
            if let Err(e) = shared.ack(live, &task).await {
                tracing::warn!(task = %key, stage = name.as_str(), "failed to persist gate opening: {e}");
            }
            shared.publish(TaskEvent::StageChanged {
                key: key.clone(),
                stage: name.clone(),
                status: Status::Pending,
            });
            shared.publish(TaskEvent::ApprovalChanged {
                key: key.clone(),
                stage: name.clone(),
                status: ApprovalStatus::Pending,
            });
            tracing::info!(task = %key, stage = name.as_str(), "waiting for approval");
        }
        (name, gated)
    };

    if gated {
        let decision = wait_for_approval(shared, live, stage_idx).await;
        if decision != ApprovalStatus::Passed {
            let status = match decision {
                ApprovalStatus::Cancelled => Status::Cancelled,
                _ => Status::Reject,
            };
            let mut task = live.lock().await;
            let stage = &mut task.stages[stage_idx];
            stage.status = status;
            stage.ended_at = Some(Utc::now());
            stage.error = stage
                .approval
                .as_ref()
                .and_then(|approval| approval.reject_reason.clone());
            if let Err(e) = shared.ack(live, &task).await {
                tracing::warn!(task = %key, stage = stage_name.as_str(), "failed to persist gate outcome: {e}");
            }
            shared.publish(TaskEvent::StageChanged {
                key: key.clone(),
                stage: stage_name.clone(),
                status,
            });
            tracing::info!(task = %key, stage = stage_name.as_str(), status = %status, "stage closed at approval gate");
            return status;
        }
    }

    let (parallel, job_count) = {
        let mut task = live.lock().await;
        let stage = &mut task.stages[stage_idx];
        if stage.status.is_terminal() {
            return stage.status;
        }
        stage.status = Status::Running;
        stage.started_at.get_or_insert_with(Utc::now);
        let running = (stage.parallel, stage.jobs.len());
        if let Err(e) = shared.ack(live, &task).await {
            tracing::warn!(task = %key, stage = stage_name.as_str(), "failed to persist stage start: {e}");
        }
        running
    };
    shared.publish(TaskEvent::StageChanged {
        key: key.clone(),
        stage: stage_name.clone(),
        status: Status::Running,
    });
    tracing::debug!(task = %key, stage = stage_name.as_str(), parallel, jobs = job_count, "stage running");

    if parallel {
        let mut jobs = JoinSet::new();
        for job_idx in 0..job_count {
            jobs.spawn(run_job(Arc::clone(shared), Arc::clone(live), stage_idx, job_idx));
        }
        while let Some(joined) = jobs.join_next().await {
            if let Err(e) = joined {
                tracing::error!(task = %key, stage = stage_name.as_str(), "job driver aborted: {e}");
            }
        }
    } else {
        for job_idx in 0..job_count {
            let status = run_job(Arc::clone(shared), Arc::clone(live), stage_idx, job_idx).await;
            let optional = live.lock().await.stages[stage_idx].jobs[job_idx].optional;
            if status != Status::Passed && !optional {
                break;
            }
        }
    }

    let mut task = live.lock().await;
    let stage = &mut task.stages[stage_idx];
    let (status, error) = match stage
        .jobs
        .iter()
        .find(|job| !job.optional && job.status != Status::Passed)
    {
        None => (Status::Passed, None),
        Some(job) => {
            let status = if job.status.is_terminal() {
                job.status
            } else {
                Status::Failed
            };
            let cause = job.error.as_deref().unwrap_or(job.status.as_str());
            (status, Some(format!("job {}: {cause}", job.name)))
        }
    };
    stage.status = status;
    stage.ended_at = Some(Utc::now());
    stage.error = error;
    if let Err(e) = shared.ack(live, &task).await {
        tracing::warn!(task = %key, stage = stage_name.as_str(), "failed to persist stage outcome: {e}");
    }
    drop(task);

    shared.publish(TaskEvent::StageChanged {
        key: key.clone(),
        stage: stage_name.clone(),
        status,
    });
    tracing::info!(task = %key, stage = stage_name.as_str(), status = %status, "stage finished");
    status
}

/// Block until the stage's gate is decided, expires or the task is cancelled.
async fn wait_for_approval<R, B, D, N>(
    shared: &Arc<Shared<R, B, D, N>>,
    live: &Arc<LiveTask>,
    stage_idx: usize,
) -> ApprovalStatus
where
    R: TaskRepository + 'static,
    B: ExecutionBackend + 'static,
    D: DebugChannel + 'static,
    N: Notifier + 'static,
{
    let check = shared.settings.approval_check_interval;
    loop {
        let wait = {
            let mut task = live.lock().await;
            let stage_name = task.stages[stage_idx].name.clone();
            let Some(approval) = task.stages[stage_idx].approval.as_mut() else {
                return ApprovalStatus::Passed;
            };
            let mut gate = ApprovalGate::new(approval);
            let now = Utc::now();
            if gate.expire(now) {
                tracing::info!(task = %live.key(), stage = stage_name.as_str(), "approval gate expired");
                if let Err(e) = shared.ack(live, &task).await {
                    tracing::warn!(task = %live.key(), "failed to persist gate expiry: {e}");
                }
                shared.publish(TaskEvent::ApprovalChanged {
                    key: live.key().clone(),
                    stage: stage_name,
                    status: ApprovalStatus::Reject,
                });
                return ApprovalStatus::Reject;
            }
            let status = gate.status();
            if status.is_decided() {
                return status;
            }
            gate.deadline()
                .and_then(|deadline| (deadline - now).to_std().ok())
                .map_or(check, |remaining| remaining.min(check))
        };

        tokio::select! {
            _ = live.cancel_token().cancelled() => return ApprovalStatus::Cancelled,
            _ = live.woken() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

fn settle(job: &mut JobTask, status: Status, error: Option<String>) {
    job.status = status;
    job.ended_at = Some(Utc::now());
    job.error = error;
}

fn job_timeout(job: &JobTask, default: Duration) -> Duration {
    job.timeout_minutes
        .map_or(default, |minutes| Duration::from_secs(minutes.saturating_mul(60)))
}

async fn run_job<R, B, D, N>(
    shared: Arc<Shared<R, B, D, N>>,
    live: Arc<LiveTask>,
    stage_idx: usize,
    job_idx: usize,
) -> Status
where
    R: TaskRepository + 'static,
    B: ExecutionBackend + 'static,
    D: DebugChannel + 'static,
    N: Notifier + 'static,
{
    let key = live.key().clone();
    let token = live.cancel_token().clone();

    // Render against the outputs published so far and move to `prepare`.
    let job = {
        let mut task = live.lock().await;
        let status = task.stages[stage_idx].jobs[job_idx].status;
        if status.is_terminal() {
            return status;
        }
        let rendered = render::<JobTaskSpec>(&task.stages[stage_idx].jobs[job_idx].spec, &task.global_context);
        let job = &mut task.stages[stage_idx].jobs[job_idx];
        let name = job.name.clone();
        let status = if token.is_cancelled() {
            settle(job, Status::Cancelled, None);
            Status::Cancelled
        } else {
            match rendered {
                Ok(spec) => {
                    job.spec = spec;
                    job.status = Status::Prepare;
                    job.started_at = Some(Utc::now());
                    Status::Prepare
                }
                Err(e) => {
                    settle(job, Status::Failed, Some(format!("failed to render payload: {e}")));
                    Status::Failed
                }
            }
        };
        let snapshot = task.stages[stage_idx].jobs[job_idx].clone();
        if status.is_terminal() {
            if let Err(e) = shared.ack(&live, &task).await {
                tracing::warn!(task = %key, job = name.as_str(), "failed to persist job outcome: {e}");
            }
        } else {
            shared.ack_deferred(&live, &task);
        }
        drop(task);
        job_changed(&shared, &key, &name, status);
        if status.is_terminal() {
            return status;
        }
        snapshot
    };

    let handle = match shared.backend.submit(&key, &job).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(task = %key, job = job.name.as_str(), "job submission failed: {e}");
            return record_outcome(&shared, &live, stage_idx, job_idx, JobReport::failed(format!("failed to submit: {e}")))
                .await;
        }
    };
    {
        let mut task = live.lock().await;
        task.stages[stage_idx].jobs[job_idx].execution = Some(handle.clone());
        shared.ack_deferred(&live, &task);
    }
    tracing::debug!(task = %key, job = job.name.as_str(), unit = handle.unit.as_str(), "job submitted");

    let timeout = job_timeout(&job, shared.settings.default_job_timeout);
    let deadline = tokio::time::Instant::now() + timeout;
    let mut cancel_sent = false;
    let mut timed_out = false;
    // Set once the unit has been told to stop.
    let mut stop_by: Option<tokio::time::Instant> = None;
    let mut last = Status::Prepare;

    loop {
        tokio::select! {
            _ = token.cancelled(), if !cancel_sent => {
                cancel_sent = true;
                stop_by = Some(tokio::time::Instant::now() + shared.settings.stop_grace);
                if let Err(e) = shared.backend.cancel(&handle).await {
                    tracing::warn!(task = %key, job = job.name.as_str(), "failed to cancel execution unit: {e}");
                }
            }
            _ = tokio::time::sleep_until(deadline), if !cancel_sent && !timed_out => {
                timed_out = true;
                cancel_sent = true;
                stop_by = Some(tokio::time::Instant::now() + shared.settings.stop_grace);
                tracing::warn!(task = %key, job = job.name.as_str(), ?timeout, "job timed out");
                if let Err(e) = shared.backend.cancel(&handle).await {
                    tracing::warn!(task = %key, job = job.name.as_str(), "failed to stop timed-out unit: {e}");
                }
            }
            _ = tokio::time::sleep(shared.settings.poll_interval) => {}
        }

        let polled = match shared.backend.status(&handle).await {
            Ok(report) => Some(report),
            Err(BackendError::UnitNotFound(unit)) => {
                Some(JobReport::failed(format!("execution unit {unit} disappeared")))
            }
            Err(e) => {
                tracing::warn!(task = %key, job = job.name.as_str(), "status poll failed: {e}");
                None
            }
        };

        let stopped = stop_by.is_some_and(|at| tokio::time::Instant::now() >= at);
        let mut report = match polled {
            Some(report) if report.status.is_terminal() || !stopped => report,
            _ if stopped => {
                tracing::warn!(task = %key, job = job.name.as_str(), "execution unit did not confirm stop, settling job");
                unconfirmed_stop(timed_out, timeout)
            }
            _ => continue,
        };

        if report.status.is_terminal() {
            if timed_out && report.status != Status::Passed {
                report.status = Status::Timeout;
                report
                    .error
                    .get_or_insert_with(|| format!("timed out after {timeout:?}"));
            }
            return record_outcome(&shared, &live, stage_idx, job_idx, report).await;
        }

        let mut task = live.lock().await;
        let status = match report.status {
            Status::Created | Status::Pending => Status::Prepare,
            status if status.is_debug() && !task.debug => Status::Running,
            status => status,
        };
        if status != last {
            last = status;
            task.stages[stage_idx].jobs[job_idx].status = status;
            shared.ack_deferred(&live, &task);
            drop(task);
            job_changed(&shared, &key, &job.name, status);
        }
    }
}

/// Outcome for a unit that was told to stop but never reported a final status.
fn unconfirmed_stop(timed_out: bool, timeout: Duration) -> JobReport {
    if timed_out {
        let mut report = JobReport::with_status(Status::Timeout);
        report.error = Some(format!(
            "timed out after {timeout:?}, execution unit did not confirm stop"
        ));
        report
    } else {
        let mut report = JobReport::with_status(Status::Cancelled);
        report.error = Some("execution unit did not confirm cancellation".to_string());
        report
    }
}

/// Record a terminal job report and publish its outputs to the task context.
async fn record_outcome<R, B, D, N>(
    shared: &Arc<Shared<R, B, D, N>>,
    live: &Arc<LiveTask>,
    stage_idx: usize,
    job_idx: usize,
    report: JobReport,
) -> Status
where
    R: TaskRepository + 'static,
    B: ExecutionBackend + 'static,
    D: DebugChannel + 'static,
    N: Notifier + 'static,
{
    let key = live.key().clone();
    let mut task = live.lock().await;
    let job = &mut task.stages[stage_idx].jobs[job_idx];
    let name = job.name.clone();
    settle(job, report.status, report.error);
    if report.status == Status::Passed {
        job.outputs = report.outputs.clone();
        for (output, value) in report.outputs {
            task.global_context.insert(output_placeholder(&name, &output), value);
        }
    }
    if let Err(e) = shared.ack(live, &task).await {
        tracing::warn!(task = %key, job = name.as_str(), "failed to persist job outcome: {e}");
    }
    drop(task);

    job_changed(shared, &key, &name, report.status);
    tracing::info!(task = %key, job = name.as_str(), status = %report.status, "job finished");
    report.status
}

fn job_changed<R, B, D, N>(shared: &Shared<R, B, D, N>, key: &TaskKey, job: &str, status: Status)
where
    R: TaskRepository + 'static,
    B: ExecutionBackend + 'static,
    D: DebugChannel + 'static,
    N: Notifier + 'static,
{
    shared.publish(TaskEvent::JobChanged {
        key: key.clone(),
        job: job.to_string(),
        status,
    });
}
