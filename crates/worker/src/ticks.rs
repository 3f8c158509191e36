use std::sync::Arc;
use std::time::{Duration, Instant};

use quorum_domain::DomainResult;
use quorum_domain::context::StoreContext;
use quorum_domain::jobs::JobKind;
use quorum_domain::liveness::{LivenessSweep, SweepOutcome};
use quorum_domain::ports::accounts::AccountDirectory;
use quorum_domain::ports::posts::PostPublisher;
use quorum_domain::publishing::{PublishScheduler, PublishTickReport};
use quorum_domain::purge::{PurgeOutcome, PurgeWorkflow, WallClockBudget};
use quorum_domain::responses::ResponseRepository;
use quorum_domain::surveys::SurveyRepository;
use tracing::{error, info, warn};

use crate::observability;

/// Purges run back to back while they report progress, up to this many per
/// tick.
const MAX_PURGE_ROUNDS: usize = 32;

#[derive(Clone, Debug)]
pub struct TickSettings {
    pub purge_budget_ms: u64,
    pub purge_batch_size: usize,
    pub liveness_budget_ms: u64,
    pub liveness_interval_ms: u64,
}

pub struct Worker {
    ctx: StoreContext,
    scheduler: PublishScheduler,
    purge: PurgeWorkflow,
    sweep: LivenessSweep,
    settings: TickSettings,
    last_sweep: Option<Instant>,
}

impl Worker {
    pub fn new(
        ctx: StoreContext,
        publisher: Arc<dyn PostPublisher>,
        directory: Arc<dyn AccountDirectory>,
        settings: TickSettings,
    ) -> Self {
        let surveys = SurveyRepository::new(ctx.clone(), publisher.clone());
        let responses = ResponseRepository::new(ctx.clone());
        let purge = PurgeWorkflow::new(surveys.clone())
            .with_batch_size(settings.purge_batch_size)
            .with_budget_ms(settings.purge_budget_ms);
        let sweep = LivenessSweep::new(surveys, responses, purge.clone(), directory);
        Self {
            scheduler: PublishScheduler::new(ctx.clone(), publisher),
            ctx,
            purge,
            sweep,
            settings,
            last_sweep: None,
        }
    }

    /// One pass of every periodic job. Failures are logged and counted, never
    /// returned, so the loop keeps running.
    pub async fn tick(&mut self) {
        if let Err(err) = self.publish_due().await {
            error!(error = %err, "publish tick failed");
        }
        self.drain_purges().await;
        if self.sweep_due() {
            self.last_sweep = Some(Instant::now());
            if let Err(err) = self.sweep_liveness().await {
                error!(error = %err, "liveness sweep failed");
            }
        }
        self.record_queue_depths().await;
    }

    pub async fn publish_due(&self) -> DomainResult<PublishTickReport> {
        let started = Instant::now();
        let result = self.scheduler.run_tick(self.ctx.now_ms()).await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(report) => {
                observability::register_tick(JobKind::PublishDue, "ok", duration_ms);
                observability::register_publish_report(
                    report.published.len(),
                    report.skipped,
                    report.failed,
                );
                if !report.published.is_empty() || report.failed > 0 {
                    info!(
                        published = report.published.len(),
                        skipped = report.skipped,
                        failed = report.failed,
                        "publish tick finished"
                    );
                }
            }
            Err(_) => observability::register_tick(JobKind::PublishDue, "error", duration_ms),
        }
        result
    }

    /// Runs purge ticks until the queue is idle, a lease blocks progress, or an
    /// error occurs. Returns the last outcome seen.
    pub async fn drain_purges(&self) -> Option<PurgeOutcome> {
        let mut last = None;
        for _ in 0..MAX_PURGE_ROUNDS {
            let started = Instant::now();
            let mut budget = WallClockBudget::new(Duration::from_millis(self.settings.purge_budget_ms));
            let result = self.purge.execute_tick_with_budget(&mut budget).await;
            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(err) => {
                    observability::register_tick(JobKind::PurgeDeleted, "error", duration_ms);
                    observability::register_purge_outcome("error");
                    warn!(error = %err, "purge tick failed");
                    return last;
                }
            };
            observability::register_tick(JobKind::PurgeDeleted, "ok", duration_ms);
            let label = match &outcome {
                PurgeOutcome::Idle => "idle",
                PurgeOutcome::InFlight(_) => "in_flight",
                PurgeOutcome::Completed(_) => "completed",
                PurgeOutcome::Incomplete(_) => "incomplete",
            };
            observability::register_purge_outcome(label);

            let keep_going = matches!(
                outcome,
                PurgeOutcome::Completed(_) | PurgeOutcome::Incomplete(_)
            );
            last = Some(outcome);
            if !keep_going {
                break;
            }
        }
        last
    }

    fn sweep_due(&self) -> bool {
        match self.last_sweep {
            None => true,
            Some(at) => at.elapsed() >= Duration::from_millis(self.settings.liveness_interval_ms),
        }
    }

    pub async fn sweep_liveness(&self) -> DomainResult<SweepOutcome> {
        let started = Instant::now();
        let mut budget =
            WallClockBudget::new(Duration::from_millis(self.settings.liveness_budget_ms));
        let result = self.sweep.run(&mut budget).await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(SweepOutcome::Deferred) => {
                observability::register_tick(JobKind::LivenessSweep, "ok", duration_ms);
                observability::register_sweep_outcome("deferred", 0, 0);
            }
            Ok(SweepOutcome::Incomplete(report)) => {
                observability::register_tick(JobKind::LivenessSweep, "ok", duration_ms);
                observability::register_sweep_outcome(
                    "incomplete",
                    report.owners_retired,
                    report.responses_removed,
                );
            }
            Ok(SweepOutcome::Completed(report)) => {
                observability::register_tick(JobKind::LivenessSweep, "ok", duration_ms);
                observability::register_sweep_outcome(
                    "completed",
                    report.owners_retired,
                    report.responses_removed,
                );
            }
            Err(_) => observability::register_tick(JobKind::LivenessSweep, "error", duration_ms),
        }
        result
    }

    async fn record_queue_depths(&self) {
        let publish = self.scheduler.queue_depth().await;
        let delete = self.ctx.kv.hlen(&self.ctx.keys.delete_queue()).await;
        match (publish, delete) {
            (Ok(publish), Ok(delete)) => observability::set_queue_depths(publish, delete),
            (Err(err), _) => warn!(error = %err, "failed to read publish queue depth"),
            (_, Err(err)) => warn!(error = %err, "failed to read delete queue depth"),
        }
    }
}
