use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::DomainResult;
use crate::context::StoreContext;
use crate::error::DomainError;
use crate::keys::{validate_survey_id, validate_user_id};
use crate::ports::kv::KvBatch;
use crate::retry::retry_on_conflict;
use crate::survey::{SurveyConfig, decode_questions};
use crate::surveys::SurveyRepository;

pub const DEFAULT_PURGE_BATCH_SIZE: usize = 500;
pub const DEFAULT_PURGE_BUDGET_MS: u64 = 25_000;
/// A survey whose purge failed yields to the rest of the queue for this long.
pub const PURGE_FAILURE_COOLDOWN_MS: i64 = 10 * 60 * 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgePhase {
    Responses,
    Scores,
    Configuration,
    Indices,
}

impl PurgePhase {
    pub const ALL: [PurgePhase; 4] = [
        PurgePhase::Responses,
        PurgePhase::Scores,
        PurgePhase::Configuration,
        PurgePhase::Indices,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PurgePhase::Responses => "responses",
            PurgePhase::Scores => "scores",
            PurgePhase::Configuration => "configuration",
            PurgePhase::Indices => "indices",
        }
    }
}

impl fmt::Display for PurgePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an interrupted purge resumes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeCheckpoint {
    pub survey_id: String,
    pub phase: PurgePhase,
}

impl fmt::Display for PurgeCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} phase of {}", self.phase, self.survey_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PurgeState {
    NotQueued,
    Queued,
    Purging(PurgePhase),
    Purged,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PurgeOutcome {
    /// Delete queue is empty.
    Idle,
    /// Another worker holds the lease of this survey.
    InFlight(String),
    Completed(String),
    Incomplete(PurgeCheckpoint),
}

/// Cooperative cancellation signal polled between purge batches and account
/// lookups.
pub trait ExecutionBudget: Send {
    fn exhausted(&mut self) -> bool;
}

pub struct WallClockBudget {
    started: Instant,
    limit: Duration,
}

impl WallClockBudget {
    pub fn new(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }
}

impl Default for WallClockBudget {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_PURGE_BUDGET_MS))
    }
}

impl ExecutionBudget for WallClockBudget {
    fn exhausted(&mut self) -> bool {
        self.started.elapsed() >= self.limit
    }
}

/// Value stored per survey in the delete queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMarker {
    pub owner: String,
    pub enqueued_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PurgePhase>,
    /// Set when the last attempt failed hard; cleared once a phase runs again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<i64>,
}

impl DeleteMarker {
    fn decode(raw: &str) -> DomainResult<Self> {
        serde_json::from_str(raw)
            .map_err(|err| DomainError::Validation(format!("delete marker is corrupt: {err}")))
    }

    fn encode(&self) -> DomainResult<String> {
        serde_json::to_string(self)
            .map_err(|err| DomainError::Validation(format!("failed to encode delete marker: {err}")))
    }
}

#[derive(Clone)]
pub struct PurgeWorkflow {
    surveys: SurveyRepository,
    batch_size: usize,
    budget_ms: u64,
}

impl PurgeWorkflow {
    pub fn new(surveys: SurveyRepository) -> Self {
        Self {
            surveys,
            batch_size: DEFAULT_PURGE_BATCH_SIZE,
            budget_ms: DEFAULT_PURGE_BUDGET_MS,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_budget_ms(mut self, budget_ms: u64) -> Self {
        self.budget_ms = budget_ms;
        self
    }

    fn ctx(&self) -> &StoreContext {
        self.surveys.context()
    }

    /// Marks a survey deleted and queues its purge. Idempotent; returns
    /// `false` when the survey does not exist.
    pub async fn enqueue(&self, survey_id: &str) -> DomainResult<bool> {
        validate_survey_id(survey_id)?;
        let queued = retry_on_conflict(&self.ctx().retry, "purge_enqueue", move || {
            self.try_enqueue(survey_id)
        })
        .await?;
        if queued {
            info!(survey_id, "survey queued for deletion");
        }
        Ok(queued)
    }

    async fn try_enqueue(&self, survey_id: &str) -> DomainResult<bool> {
        let ctx = self.ctx();
        let config_key = ctx.keys.survey_config(survey_id)?;
        let delete_queue = ctx.keys.delete_queue();

        let mut tx = ctx.kv.watch(&[config_key.clone()]).await?;
        let Some(raw) = tx.get(&config_key).await? else {
            tx.discard().await?;
            return Ok(false);
        };
        let mut config = SurveyConfig::decode(survey_id, &raw)?;
        let marker_exists = tx.hget(&delete_queue, survey_id).await?.is_some();
        if config.delete_queued && marker_exists {
            tx.discard().await?;
            return Ok(true);
        }
        config.delete_queued = true;

        let mut batch = KvBatch::new();
        batch.set(config_key, config.encode()?);
        if !marker_exists {
            let marker = DeleteMarker {
                owner: config.owner.clone(),
                enqueued_at: ctx.now_ms(),
                phase: None,
                failed_at: None,
            };
            batch.hset(delete_queue, survey_id, marker.encode()?);
        }
        batch.hdel(ctx.keys.publish_queue(), vec![survey_id.to_string()]);

        if !tx.exec(batch).await? {
            return Err(DomainError::TransactionConflict);
        }
        Ok(true)
    }

    /// Queues every survey in the owner's index. Returns how many were queued.
    pub async fn enqueue_owner(&self, owner_id: &str) -> DomainResult<usize> {
        let mut queued = 0;
        for survey_id in self.surveys.survey_ids_for_owner(owner_id).await? {
            if validate_survey_id(&survey_id).is_err() {
                warn!(owner_id, survey_id = %survey_id, "skipping malformed owner index entry");
                continue;
            }
            if self.enqueue(&survey_id).await? {
                queued += 1;
            }
        }
        info!(owner_id, queued, "owner surveys queued for deletion");
        Ok(queued)
    }

    /// Surveys that never existed also report `Purged`.
    pub async fn status(&self, survey_id: &str) -> DomainResult<PurgeState> {
        validate_survey_id(survey_id)?;
        let ctx = self.ctx();
        if let Some(raw) = ctx.kv.hget(&ctx.keys.delete_queue(), survey_id).await? {
            let marker = DeleteMarker::decode(&raw)?;
            return Ok(match marker.phase {
                None => PurgeState::Queued,
                Some(phase) => PurgeState::Purging(phase),
            });
        }
        if ctx.kv.exists(&ctx.keys.survey_config(survey_id)?).await? {
            Ok(PurgeState::NotQueued)
        } else {
            Ok(PurgeState::Purged)
        }
    }

    pub async fn execute_tick(&self) -> DomainResult<PurgeOutcome> {
        let mut budget = WallClockBudget::new(Duration::from_millis(self.budget_ms));
        self.execute_tick_with_budget(&mut budget).await
    }

    /// Advances the oldest queued purge until it completes or `budget` runs
    /// out.
    pub async fn execute_tick_with_budget(
        &self,
        budget: &mut dyn ExecutionBudget,
    ) -> DomainResult<PurgeOutcome> {
        let Some((survey_id, marker)) = self.oldest_marker().await? else {
            return Ok(PurgeOutcome::Idle);
        };
        if !self.acquire_lease(&survey_id).await? {
            debug!(survey_id = %survey_id, "purge lease held elsewhere");
            return Ok(PurgeOutcome::InFlight(survey_id));
        }

        let result = self.run_phases(&survey_id, marker, budget).await;
        if let Err(err) = self.release_lease(&survey_id).await {
            warn!(survey_id = %survey_id, error = %err, "failed to release purge lease");
        }

        match result {
            Ok(()) => {
                info!(survey_id = %survey_id, "survey purged");
                Ok(PurgeOutcome::Completed(survey_id))
            }
            Err(DomainError::ExecutionBudget(checkpoint)) => {
                info!(checkpoint = %checkpoint, "purge budget exhausted, will resume");
                Ok(PurgeOutcome::Incomplete(checkpoint))
            }
            Err(err) => {
                error!(survey_id = %survey_id, error = %err, "purge failed");
                if let Err(mark_err) = self.record_failure(&survey_id).await {
                    warn!(survey_id = %survey_id, error = %mark_err, "failed to record purge failure");
                }
                Err(err)
            }
        }
    }

    async fn oldest_marker(&self) -> DomainResult<Option<(String, DeleteMarker)>> {
        let ctx = self.ctx();
        let delete_queue = ctx.keys.delete_queue();
        let mut markers = Vec::new();
        let mut malformed = Vec::new();
        for (survey_id, raw) in ctx.kv.hgetall(&delete_queue).await? {
            if validate_survey_id(&survey_id).is_err() {
                malformed.push(survey_id);
                continue;
            }
            match DeleteMarker::decode(&raw) {
                Ok(marker) if validate_user_id(&marker.owner).is_ok() => {
                    markers.push((survey_id, marker))
                }
                _ => malformed.push(survey_id),
            }
        }
        if !malformed.is_empty() {
            warn!(entries = ?malformed, "dropping malformed delete queue entries");
            ctx.kv.hdel(&delete_queue, &malformed).await?;
        }
        // Recently failed surveys go last so they cannot block the queue.
        let now = ctx.now_ms();
        let cooling = |marker: &DeleteMarker| {
            marker
                .failed_at
                .is_some_and(|at| now.saturating_sub(at) < PURGE_FAILURE_COOLDOWN_MS)
        };
        Ok(markers.into_iter().min_by(|a, b| {
            cooling(&a.1)
                .cmp(&cooling(&b.1))
                .then_with(|| a.1.enqueued_at.cmp(&b.1.enqueued_at))
                .then_with(|| a.0.cmp(&b.0))
        }))
    }

    async fn record_failure(&self, survey_id: &str) -> DomainResult<()> {
        let ctx = self.ctx();
        let Some(raw) = ctx.kv.hget(&ctx.keys.delete_queue(), survey_id).await? else {
            return Ok(());
        };
        let mut marker = DeleteMarker::decode(&raw)?;
        marker.failed_at = Some(ctx.now_ms());
        self.record_phase(survey_id, &marker).await
    }

    async fn acquire_lease(&self, survey_id: &str) -> DomainResult<bool> {
        let ctx = self.ctx();
        let lease_key = ctx.keys.purge_lease(survey_id)?;
        let now = ctx.now_ms();

        let mut tx = ctx.kv.watch(&[lease_key.clone()]).await?;
        let held_until = tx
            .get(&lease_key)
            .await?
            .and_then(|raw| raw.parse::<i64>().ok());
        if held_until.is_some_and(|expiry| expiry > now) {
            tx.discard().await?;
            return Ok(false);
        }
        let expiry = now + 2 * self.budget_ms as i64;
        let mut batch = KvBatch::new();
        batch.set(lease_key, expiry.to_string());
        // Losing the race means another worker took the lease.
        Ok(tx.exec(batch).await?)
    }

    async fn release_lease(&self, survey_id: &str) -> DomainResult<()> {
        let ctx = self.ctx();
        ctx.kv.del(&[ctx.keys.purge_lease(survey_id)?]).await?;
        Ok(())
    }

    async fn run_phases(
        &self,
        survey_id: &str,
        mut marker: DeleteMarker,
        budget: &mut dyn ExecutionBudget,
    ) -> DomainResult<()> {
        let resume_from = marker.phase.unwrap_or(PurgePhase::Responses);
        for phase in PurgePhase::ALL.into_iter().filter(|phase| *phase >= resume_from) {
            if marker.phase != Some(phase) || marker.failed_at.is_some() {
                marker.phase = Some(phase);
                marker.failed_at = None;
                self.record_phase(survey_id, &marker).await?;
            }
            debug!(survey_id, phase = %phase, "purge phase started");
            match phase {
                PurgePhase::Responses => self.purge_responses(survey_id, budget).await?,
                PurgePhase::Scores => self.purge_scores(survey_id).await?,
                PurgePhase::Configuration => {
                    self.surveys.delete_survey_keys(survey_id).await?;
                }
                PurgePhase::Indices => self.purge_indices(survey_id, &marker.owner).await?,
            }
        }
        Ok(())
    }

    async fn record_phase(&self, survey_id: &str, marker: &DeleteMarker) -> DomainResult<()> {
        let ctx = self.ctx();
        ctx.kv
            .hset(
                &ctx.keys.delete_queue(),
                &[(survey_id.to_string(), marker.encode()?)],
            )
            .await?;
        Ok(())
    }

    async fn purge_responses(
        &self,
        survey_id: &str,
        budget: &mut dyn ExecutionBudget,
    ) -> DomainResult<()> {
        let ctx = self.ctx();
        let roster_key = ctx.keys.responder_roster(survey_id)?;
        let mut cursor = 0;
        loop {
            let page = ctx
                .kv
                .hscan(&roster_key, cursor, None, self.batch_size)
                .await?;
            if page.entries.is_empty() {
                if page.cursor == 0 {
                    return Ok(());
                }
                cursor = page.cursor;
                continue;
            }

            let users: Vec<String> = page.entries.into_iter().map(|(user, _)| user).collect();
            let mut answer_keys = Vec::with_capacity(users.len());
            for user_id in &users {
                match ctx.keys.user_answer(user_id, survey_id) {
                    Ok(key) => answer_keys.push(key),
                    Err(_) => warn!(survey_id, user_id = %user_id, "skipping malformed roster entry"),
                }
            }
            ctx.kv.del(&answer_keys).await?;
            ctx.kv.hdel(&roster_key, &users).await?;
            debug!(survey_id, removed = users.len(), "purged response batch");

            // Removed fields invalidate the cursor, so every batch rescans.
            cursor = 0;
            if budget.exhausted() {
                return Err(DomainError::ExecutionBudget(PurgeCheckpoint {
                    survey_id: survey_id.to_string(),
                    phase: PurgePhase::Responses,
                }));
            }
        }
    }

    async fn purge_scores(&self, survey_id: &str) -> DomainResult<()> {
        let ctx = self.ctx();
        let Some(raw) = ctx.kv.get(&ctx.keys.survey_questions(survey_id)?).await? else {
            return Ok(());
        };
        let tally_keys = decode_questions(survey_id, &raw)?
            .iter()
            .map(|question| ctx.keys.question_tally(survey_id, &question.id))
            .collect::<DomainResult<Vec<_>>>()?;
        if !tally_keys.is_empty() {
            ctx.kv.del(&tally_keys).await?;
        }
        Ok(())
    }

    async fn purge_indices(&self, survey_id: &str, owner_id: &str) -> DomainResult<()> {
        let ctx = self.ctx();
        let fields = [survey_id.to_string()];
        self.surveys
            .remove_from_owner_index(owner_id, survey_id)
            .await?;
        ctx.kv.hdel(&ctx.keys.publish_queue(), &fields).await?;
        ctx.kv.hdel(&ctx.keys.delete_queue(), &fields).await?;
        Ok(())
    }
}
