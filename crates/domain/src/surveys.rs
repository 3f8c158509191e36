use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::DomainResult;
use crate::context::StoreContext;
use crate::error::DomainError;
use crate::keys::{validate_survey_id, validate_user_id};
use crate::ports::kv::KvBatch;
use crate::ports::posts::PostPublisher;
use crate::retry::retry_on_conflict;
use crate::survey::{
    Question, SurveyConfig, SurveyDraft, SurveyWithQuestions, decode_questions, encode_questions,
};

/// A publish date at most this far from "now" is published immediately
/// instead of going through the publish queue.
pub const PUBLISH_NOW_WINDOW_MS: i64 = 60_000;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub is_new: bool,
    /// Set when the survey went live as part of this upsert.
    pub post_id: Option<String>,
}

struct Committed {
    is_new: bool,
    config: SurveyConfig,
    publish_now: bool,
}

#[derive(Clone)]
pub struct SurveyRepository {
    ctx: StoreContext,
    publisher: Arc<dyn PostPublisher>,
}

impl SurveyRepository {
    pub fn new(ctx: StoreContext, publisher: Arc<dyn PostPublisher>) -> Self {
        Self { ctx, publisher }
    }

    pub fn context(&self) -> &StoreContext {
        &self.ctx
    }

    pub async fn get_config(&self, survey_id: &str) -> DomainResult<Option<SurveyConfig>> {
        let key = self.ctx.keys.survey_config(survey_id)?;
        let Some(raw) = self.ctx.kv.get(&key).await? else {
            return Ok(None);
        };
        let mut config = SurveyConfig::decode(survey_id, &raw)?;
        let roster_key = self.ctx.keys.responder_roster(survey_id)?;
        config.response_count = self.ctx.kv.hlen(&roster_key).await?;
        Ok(Some(config))
    }

    pub async fn get_config_with_questions(
        &self,
        survey_id: &str,
    ) -> DomainResult<Option<SurveyWithQuestions>> {
        let Some(config) = self.get_config(survey_id).await? else {
            return Ok(None);
        };
        let questions = self.get_questions(survey_id).await?.unwrap_or_default();
        Ok(Some(SurveyWithQuestions { config, questions }))
    }

    /// Id of the post the survey went live with, if it has been published.
    pub async fn get_post_id(&self, survey_id: &str) -> DomainResult<Option<String>> {
        let key = self.ctx.keys.survey_post(survey_id)?;
        Ok(self.ctx.kv.get(&key).await?)
    }

    pub async fn get_questions(&self, survey_id: &str) -> DomainResult<Option<Vec<Question>>> {
        let key = self.ctx.keys.survey_questions(survey_id)?;
        match self.ctx.kv.get(&key).await? {
            Some(raw) => Ok(Some(decode_questions(survey_id, &raw)?)),
            None => Ok(None),
        }
    }

    /// Newest first. Index entries whose config is gone are skipped, not
    /// repaired.
    pub async fn list_for_owner(&self, owner_id: &str) -> DomainResult<Vec<SurveyConfig>> {
        let index_key = self.ctx.keys.owner_index(owner_id)?;
        let mut entries: Vec<(String, i64)> = self
            .ctx
            .kv
            .hgetall(&index_key)
            .await?
            .into_iter()
            .map(|(survey_id, created)| (survey_id, created.parse().unwrap_or(0)))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut surveys = Vec::with_capacity(entries.len());
        for (survey_id, _) in entries {
            if validate_survey_id(&survey_id).is_err() {
                warn!(owner_id, survey_id = %survey_id, "skipping malformed owner index entry");
                continue;
            }
            match self.get_config(&survey_id).await? {
                Some(config) => surveys.push(config),
                None => debug!(owner_id, survey_id = %survey_id, "skipping stale owner index entry"),
            }
        }
        Ok(surveys)
    }

    /// Creates or replaces a survey. A publish date within
    /// [`PUBLISH_NOW_WINDOW_MS`] creates the live post before returning; a
    /// later one queues the survey for the publish tick.
    pub async fn upsert(
        &self,
        owner_id: &str,
        survey_id: &str,
        raw_payload: &serde_json::Value,
    ) -> DomainResult<UpsertOutcome> {
        validate_user_id(owner_id)?;
        validate_survey_id(survey_id)?;
        let draft = SurveyDraft::parse(raw_payload)?;
        let now = self.ctx.now_ms();

        let draft = &draft;
        let committed = retry_on_conflict(&self.ctx.retry, "survey_upsert", move || {
            self.try_upsert(owner_id, survey_id, draft, now)
        })
        .await?;

        info!(
            survey_id,
            owner_id,
            is_new = committed.is_new,
            publish_date = committed.config.publish_date,
            "survey saved"
        );

        if !committed.publish_now {
            return Ok(UpsertOutcome {
                is_new: committed.is_new,
                post_id: None,
            });
        }

        match self.publisher.create_survey_post(&committed.config).await {
            Ok(post_id) => {
                let post_key = self.ctx.keys.survey_post(survey_id)?;
                self.ctx.kv.set(&post_key, &post_id).await?;
                info!(survey_id, post_id = %post_id, "survey published immediately");
                Ok(UpsertOutcome {
                    is_new: committed.is_new,
                    post_id: Some(post_id),
                })
            }
            Err(err) => {
                // Hand the survey to the publish tick so it is not lost.
                warn!(survey_id, error = %err, "immediate publish failed, queueing survey");
                let due = committed.config.publish_date.unwrap_or(now);
                self.ctx
                    .kv
                    .hset(
                        &self.ctx.keys.publish_queue(),
                        &[(survey_id.to_string(), due.to_string())],
                    )
                    .await?;
                Err(err.into())
            }
        }
    }

    async fn try_upsert(
        &self,
        owner_id: &str,
        survey_id: &str,
        draft: &SurveyDraft,
        now: i64,
    ) -> DomainResult<Committed> {
        let keys = &self.ctx.keys;
        let config_key = keys.survey_config(survey_id)?;
        let questions_key = keys.survey_questions(survey_id)?;
        let index_key = keys.owner_index(owner_id)?;
        let queue_key = keys.publish_queue();
        let delete_queue = keys.delete_queue();
        let post_key = keys.survey_post(survey_id)?;

        let mut tx = self
            .ctx
            .kv
            .watch(&[
                index_key.clone(),
                config_key.clone(),
                questions_key.clone(),
                queue_key.clone(),
                delete_queue.clone(),
                post_key.clone(),
            ])
            .await?;

        // The marker outlives the config while a purge is in progress.
        if tx.hget(&delete_queue, survey_id).await?.is_some() {
            tx.discard().await?;
            return Err(DomainError::Validation(format!(
                "survey {survey_id} is queued for deletion"
            )));
        }

        let is_new = tx.hget(&index_key, survey_id).await?.is_none();
        let existing = match tx.get(&config_key).await? {
            Some(raw) => Some(SurveyConfig::decode(survey_id, &raw)?),
            None => None,
        };
        if let Some(existing) = &existing {
            if existing.owner != owner_id {
                return Err(DomainError::Validation(format!(
                    "survey {survey_id} belongs to another owner"
                )));
            }
            if existing.delete_queued {
                return Err(DomainError::Validation(format!(
                    "survey {survey_id} is queued for deletion"
                )));
            }
        }
        let queued = tx.hget(&queue_key, survey_id).await?.is_some();

        let create_date = existing
            .as_ref()
            .map(|config| config.create_date)
            .unwrap_or(now);
        let (mut config, questions) =
            draft
                .clone()
                .into_config(survey_id, owner_id, create_date)?;

        // A survey with a recorded post keeps its original publish date.
        let already_published = tx.get(&post_key).await?.is_some();
        if already_published {
            if let Some(previous) = &existing {
                config.publish_date = previous.publish_date;
            }
            if queued {
                warn!(survey_id, "published survey still queued, dropping entry");
            }
        }

        let mut batch = KvBatch::new();
        batch.set(config_key, config.encode()?);

        if let Some(questions) = &questions {
            let previous = match tx.get(&questions_key).await? {
                Some(raw) => decode_questions(survey_id, &raw)?,
                None => Vec::new(),
            };
            let kept: HashSet<&str> = questions.iter().map(|q| q.id.as_str()).collect();
            let dropped_tallies = previous
                .iter()
                .filter(|question| !kept.contains(question.id.as_str()))
                .map(|question| keys.question_tally(survey_id, &question.id))
                .collect::<DomainResult<Vec<_>>>()?;
            batch.set(questions_key, encode_questions(questions)?);
            batch.del(dropped_tallies);
        }

        if is_new {
            batch.hset(index_key, survey_id, create_date.to_string());
            batch.hset(keys.owner_registry(), owner_id, now.to_string());
        }

        let mut publish_now = false;
        if already_published {
            batch.hdel(queue_key, vec![survey_id.to_string()]);
        } else {
            match config.publish_date {
                None => {
                    batch.hdel(queue_key, vec![survey_id.to_string()]);
                }
                Some(date) if date.saturating_sub(now) <= PUBLISH_NOW_WINDOW_MS => {
                    publish_now = true;
                    batch.hdel(queue_key, vec![survey_id.to_string()]);
                }
                Some(date) => {
                    batch.hset(queue_key, survey_id, date.to_string());
                }
            }
        }

        if !tx.exec(batch).await? {
            return Err(DomainError::TransactionConflict);
        }
        Ok(Committed {
            is_new,
            config,
            publish_now,
        })
    }

    /// Sets `closeDate = now`. A survey that was still waiting in the publish
    /// queue loses its publish date and queue entry. Returns `false` if the
    /// survey does not exist.
    pub async fn close(&self, survey_id: &str) -> DomainResult<bool> {
        validate_survey_id(survey_id)?;
        let closed = retry_on_conflict(&self.ctx.retry, "survey_close", move || {
            self.try_close(survey_id)
        })
        .await?;
        if closed {
            info!(survey_id, "survey closed");
        }
        Ok(closed)
    }

    async fn try_close(&self, survey_id: &str) -> DomainResult<bool> {
        let config_key = self.ctx.keys.survey_config(survey_id)?;
        let queue_key = self.ctx.keys.publish_queue();
        let now = self.ctx.now_ms();

        let mut tx = self
            .ctx
            .kv
            .watch(&[config_key.clone(), queue_key.clone()])
            .await?;
        let Some(raw) = tx.get(&config_key).await? else {
            tx.discard().await?;
            return Ok(false);
        };
        let mut config = SurveyConfig::decode(survey_id, &raw)?;
        config.close_date = Some(now);

        let mut batch = KvBatch::new();
        if tx.hget(&queue_key, survey_id).await?.is_some() {
            config.publish_date = None;
            batch.hdel(queue_key, vec![survey_id.to_string()]);
        }
        batch.set(config_key, config.encode()?);

        if !tx.exec(batch).await? {
            return Err(DomainError::TransactionConflict);
        }
        Ok(true)
    }

    /// Deletes the question list, post record and configuration keys.
    /// Idempotent.
    pub async fn delete_survey_keys(&self, survey_id: &str) -> DomainResult<u64> {
        let keys = vec![
            self.ctx.keys.survey_questions(survey_id)?,
            self.ctx.keys.survey_post(survey_id)?,
            self.ctx.keys.survey_config(survey_id)?,
        ];
        Ok(self.ctx.kv.del(&keys).await?)
    }

    pub async fn remove_from_owner_index(
        &self,
        owner_id: &str,
        survey_id: &str,
    ) -> DomainResult<bool> {
        validate_survey_id(survey_id)?;
        let index_key = self.ctx.keys.owner_index(owner_id)?;
        let removed = self
            .ctx
            .kv
            .hdel(&index_key, &[survey_id.to_string()])
            .await?;
        Ok(removed > 0)
    }

    pub async fn survey_ids_for_owner(&self, owner_id: &str) -> DomainResult<Vec<String>> {
        let index_key = self.ctx.keys.owner_index(owner_id)?;
        let mut ids = self.ctx.kv.hkeys(&index_key).await?;
        ids.sort();
        Ok(ids)
    }
}
