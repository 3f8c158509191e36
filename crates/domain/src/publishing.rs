use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::DomainResult;
use crate::context::StoreContext;
use crate::error::DomainError;
use crate::keys::validate_survey_id;
use crate::ports::kv::KvBatch;
use crate::ports::posts::PostPublisher;
use crate::survey::SurveyConfig;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishTickReport {
    /// `(survey_id, post_id)` in publish order.
    pub published: Vec<(String, String)>,
    pub skipped: usize,
    pub failed: usize,
}

enum EntryOutcome {
    Published(String),
    Dropped(&'static str),
    NotYetDue,
}

/// Turns due publish-queue entries into live posts.
#[derive(Clone)]
pub struct PublishScheduler {
    ctx: StoreContext,
    publisher: Arc<dyn PostPublisher>,
}

impl PublishScheduler {
    pub fn new(ctx: StoreContext, publisher: Arc<dyn PostPublisher>) -> Self {
        Self { ctx, publisher }
    }

    pub async fn queue_depth(&self) -> DomainResult<u64> {
        Ok(self.ctx.kv.hlen(&self.ctx.keys.publish_queue()).await?)
    }

    /// Publishes every entry due at `now_ms`, oldest first. A failing entry
    /// stays queued and does not stop the rest of the tick.
    pub async fn run_tick(&self, now_ms: i64) -> DomainResult<PublishTickReport> {
        let queue_key = self.ctx.keys.publish_queue();
        let mut due: Vec<(String, i64)> = Vec::new();
        let mut malformed = Vec::new();
        for (survey_id, raw_due) in self.ctx.kv.hgetall(&queue_key).await? {
            match raw_due.parse::<i64>() {
                Ok(due_ms) if validate_survey_id(&survey_id).is_ok() => {
                    if due_ms <= now_ms {
                        due.push((survey_id, due_ms));
                    }
                }
                _ => malformed.push(survey_id),
            }
        }
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let mut report = PublishTickReport {
            skipped: malformed.len(),
            ..PublishTickReport::default()
        };
        if !malformed.is_empty() {
            warn!(entries = ?malformed, "dropping malformed publish queue entries");
            self.ctx.kv.hdel(&queue_key, &malformed).await?;
        }

        for (survey_id, _) in due {
            match self.publish_entry(&survey_id, now_ms).await {
                Ok(EntryOutcome::Published(post_id)) => {
                    info!(survey_id = %survey_id, post_id = %post_id, "scheduled survey published");
                    report.published.push((survey_id, post_id));
                }
                Ok(EntryOutcome::Dropped(reason)) => {
                    debug!(survey_id = %survey_id, reason, "publish queue entry dropped");
                    report.skipped += 1;
                }
                Ok(EntryOutcome::NotYetDue) => {
                    debug!(survey_id = %survey_id, "publish date moved later, keeping entry");
                    report.skipped += 1;
                }
                Err(err) => {
                    warn!(survey_id = %survey_id, error = %err, "scheduled publish failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn publish_entry(&self, survey_id: &str, now_ms: i64) -> DomainResult<EntryOutcome> {
        let queue_key = self.ctx.keys.publish_queue();
        let fields = [survey_id.to_string()];

        let config = match self.ctx.kv.get(&self.ctx.keys.survey_config(survey_id)?).await? {
            Some(raw) => Some(SurveyConfig::decode(survey_id, &raw)?),
            None => None,
        };
        let drop_reason = match &config {
            None => Some("survey missing"),
            Some(config) if config.delete_queued => Some("survey queued for deletion"),
            Some(config) if config.is_closed(now_ms) => Some("survey closed"),
            Some(config) if config.publish_date.is_none() => Some("publish date cleared"),
            Some(_) => None,
        };
        let (Some(config), None) = (config, drop_reason) else {
            self.ctx.kv.hdel(&queue_key, &fields).await?;
            return Ok(EntryOutcome::Dropped(drop_reason.unwrap_or("survey missing")));
        };
        if !config.is_published(now_ms) {
            return Ok(EntryOutcome::NotYetDue);
        }
        let post_key = self.ctx.keys.survey_post(survey_id)?;
        if self.ctx.kv.exists(&post_key).await? {
            self.ctx.kv.hdel(&queue_key, &fields).await?;
            return Ok(EntryOutcome::Dropped("already published"));
        }

        let post_id = self.publisher.create_survey_post(&config).await?;
        self.record_post(survey_id, &post_id).await?;
        Ok(EntryOutcome::Published(post_id))
    }

    /// Stores the post id and removes the queue entry in one commit.
    async fn record_post(&self, survey_id: &str, post_id: &str) -> DomainResult<()> {
        let post_key = self.ctx.keys.survey_post(survey_id)?;
        let tx = self.ctx.kv.watch(&[post_key.clone()]).await?;
        let mut batch = KvBatch::new();
        batch
            .set(post_key, post_id)
            .hdel(self.ctx.keys.publish_queue(), vec![survey_id.to_string()]);
        if !tx.exec(batch).await? {
            return Err(DomainError::TransactionConflict);
        }
        Ok(())
    }
}
