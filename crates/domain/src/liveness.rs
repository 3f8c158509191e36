use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::DomainResult;
use crate::context::StoreContext;
use crate::keys::validate_user_id;
use crate::ports::accounts::AccountDirectory;
use crate::ports::kv::KvError;
use crate::purge::{ExecutionBudget, PurgeWorkflow};
use crate::responses::ResponseRepository;
use crate::surveys::SurveyRepository;

pub const RECHECK_AFTER_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub owners_retired: usize,
    pub responses_removed: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Purges are pending; sweeping now would race them.
    Deferred,
    Incomplete(SweepReport),
    Completed(SweepReport),
}

#[derive(Debug, Serialize, Deserialize)]
struct LivenessRecord {
    checked_at: i64,
    exists: bool,
}

struct AccountCheck {
    exists: bool,
    /// The directory was asked, rather than a recent record reused.
    looked_up: bool,
}

/// Retires data of accounts the host platform no longer knows.
#[derive(Clone)]
pub struct LivenessSweep {
    surveys: SurveyRepository,
    responses: ResponseRepository,
    purge: PurgeWorkflow,
    directory: Arc<dyn AccountDirectory>,
}

impl LivenessSweep {
    pub fn new(
        surveys: SurveyRepository,
        responses: ResponseRepository,
        purge: PurgeWorkflow,
        directory: Arc<dyn AccountDirectory>,
    ) -> Self {
        Self {
            surveys,
            responses,
            purge,
            directory,
        }
    }

    fn ctx(&self) -> &StoreContext {
        self.surveys.context()
    }

    pub async fn run(&self, budget: &mut dyn ExecutionBudget) -> DomainResult<SweepOutcome> {
        let ctx = self.ctx();
        if ctx.kv.hlen(&ctx.keys.delete_queue()).await? > 0 {
            debug!("delete queue not empty, deferring liveness sweep");
            return Ok(SweepOutcome::Deferred);
        }

        let registry_key = ctx.keys.owner_registry();
        let mut owners = ctx.kv.hkeys(&registry_key).await?;
        owners.sort();

        let mut report = SweepReport::default();
        for owner_id in owners {
            if validate_user_id(&owner_id).is_err() {
                warn!(owner_id = %owner_id, "dropping malformed owner registry entry");
                ctx.kv.hdel(&registry_key, &[owner_id]).await?;
                continue;
            }
            let check = self.check_account(&owner_id).await?;
            if !check.exists {
                self.purge.enqueue_owner(&owner_id).await?;
                ctx.kv.hdel(&registry_key, &[owner_id.clone()]).await?;
                report.owners_retired += 1;
                info!(owner_id = %owner_id, "owner account gone, surveys queued for deletion");
            }
            if check.looked_up && budget.exhausted() {
                return Ok(SweepOutcome::Incomplete(report));
            }
            if !check.exists {
                continue;
            }

            for survey_id in self.surveys.survey_ids_for_owner(&owner_id).await? {
                let Ok(roster_key) = ctx.keys.responder_roster(&survey_id) else {
                    continue;
                };
                let mut responders = ctx.kv.hkeys(&roster_key).await?;
                responders.sort();
                for user_id in responders {
                    if validate_user_id(&user_id).is_err() {
                        continue;
                    }
                    let check = self.check_account(&user_id).await?;
                    if !check.exists
                        && self
                            .responses
                            .delete_user_response(&user_id, &survey_id)
                            .await?
                    {
                        report.responses_removed += 1;
                    }
                    if check.looked_up && budget.exhausted() {
                        return Ok(SweepOutcome::Incomplete(report));
                    }
                }
            }
        }

        info!(
            owners_retired = report.owners_retired,
            responses_removed = report.responses_removed,
            "liveness sweep completed"
        );
        Ok(SweepOutcome::Completed(report))
    }

    async fn check_account(&self, user_id: &str) -> DomainResult<AccountCheck> {
        let ctx = self.ctx();
        let checks_key = ctx.keys.liveness_checks();
        let now = ctx.now_ms();

        let recent = ctx
            .kv
            .hget(&checks_key, user_id)
            .await?
            .and_then(|raw| serde_json::from_str::<LivenessRecord>(&raw).ok())
            .filter(|record| now - record.checked_at < RECHECK_AFTER_MS);
        if let Some(record) = recent {
            return Ok(AccountCheck {
                exists: record.exists,
                looked_up: false,
            });
        }

        let exists = self.directory.account_exists(user_id).await?;
        let record = serde_json::to_string(&LivenessRecord {
            checked_at: now,
            exists,
        })
        .map_err(|err| KvError::Serialization(err.to_string()))?;
        ctx.kv
            .hset(&checks_key, &[(user_id.to_string(), record)])
            .await?;
        Ok(AccountCheck {
            exists,
            looked_up: true,
        })
    }
}
