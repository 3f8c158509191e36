#![allow(dead_code)]

use std::sync::Arc;

use quorum_domain::context::StoreContext;
use quorum_domain::host::InMemoryPostPublisher;
use quorum_domain::jobs::ManualClock;
use quorum_domain::keys::KeySchema;
use quorum_domain::memory::InMemoryKvStore;
use quorum_domain::ports::kv::KeyValueStore;
use quorum_domain::responses::ResponseRepository;
use quorum_domain::surveys::SurveyRepository;
use serde_json::{Value, json};

pub const NOW: i64 = 1_700_000_000_000;
pub const OWNER: &str = "t2_owner";
pub const SURVEY: &str = "sv_lunchpoll1";
pub const Q_MULTI: &str = "qn_multi00001";
pub const Q_RANK: &str = "qn_rank000001";
pub const Q_SCALE: &str = "qn_scale00001";
pub const Q_TEXT: &str = "qn_text000001";
pub const SOUP: &str = "op_soup000001";
pub const SALAD: &str = "op_salad00001";
pub const STEW: &str = "op_stew000001";

pub struct Harness {
    pub kv: InMemoryKvStore,
    pub clock: ManualClock,
    pub publisher: InMemoryPostPublisher,
    pub ctx: StoreContext,
    pub surveys: SurveyRepository,
    pub responses: ResponseRepository,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(InMemoryKvStore::new(), None)
    }

    /// `kv` backs the repositories through `store` when given, so tests can
    /// wrap the memory store.
    pub fn with_store(kv: InMemoryKvStore, store: Option<Arc<dyn KeyValueStore>>) -> Self {
        let clock = ManualClock::new(NOW);
        let publisher = InMemoryPostPublisher::new();
        let store = store.unwrap_or_else(|| Arc::new(kv.clone()));
        let ctx = StoreContext::new(store)
            .with_keys(KeySchema::new("test"))
            .with_clock(Arc::new(clock.clone()));
        let surveys = SurveyRepository::new(ctx.clone(), Arc::new(publisher.clone()));
        let responses = ResponseRepository::new(ctx.clone());
        Self {
            kv,
            clock,
            publisher,
            ctx,
            surveys,
            responses,
        }
    }

    pub async fn create_survey(&self, survey_id: &str, publish_date: Option<i64>) {
        self.surveys
            .upsert(OWNER, survey_id, &survey_payload(publish_date))
            .await
            .expect("survey upsert");
    }

    /// Creates [`SURVEY`] and publishes it right away.
    pub async fn live_survey(&self) {
        self.create_survey(SURVEY, Some(NOW)).await;
    }
}

pub fn survey_payload(publish_date: Option<i64>) -> Value {
    json!({
        "title": "Lunch poll",
        "intro": "Tell us what to cook",
        "publishDate": publish_date,
        "questions": [
            {
                "id": Q_MULTI,
                "title": "Favourite dish",
                "required": true,
                "type": "multiOption",
                "variant": "multi",
                "options": [
                    {"label": "Soup", "value": SOUP},
                    {"label": "Salad", "value": SALAD},
                    {"label": "Stew", "value": STEW}
                ]
            },
            {
                "id": Q_RANK,
                "title": "Rank the dishes",
                "type": "multiOption",
                "variant": "rank",
                "options": [
                    {"label": "Soup", "value": SOUP},
                    {"label": "Salad", "value": SALAD},
                    {"label": "Stew", "value": STEW}
                ]
            },
            {
                "id": Q_SCALE,
                "title": "How hungry",
                "type": "scale",
                "kind": "numeric",
                "min": 1,
                "max": 5
            },
            {
                "id": Q_TEXT,
                "title": "Anything else",
                "type": "text",
                "min": 0,
                "max": 280
            }
        ]
    })
}

pub fn user(index: usize) -> String {
    format!("t2_user{index}")
}
