mod common;

use common::*;
use quorum_domain::error::DomainError;
use quorum_domain::ports::kv::KeyValueStore;
use quorum_domain::publishing::PublishScheduler;
use quorum_domain::surveys::PUBLISH_NOW_WINDOW_MS;
use std::sync::Arc;

#[tokio::test]
async fn new_survey_lands_in_owner_index_and_registry() {
    let h = Harness::new();
    let outcome = h
        .surveys
        .upsert(OWNER, SURVEY, &survey_payload(None))
        .await
        .unwrap();
    assert!(outcome.is_new);
    assert_eq!(outcome.post_id, None);

    let keys = &h.ctx.keys;
    let indexed = h
        .kv
        .hget(&keys.owner_index(OWNER).unwrap(), SURVEY)
        .await
        .unwrap();
    assert_eq!(indexed, Some(NOW.to_string()));
    assert!(
        h.kv
            .hget(&keys.owner_registry(), OWNER)
            .await
            .unwrap()
            .is_some()
    );

    let listed = h.surveys.list_for_owner(OWNER).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, SURVEY);
    assert_eq!(listed[0].title, "Lunch poll");

    let full = h
        .surveys
        .get_config_with_questions(SURVEY)
        .await
        .unwrap()
        .expect("survey exists");
    assert_eq!(full.questions.len(), 4);
}

#[tokio::test]
async fn update_keeps_create_date_and_reports_not_new() {
    let h = Harness::new();
    h.create_survey(SURVEY, None).await;
    h.clock.advance(5_000);

    let mut payload = survey_payload(None);
    payload["title"] = "Dinner poll".into();
    let outcome = h.surveys.upsert(OWNER, SURVEY, &payload).await.unwrap();
    assert!(!outcome.is_new);

    let config = h.surveys.get_config(SURVEY).await.unwrap().unwrap();
    assert_eq!(config.title, "Dinner poll");
    assert_eq!(config.create_date, NOW);
}

#[tokio::test]
async fn publish_date_inside_window_publishes_immediately() {
    let h = Harness::new();
    let outcome = h
        .surveys
        .upsert(OWNER, SURVEY, &survey_payload(Some(NOW + PUBLISH_NOW_WINDOW_MS - 1)))
        .await
        .unwrap();

    assert!(outcome.post_id.is_some());
    assert_eq!(h.publisher.post_count(SURVEY), 1);
    assert_eq!(h.surveys.get_post_id(SURVEY).await.unwrap(), outcome.post_id);
    let queued = h
        .kv
        .hget(&h.ctx.keys.publish_queue(), SURVEY)
        .await
        .unwrap();
    assert_eq!(queued, None);
}

#[tokio::test]
async fn publish_date_exactly_at_window_edge_publishes_immediately() {
    let h = Harness::new();
    let outcome = h
        .surveys
        .upsert(OWNER, SURVEY, &survey_payload(Some(NOW + PUBLISH_NOW_WINDOW_MS)))
        .await
        .unwrap();

    assert!(outcome.post_id.is_some());
    assert_eq!(h.publisher.post_count(SURVEY), 1);
    assert_eq!(
        h.kv.hlen(&h.ctx.keys.publish_queue()).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn out_of_range_publish_date_is_rejected() {
    let h = Harness::new();
    for date in [i64::MIN, -1, i64::MAX] {
        let err = h
            .surveys
            .upsert(OWNER, SURVEY, &survey_payload(Some(date)))
            .await
            .expect_err("date out of range");
        assert!(matches!(err, DomainError::Validation(_)));
    }
    assert_eq!(h.kv.key_count(), 0);
}

#[tokio::test]
async fn publish_date_past_window_is_queued() {
    let h = Harness::new();
    let due = NOW + PUBLISH_NOW_WINDOW_MS + 1;
    let outcome = h
        .surveys
        .upsert(OWNER, SURVEY, &survey_payload(Some(due)))
        .await
        .unwrap();

    assert_eq!(outcome.post_id, None);
    assert_eq!(h.publisher.post_count(SURVEY), 0);
    let queued = h
        .kv
        .hget(&h.ctx.keys.publish_queue(), SURVEY)
        .await
        .unwrap();
    assert_eq!(queued, Some(due.to_string()));

    let scheduler = PublishScheduler::new(h.ctx.clone(), Arc::new(h.publisher.clone()));
    let early = scheduler.run_tick(NOW).await.unwrap();
    assert!(early.published.is_empty());

    h.clock.set(due);
    let report = scheduler.run_tick(due).await.unwrap();
    assert_eq!(report.published.len(), 1);
    assert_eq!(report.published[0].0, SURVEY);
    assert_eq!(scheduler.queue_depth().await.unwrap(), 0);
    assert_eq!(
        h.surveys.get_post_id(SURVEY).await.unwrap().as_deref(),
        Some(report.published[0].1.as_str())
    );

    // A later save with a fresh date keeps the recorded post.
    let outcome = h
        .surveys
        .upsert(OWNER, SURVEY, &survey_payload(Some(due + 1_000)))
        .await
        .unwrap();
    assert_eq!(outcome.post_id, None);
    let config = h.surveys.get_config(SURVEY).await.unwrap().unwrap();
    assert_eq!(config.publish_date, Some(due));
    assert_eq!(scheduler.queue_depth().await.unwrap(), 0);
    assert_eq!(h.publisher.post_count(SURVEY), 1);
}

#[tokio::test]
async fn re_saving_a_live_survey_does_not_publish_twice() {
    let h = Harness::new();
    h.live_survey().await;
    h.clock.advance(10 * 60_000);

    let mut payload = survey_payload(Some(NOW));
    payload["intro"] = "Updated intro".into();
    let outcome = h.surveys.upsert(OWNER, SURVEY, &payload).await.unwrap();
    assert_eq!(outcome.post_id, None);
    assert_eq!(h.publisher.post_count(SURVEY), 1);
}

#[tokio::test]
async fn failed_immediate_publish_is_handed_to_the_queue() {
    let h = Harness::new();
    h.publisher.fail_for(SURVEY);

    let err = h
        .surveys
        .upsert(OWNER, SURVEY, &survey_payload(Some(NOW)))
        .await
        .expect_err("host refused the post");
    assert!(matches!(err, DomainError::Publish(_)));

    let queued = h
        .kv
        .hget(&h.ctx.keys.publish_queue(), SURVEY)
        .await
        .unwrap();
    assert_eq!(queued, Some(NOW.to_string()));
    assert!(h.surveys.get_config(SURVEY).await.unwrap().is_some());
}

#[tokio::test]
async fn another_owner_cannot_overwrite_a_survey() {
    let h = Harness::new();
    h.create_survey(SURVEY, None).await;

    let err = h
        .surveys
        .upsert("t2_intruder", SURVEY, &survey_payload(None))
        .await
        .expect_err("owner mismatch");
    assert!(matches!(err, DomainError::Validation(_)));
    let config = h.surveys.get_config(SURVEY).await.unwrap().unwrap();
    assert_eq!(config.owner, OWNER);
}

#[tokio::test]
async fn malformed_ids_and_payloads_are_rejected() {
    let h = Harness::new();
    let err = h
        .surveys
        .upsert(OWNER, "survey-1", &survey_payload(None))
        .await
        .expect_err("bad survey id");
    assert!(matches!(err, DomainError::Validation(_)));

    let mut payload = survey_payload(None);
    payload["title"] = "".into();
    let err = h
        .surveys
        .upsert(OWNER, SURVEY, &payload)
        .await
        .expect_err("blank title");
    assert!(matches!(err, DomainError::Validation(_)));
    assert_eq!(h.kv.key_count(), 0);
}

#[tokio::test]
async fn stale_owner_index_entries_are_skipped() {
    let h = Harness::new();
    h.create_survey(SURVEY, None).await;
    h.kv.hset(
        &h.ctx.keys.owner_index(OWNER).unwrap(),
        &[("sv_ghost00001".to_string(), (NOW + 1).to_string())],
    )
    .await
    .unwrap();

    let listed = h.surveys.list_for_owner(OWNER).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, SURVEY);
}

#[tokio::test]
async fn owner_listing_is_newest_first() {
    let h = Harness::new();
    h.create_survey("sv_first00001", None).await;
    h.clock.advance(1_000);
    h.create_survey("sv_second0001", None).await;

    let ids: Vec<String> = h
        .surveys
        .list_for_owner(OWNER)
        .await
        .unwrap()
        .into_iter()
        .map(|config| config.id)
        .collect();
    assert_eq!(ids, vec!["sv_second0001", "sv_first00001"]);
}

#[tokio::test]
async fn closing_a_queued_survey_clears_its_publish_date() {
    let h = Harness::new();
    h.create_survey(SURVEY, Some(NOW + 3_600_000)).await;

    assert!(h.surveys.close(SURVEY).await.unwrap());
    let config = h.surveys.get_config(SURVEY).await.unwrap().unwrap();
    assert_eq!(config.close_date, Some(NOW));
    assert_eq!(config.publish_date, None);
    assert_eq!(
        h.kv.hlen(&h.ctx.keys.publish_queue()).await.unwrap(),
        0
    );

    assert!(!h.surveys.close("sv_missing001").await.unwrap());
}

#[tokio::test]
async fn closing_a_live_survey_keeps_its_publish_date() {
    let h = Harness::new();
    h.live_survey().await;
    h.clock.advance(1_000);

    assert!(h.surveys.close(SURVEY).await.unwrap());
    let config = h.surveys.get_config(SURVEY).await.unwrap().unwrap();
    assert_eq!(config.publish_date, Some(NOW));
    assert_eq!(config.close_date, Some(NOW + 1_000));
    assert!(!config.accepts_responses(NOW + 1_000));
}

#[tokio::test]
async fn dropping_a_question_deletes_its_tally() {
    let h = Harness::new();
    h.live_survey().await;
    h.responses
        .upsert_answer(
            &user(1),
            SURVEY,
            Q_SCALE,
            &quorum_domain::survey::AnswerValue::One("3".into()),
        )
        .await
        .unwrap();
    let tally_key = h.ctx.keys.question_tally(SURVEY, Q_SCALE).unwrap();
    assert!(h.kv.exists(&tally_key).await.unwrap());

    let mut payload = survey_payload(Some(NOW));
    let questions = payload["questions"].as_array_mut().unwrap();
    questions.retain(|question| question["id"] != Q_SCALE);
    h.surveys.upsert(OWNER, SURVEY, &payload).await.unwrap();

    assert!(!h.kv.exists(&tally_key).await.unwrap());
    let remaining = h.surveys.get_questions(SURVEY).await.unwrap().unwrap();
    assert_eq!(remaining.len(), 3);
}

#[tokio::test]
async fn response_count_follows_the_roster() {
    let h = Harness::new();
    h.live_survey().await;
    for index in 0..3 {
        h.responses
            .upsert_answer(
                &user(index),
                SURVEY,
                Q_TEXT,
                &quorum_domain::survey::AnswerValue::One("yum".into()),
            )
            .await
            .unwrap();
    }
    let config = h.surveys.get_config(SURVEY).await.unwrap().unwrap();
    assert_eq!(config.response_count, 3);
}
