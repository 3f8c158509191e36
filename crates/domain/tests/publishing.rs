mod common;

use std::sync::Arc;

use common::*;
use quorum_domain::ports::kv::KeyValueStore;
use quorum_domain::publishing::PublishScheduler;
use quorum_domain::purge::PurgeWorkflow;

const HOUR_MS: i64 = 3_600_000;

fn scheduler(h: &Harness) -> PublishScheduler {
    PublishScheduler::new(h.ctx.clone(), Arc::new(h.publisher.clone()))
}

#[tokio::test]
async fn one_failing_entry_does_not_block_the_others() {
    let h = Harness::new();
    h.create_survey("sv_alpha00001", Some(NOW + HOUR_MS)).await;
    h.create_survey("sv_bravo00001", Some(NOW + HOUR_MS + 1)).await;
    h.create_survey("sv_charlie001", Some(NOW + HOUR_MS + 2)).await;
    h.publisher.fail_for("sv_bravo00001");

    let now = NOW + 2 * HOUR_MS;
    h.clock.set(now);
    let report = scheduler(&h).run_tick(now).await.unwrap();

    let published: Vec<&str> = report
        .published
        .iter()
        .map(|(survey_id, _)| survey_id.as_str())
        .collect();
    assert_eq!(published, vec!["sv_alpha00001", "sv_charlie001"]);
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 0);

    let queue = h.ctx.keys.publish_queue();
    assert_eq!(h.kv.hkeys(&queue).await.unwrap(), vec!["sv_bravo00001"]);

    h.publisher.recover("sv_bravo00001");
    let retry = scheduler(&h).run_tick(now).await.unwrap();
    assert_eq!(retry.published.len(), 1);
    assert_eq!(h.kv.hlen(&queue).await.unwrap(), 0);
    assert_eq!(h.publisher.posts().len(), 3);
}

#[tokio::test]
async fn stale_entries_are_dropped_without_posting() {
    let h = Harness::new();
    h.create_survey("sv_closed0001", Some(NOW + HOUR_MS)).await;
    h.create_survey("sv_deleted001", Some(NOW + HOUR_MS)).await;
    h.surveys.close("sv_closed0001").await.unwrap();
    // Closing dequeues; put the entry back to model a racing writer.
    let queue = h.ctx.keys.publish_queue();
    h.kv.hset(
        &queue,
        &[
            ("sv_closed0001".to_string(), (NOW + HOUR_MS).to_string()),
            ("sv_vanished01".to_string(), NOW.to_string()),
            ("not-a-survey".to_string(), NOW.to_string()),
        ],
    )
    .await
    .unwrap();
    PurgeWorkflow::new(h.surveys.clone())
        .enqueue("sv_deleted001")
        .await
        .unwrap();
    h.kv.hset(
        &queue,
        &[("sv_deleted001".to_string(), (NOW + HOUR_MS).to_string())],
    )
    .await
    .unwrap();

    let now = NOW + 2 * HOUR_MS;
    h.clock.set(now);
    let report = scheduler(&h).run_tick(now).await.unwrap();
    assert!(report.published.is_empty());
    assert_eq!(report.skipped, 4);
    assert_eq!(report.failed, 0);
    assert_eq!(h.kv.hlen(&queue).await.unwrap(), 0);
    assert!(h.publisher.posts().is_empty());
}

#[tokio::test]
async fn entry_whose_publish_date_moved_later_stays_queued() {
    let h = Harness::new();
    h.create_survey(SURVEY, Some(NOW + HOUR_MS)).await;
    let queue = h.ctx.keys.publish_queue();
    // Queue says due now, config says an hour from now.
    h.kv.hset(&queue, &[(SURVEY.to_string(), NOW.to_string())])
        .await
        .unwrap();

    let report = scheduler(&h).run_tick(NOW).await.unwrap();
    assert!(report.published.is_empty());
    assert_eq!(report.skipped, 1);
    assert!(h.kv.hget(&queue, SURVEY).await.unwrap().is_some());
}

#[tokio::test]
async fn entry_for_an_already_published_survey_is_dropped() {
    let h = Harness::new();
    h.live_survey().await;
    let post_id = h.surveys.get_post_id(SURVEY).await.unwrap();
    assert!(post_id.is_some());

    let queue = h.ctx.keys.publish_queue();
    h.kv.hset(&queue, &[(SURVEY.to_string(), NOW.to_string())])
        .await
        .unwrap();

    let report = scheduler(&h).run_tick(NOW).await.unwrap();
    assert!(report.published.is_empty());
    assert_eq!(report.skipped, 1);
    assert_eq!(h.kv.hlen(&queue).await.unwrap(), 0);
    assert_eq!(h.publisher.post_count(SURVEY), 1);
    assert_eq!(h.surveys.get_post_id(SURVEY).await.unwrap(), post_id);
}
