use std::sync::Arc;

use chartflow_core::chart::ChartStore;
use chartflow_core::models::{ChartMetadata, JobData};
use chartflow_core::queue::QueueStore;
use sqlx::PgPool;

fn job_data(chart_id: i64) -> JobData {
    JobData {
        chart_id,
        chart_number: format!("CHT-{chart_id}"),
        session_id: Some(format!("session-{chart_id}")),
        documents: vec![],
    }
}

async fn seed_chart(pool: &PgPool, chart_number: &str) -> i64 {
    let store = ChartStore::from_pool(pool.clone());
    let chart = store
        .create_queued(
            &format!("session-{chart_number}"),
            chart_number,
            &ChartMetadata::default(),
            1,
        )
        .await
        .expect("failed to seed chart");
    chart.id
}

#[sqlx::test(migrations = "../migrations")]
async fn enqueue_then_claim_marks_processing(db: PgPool) {
    let chart_id = seed_chart(&db, "CHT-1").await;
    let queue = QueueStore::from_pool(db);

    let job_id = queue
        .enqueue(chart_id, "CHT-1", &job_data(chart_id), 3)
        .await
        .expect("enqueue failed");

    let claimed = queue
        .claim_next("worker-test-1")
        .await
        .expect("claim failed")
        .expect("expected a job");

    assert_eq!(claimed.id, job_id);
    assert_eq!(claimed.attempts, 1);
    assert_eq!(claimed.worker_id.as_deref(), Some("worker-test-1"));
}

#[sqlx::test(migrations = "../migrations")]
async fn two_workers_never_claim_the_same_job(db: PgPool) {
    let chart_id = seed_chart(&db, "CHT-2").await;
    let queue = Arc::new(QueueStore::from_pool(db));

    queue
        .enqueue(chart_id, "CHT-2", &job_data(chart_id), 3)
        .await
        .expect("enqueue failed");

    let first = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.claim_next("worker-a").await })
    };
    let second = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.claim_next("worker-b").await })
    };

    let (first, second) = tokio::join!(first, second);
    let first = first.unwrap().unwrap();
    let second = second.unwrap().unwrap();

    // Exactly one of the two claims should have found the single job.
    let claimed_count = [first, second].into_iter().flatten().count();
    assert_eq!(claimed_count, 1);
}

#[sqlx::test(migrations = "../migrations")]
async fn failing_below_max_attempts_schedules_retry(db: PgPool) {
    let chart_id = seed_chart(&db, "CHT-3").await;
    let queue = QueueStore::from_pool(db);

    let job_id = queue
        .enqueue(chart_id, "CHT-3", &job_data(chart_id), 3)
        .await
        .expect("enqueue failed");
    queue.claim_next("worker-1").await.expect("claim failed");

    let outcome = queue
        .fail(job_id, "ocr timed out")
        .await
        .expect("fail failed");

    assert!(outcome.will_retry);
    assert!(!outcome.is_permanently_failed);
    assert!(outcome.retry_after.is_some());
}

#[sqlx::test(migrations = "../migrations")]
async fn failing_at_max_attempts_is_permanent(db: PgPool) {
    let chart_id = seed_chart(&db, "CHT-4").await;
    let queue = QueueStore::from_pool(db);

    let job_id = queue
        .enqueue(chart_id, "CHT-4", &job_data(chart_id), 1)
        .await
        .expect("enqueue failed");
    queue.claim_next("worker-1").await.expect("claim failed");

    let outcome = queue
        .fail(job_id, "unrecoverable error")
        .await
        .expect("fail failed");

    assert!(!outcome.will_retry);
    assert!(outcome.is_permanently_failed);
    assert!(outcome.retry_after.is_none());
}

#[sqlx::test(migrations = "../migrations")]
async fn completing_a_job_is_idempotent(db: PgPool) {
    let chart_id = seed_chart(&db, "CHT-5").await;
    let queue = QueueStore::from_pool(db);

    let job_id = queue
        .enqueue(chart_id, "CHT-5", &job_data(chart_id), 3)
        .await
        .expect("enqueue failed");
    queue.claim_next("worker-1").await.expect("claim failed");

    queue.complete(job_id).await.expect("first complete failed");
    queue
        .complete(job_id)
        .await
        .expect("second complete should be a harmless no-op");

    let job = queue
        .get_job(job_id)
        .await
        .expect("get_job failed")
        .expect("job should still exist");
    assert_eq!(
        format!("{:?}", job.status).to_lowercase(),
        "completed".to_owned()
    );
}

#[sqlx::test(migrations = "../migrations")]
async fn release_stuck_recovers_stale_leases(db: PgPool) {
    let chart_id = seed_chart(&db, "CHT-6").await;
    let queue = QueueStore::from_pool(db.clone());

    let job_id = queue
        .enqueue(chart_id, "CHT-6", &job_data(chart_id), 3)
        .await
        .expect("enqueue failed");
    queue.claim_next("worker-1").await.expect("claim failed");

    // Backdate the lease so it looks stale without waiting out a real clock.
    sqlx::query("UPDATE processing_queue SET locked_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(job_id)
        .execute(&db)
        .await
        .expect("failed to backdate lease");

    let released = queue
        .release_stuck(30)
        .await
        .expect("release_stuck failed");
    assert_eq!(released, 1);

    let job = queue
        .get_job(job_id)
        .await
        .expect("get_job failed")
        .expect("job should still exist");
    assert_eq!(format!("{:?}", job.status).to_lowercase(), "failed");
}

#[sqlx::test(migrations = "../migrations")]
async fn cleanup_only_removes_aged_completed_jobs(db: PgPool) {
    let chart_id = seed_chart(&db, "CHT-7").await;
    let queue = QueueStore::from_pool(db.clone());

    let job_id = queue
        .enqueue(chart_id, "CHT-7", &job_data(chart_id), 3)
        .await
        .expect("enqueue failed");
    queue.claim_next("worker-1").await.expect("claim failed");
    queue.complete(job_id).await.expect("complete failed");

    // Not yet aged past the retention window: cleanup should leave it alone.
    let removed = queue.cleanup(7).await.expect("cleanup failed");
    assert_eq!(removed, 0);

    sqlx::query(
        "UPDATE processing_queue SET completed_at = NOW() - INTERVAL '8 days' WHERE id = $1",
    )
    .bind(job_id)
    .execute(&db)
    .await
    .expect("failed to backdate completed_at");

    let removed = queue.cleanup(7).await.expect("cleanup failed");
    assert_eq!(removed, 1);
}
