use chartflow_core::chart::ChartStore;
use chartflow_core::error::ChartError;
use chartflow_core::models::{AiStatus, ChartMetadata, ReviewStatus};
use serde_json::json;
use sqlx::PgPool;

#[sqlx::test(migrations = "../migrations")]
async fn create_queued_is_idempotent_by_session(db: PgPool) {
    let store = ChartStore::from_pool(db);

    let first = store
        .create_queued("session-1", "CHT-1", &ChartMetadata::default(), 2)
        .await
        .expect("first create_queued failed");
    assert_eq!(first.document_count, 2);
    assert_eq!(first.ai_status, AiStatus::Queued);

    let second = store
        .create_queued("session-1", "CHT-1", &ChartMetadata::default(), 1)
        .await
        .expect("second create_queued failed");

    // Merging a second upload batch accumulates the document count rather
    // than overwriting it.
    assert_eq!(second.id, first.id);
    assert_eq!(second.document_count, 3);
}

#[sqlx::test(migrations = "../migrations")]
async fn store_results_snapshots_original_codes_once(db: PgPool) {
    let store = ChartStore::from_pool(db);
    store
        .create_queued("session-2", "CHT-2", &ChartMetadata::default(), 1)
        .await
        .expect("create_queued failed");

    let first_codes = json!({"codes": ["A01"]});
    store
        .store_results("CHT-2", &first_codes, &first_codes)
        .await
        .expect("first store_results failed");

    let chart = store
        .get_by_chart_number("CHT-2")
        .await
        .expect("get_by_chart_number failed")
        .expect("chart should exist");
    assert_eq!(chart.ai_status, AiStatus::Ready);
    assert_eq!(chart.original_ai_codes.unwrap().0, first_codes);

    let reprocessed_codes = json!({"codes": ["A01", "B02"]});
    store
        .store_results("CHT-2", &reprocessed_codes, &reprocessed_codes)
        .await
        .expect("second store_results failed");

    let chart = store
        .get_by_chart_number("CHT-2")
        .await
        .expect("get_by_chart_number failed")
        .expect("chart should exist");
    // original_ai_codes is a write-once snapshot: a later reprocessing
    // must not clobber it even though ai_result moves forward.
    assert_eq!(chart.original_ai_codes.unwrap().0, first_codes);
    assert_eq!(chart.ai_result.unwrap().0, reprocessed_codes);
}

#[sqlx::test(migrations = "../migrations")]
async fn record_error_below_limit_sets_retry_pending(db: PgPool) {
    let store = ChartStore::from_pool(db);
    store
        .create_queued("session-3", "CHT-3", &ChartMetadata::default(), 1)
        .await
        .expect("create_queued failed");

    store
        .record_error("CHT-3", "ocr timed out", true, 1)
        .await
        .expect("record_error failed");

    let chart = store
        .get_by_chart_number("CHT-3")
        .await
        .expect("get_by_chart_number failed")
        .expect("chart should exist");
    assert_eq!(chart.ai_status, AiStatus::RetryPending);
    assert_eq!(chart.last_error.as_deref(), Some("ocr timed out"));
}

#[sqlx::test(migrations = "../migrations")]
async fn reset_for_retry_refuses_from_non_failed_states(db: PgPool) {
    let store = ChartStore::from_pool(db);
    store
        .create_queued("session-4", "CHT-4", &ChartMetadata::default(), 1)
        .await
        .expect("create_queued failed");

    // Chart is still `queued`: reset_for_retry refuses the transition.
    match store.reset_for_retry("CHT-4").await {
        Err(ChartError::InvalidTransition(chart_number, status)) => {
            assert_eq!(chart_number, "CHT-4");
            assert_eq!(status, AiStatus::Queued);
        }
        other => panic!("expected InvalidTransition, got {other:?}"),
    }
    let chart = store
        .get_by_chart_number("CHT-4")
        .await
        .expect("get_by_chart_number failed")
        .expect("chart should exist");
    assert_eq!(chart.ai_status, AiStatus::Queued);

    store
        .record_error("CHT-4", "permanent failure", false, 3)
        .await
        .expect("record_error failed");
    store
        .reset_for_retry("CHT-4")
        .await
        .expect("reset_for_retry failed");
    let chart = store
        .get_by_chart_number("CHT-4")
        .await
        .expect("get_by_chart_number failed")
        .expect("chart should exist");
    assert_eq!(chart.ai_status, AiStatus::Queued);
    assert!(chart.last_error.is_none());
}

#[sqlx::test(migrations = "../migrations")]
async fn reset_for_retry_on_missing_chart_is_not_found(db: PgPool) {
    let store = ChartStore::from_pool(db);

    match store.reset_for_retry("CHT-GHOST").await {
        Err(ChartError::ChartNotFound(chart_number)) => assert_eq!(chart_number, "CHT-GHOST"),
        other => panic!("expected ChartNotFound, got {other:?}"),
    }
}

#[sqlx::test(migrations = "../migrations")]
async fn reset_for_retry_clears_snapshot_for_the_next_generation(db: PgPool) {
    let store = ChartStore::from_pool(db);
    store
        .create_queued("session-6", "CHT-6", &ChartMetadata::default(), 1)
        .await
        .expect("create_queued failed");

    let first_codes = json!({"codes": ["A01"]});
    store
        .store_results("CHT-6", &first_codes, &first_codes)
        .await
        .expect("first store_results failed");

    store
        .record_error("CHT-6", "permanent failure", false, 3)
        .await
        .expect("record_error failed");

    store
        .reset_for_retry("CHT-6")
        .await
        .expect("reset_for_retry failed");

    let chart = store
        .get_by_chart_number("CHT-6")
        .await
        .expect("get_by_chart_number failed")
        .expect("chart should exist");
    assert_eq!(chart.ai_status, AiStatus::Queued);
    assert!(chart.original_ai_codes.is_none());
    assert!(chart.ai_result.is_none());

    // Reprocessing after the reset re-snapshots: the original codes
    // should now reflect this second generation, not the first.
    let second_codes = json!({"codes": ["C03"]});
    store
        .store_results("CHT-6", &second_codes, &second_codes)
        .await
        .expect("second store_results failed");

    let chart = store
        .get_by_chart_number("CHT-6")
        .await
        .expect("get_by_chart_number failed")
        .expect("chart should exist");
    assert_eq!(chart.original_ai_codes.unwrap().0, second_codes);
    assert_eq!(chart.ai_result.unwrap().0, second_codes);
}

#[sqlx::test(migrations = "../migrations")]
async fn submit_final_codes_requires_explicit_codes(db: PgPool) {
    let store = ChartStore::from_pool(db);
    store
        .create_queued("session-5", "CHT-5", &ChartMetadata::default(), 1)
        .await
        .expect("create_queued failed");

    let final_codes = json!({"codes": ["A01"], "approved_by": "reviewer-1"});
    store
        .submit_final_codes("CHT-5", &final_codes)
        .await
        .expect("submit_final_codes failed");

    let chart = store
        .get_by_chart_number("CHT-5")
        .await
        .expect("get_by_chart_number failed")
        .expect("chart should exist");
    assert_eq!(chart.review_status, ReviewStatus::Submitted);
    assert!(chart.submitted_at.is_some());
    assert_eq!(chart.final_codes.unwrap().0, final_codes);
}
