use super::*;
use crate::test_support::{ScriptedUploader, StallingUploader};

fn reading(node: &str) -> Reading {
    Reading::new(node, "temperature", 20.5, "C")
}

fn nodes(readings: &[Reading]) -> Vec<String> {
    readings.iter().map(|r| r.node_id.clone()).collect()
}

fn gateway_with(
    max_size: usize,
    threshold: usize,
    uploader: Arc<dyn Uploader>,
) -> Arc<Gateway> {
    let buffer = Arc::new(SensorBuffer::new(max_size, threshold));
    Arc::new(Gateway::new(
        "gw-test",
        buffer,
        uploader,
        Duration::from_secs(5),
    ))
}

#[tokio::test]
async fn ring_buffer_batch_and_retry_scenario() {
    let uploader = Arc::new(ScriptedUploader::new([true, false, true]));
    let gateway = gateway_with(3, 2, uploader.clone());

    for node in ["A", "B", "C", "D"] {
        gateway.submit(reading(node));
    }
    assert_eq!(nodes(&gateway.buffer().get_readings(None)), vec!["B", "C", "D"]);
    assert!(gateway.buffer().should_batch_upload());

    let outcome = gateway.force_batch().await.unwrap();
    assert!(outcome.uploaded());
    assert_eq!(outcome.size(), 3);
    assert_eq!(nodes(&uploader.seen()[0].readings), vec!["B", "C", "D"]);
    assert!(gateway.buffer().is_empty());

    gateway.submit(reading("E"));
    let outcome = gateway.force_batch().await.unwrap();
    assert!(!outcome.uploaded());
    assert_eq!(outcome.size(), 1);
    let queued = gateway.buffer().offline_batches();
    assert_eq!(queued.len(), 1);
    assert_eq!(nodes(&queued[0].batch.readings), vec!["E"]);
    assert_eq!(nodes(&gateway.buffer().get_readings(None)), vec!["E"]);

    let report = gateway.retry_offline().await;
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.remaining, 0);
    assert_eq!(gateway.buffer().offline_len(), 0);
}

#[tokio::test]
async fn empty_buffer_refuses_batch_without_uploading() {
    let uploader = Arc::new(ScriptedUploader::succeeding());
    let gateway = gateway_with(10, 2, uploader.clone());

    let err = gateway.force_batch().await.unwrap_err();
    assert!(matches!(err, GatewayError::EmptyBuffer));
    assert_eq!(uploader.attempts(), 0);
    assert_eq!(gateway.buffer().offline_len(), 0);
}

#[tokio::test]
async fn failed_upload_keeps_every_reading() {
    let uploader = Arc::new(ScriptedUploader::always_failing());
    let gateway = gateway_with(10, 2, uploader);
    for node in ["a", "b", "c"] {
        gateway.submit(reading(node));
    }
    let before = gateway.buffer().get_readings(None);

    let outcome = gateway.force_batch().await.unwrap();
    assert!(matches!(outcome, BatchOutcome::Queued { size: 3, .. }));

    assert_eq!(gateway.buffer().get_readings(None), before);
    let queued = gateway.buffer().offline_batches();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].batch.readings, before);
    assert_eq!(queued[0].batch.gateway_id, "gw-test");
}

#[tokio::test]
async fn retry_on_empty_queue_is_a_noop() {
    let uploader = Arc::new(ScriptedUploader::succeeding());
    let gateway = gateway_with(10, 2, uploader.clone());

    for _ in 0..2 {
        let report = gateway.retry_offline().await;
        assert_eq!(report, RetryReport::default());
        assert_eq!(gateway.buffer().offline_len(), 0);
    }
    assert_eq!(uploader.attempts(), 0);
}

#[tokio::test]
async fn retry_keeps_only_batches_that_fail_again() {
    // Two formation failures, then retry: first batch fails again, second succeeds.
    let uploader = Arc::new(ScriptedUploader::new([false, false, false, true]));
    let gateway = gateway_with(10, 1, uploader);

    gateway.submit(reading("a"));
    gateway.force_batch().await.unwrap();
    gateway.submit(reading("b"));
    gateway.force_batch().await.unwrap();
    assert_eq!(gateway.buffer().offline_len(), 2);

    let report = gateway.retry_offline().await;
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.remaining, 1);
    let left = gateway.buffer().offline_batches();
    assert_eq!(nodes(&left[0].batch.readings), vec!["a"]);
}

#[tokio::test]
async fn readings_added_during_upload_survive_acknowledgement() {
    let uploader = Arc::new(StallingUploader::new());
    let gateway = gateway_with(10, 2, uploader.clone());
    gateway.submit(reading("a"));
    gateway.submit(reading("b"));

    let task = tokio::spawn({
        let gateway = gateway.clone();
        async move { gateway.force_batch().await }
    });
    uploader.wait_started().await;

    gateway.submit(reading("c"));
    uploader.release(1);

    let outcome = task.await.unwrap().unwrap();
    assert!(outcome.uploaded());
    assert_eq!(outcome.size(), 2);
    assert_eq!(nodes(&gateway.buffer().get_readings(None)), vec!["c"]);
}

#[tokio::test]
async fn batch_queued_during_retry_pass_is_not_lost() {
    let uploader = Arc::new(StallingUploader::new());
    let gateway = gateway_with(10, 2, uploader.clone());
    gateway
        .buffer()
        .queue_offline(Batch::new("gw-test", vec![reading("old")]));

    let task = tokio::spawn({
        let gateway = gateway.clone();
        async move { gateway.retry_offline().await }
    });
    uploader.wait_started().await;

    gateway
        .buffer()
        .queue_offline(Batch::new("gw-test", vec![reading("new")]));
    uploader.release(1);

    let report = task.await.unwrap();
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.remaining, 1);
    let left = gateway.buffer().offline_batches();
    assert_eq!(nodes(&left[0].batch.readings), vec!["new"]);
}

#[tokio::test(start_paused = true)]
async fn timed_out_upload_is_queued() {
    let uploader = Arc::new(StallingUploader::new());
    let buffer = Arc::new(SensorBuffer::new(10, 2));
    let gateway = Gateway::new(
        "gw-test",
        buffer.clone(),
        uploader,
        Duration::from_millis(200),
    );
    gateway.submit(reading("a"));

    let outcome = gateway.force_batch().await.unwrap();
    match outcome {
        BatchOutcome::Queued { reason, size, .. } => {
            assert_eq!(size, 1);
            assert!(matches!(reason, UploadError::Timeout(_)));
        }
        other => panic!("expected queued outcome, got {other:?}"),
    }
    assert_eq!(buffer.len(), 1);
    assert_eq!(buffer.offline_len(), 1);
}

#[tokio::test]
async fn list_offline_summarises_queue() {
    let uploader = Arc::new(ScriptedUploader::always_failing());
    let gateway = gateway_with(10, 2, uploader);
    gateway.submit(reading("a"));
    gateway.submit(reading("b"));
    let outcome = gateway.force_batch().await.unwrap();

    let listed = gateway.list_offline();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].gateway_id, "gw-test");
    assert_eq!(listed[0].reading_count, 2);
    assert_eq!(listed[0].timestamp, outcome.batch_timestamp());
}

#[tokio::test(start_paused = true)]
async fn batch_scheduler_uploads_once_threshold_is_reached() {
    let uploader = Arc::new(ScriptedUploader::succeeding());
    let gateway = gateway_with(10, 2, uploader.clone());
    let scheduler = tokio::spawn(run_batch_scheduler(
        gateway.clone(),
        Duration::from_millis(100),
        Duration::from_secs(3600),
    ));

    gateway.submit(reading("a"));
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(uploader.attempts(), 0);

    gateway.submit(reading("b"));
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(uploader.attempts(), 1);
    assert!(gateway.buffer().is_empty());

    scheduler.abort();
}

#[tokio::test(start_paused = true)]
async fn batch_scheduler_flushes_partial_buffer_on_interval() {
    let uploader = Arc::new(ScriptedUploader::succeeding());
    let gateway = gateway_with(10, 5, uploader.clone());
    let scheduler = tokio::spawn(run_batch_scheduler(
        gateway.clone(),
        Duration::from_millis(100),
        Duration::from_secs(60),
    ));

    gateway.submit(reading("a"));
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(uploader.attempts(), 1);
    assert!(gateway.buffer().is_empty());

    scheduler.abort();
}

#[tokio::test(start_paused = true)]
async fn retry_scheduler_drains_offline_queue() {
    let uploader = Arc::new(ScriptedUploader::new([false]));
    let gateway = gateway_with(10, 1, uploader.clone());
    gateway.submit(reading("a"));
    gateway.force_batch().await.unwrap();
    assert_eq!(gateway.buffer().offline_len(), 1);

    let scheduler = tokio::spawn(run_retry_scheduler(
        gateway.clone(),
        Duration::from_secs(300),
    ));
    tokio::time::sleep(Duration::from_secs(301)).await;
    assert_eq!(gateway.buffer().offline_len(), 0);
    assert_eq!(uploader.attempts(), 2);

    scheduler.abort();
}

#[tokio::test(start_paused = true)]
async fn batch_scheduler_backs_off_threshold_during_outage() {
    let uploader = Arc::new(ScriptedUploader::always_failing());
    let gateway = gateway_with(10, 1, uploader.clone());
    let scheduler = tokio::spawn(run_batch_scheduler(
        gateway.clone(),
        Duration::from_millis(100),
        Duration::from_secs(60),
    ));

    gateway.submit(reading("a"));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(uploader.attempts(), 1);
    assert_eq!(gateway.buffer().offline_len(), 1);

    // The interval flush still snapshots the buffer while upstream is down.
    tokio::time::sleep(Duration::from_secs(56)).await;
    assert_eq!(uploader.attempts(), 2);
    assert_eq!(gateway.buffer().offline_len(), 2);

    scheduler.abort();
}

#[tokio::test(start_paused = true)]
async fn batch_scheduler_resumes_threshold_once_queue_drains() {
    let uploader = Arc::new(ScriptedUploader::new([false]));
    let gateway = gateway_with(10, 1, uploader.clone());
    let scheduler = tokio::spawn(run_batch_scheduler(
        gateway.clone(),
        Duration::from_millis(100),
        Duration::from_secs(3600),
    ));

    gateway.submit(reading("a"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(gateway.buffer().offline_len(), 1);
    assert_eq!(gateway.buffer().len(), 1);

    gateway.retry_offline().await;
    assert_eq!(gateway.buffer().offline_len(), 0);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(gateway.buffer().is_empty());
    assert_eq!(uploader.attempts(), 3);

    scheduler.abort();
}
