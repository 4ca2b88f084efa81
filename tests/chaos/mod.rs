//! Chaos tests for assetwalk
//!
//! Simulates the failures a long batch meets in practice: processes killed
//! mid-run, torn log tails, stale locks, signals and panicking processors.
//! Each scenario checks that the next run picks up exactly the unfinished
//! work.

use crate::integration::{image_key, zip_members, Harness, RecordingProcessor, AGENT};
use ::assetwalk::archive::SPLICE_MARKER;
use ::assetwalk::*;
use std::fs::{self, OpenOptions};
use std::io::Write;
use tracing::info;

#[tokio::test]
async fn test_resume_after_crash_reprocesses_running_items() {
    let h = Harness::new();
    h.write("App1/VariantA/img1.png", b"1");
    h.write("App1/VariantA/img2.png", b"2");
    h.write("App1/VariantA/img3.png", b"3");

    // State left by a process killed while img2 was in flight
    {
        let store = h.store();
        let app = ProgressKey::app(AGENT, "App1");
        let variant = ProgressKey::variant(AGENT, "App1", "VariantA");
        let done = image_key(&h, "App1/VariantA/img1.png");
        let in_flight = image_key(&h, "App1/VariantA/img2.png");
        store.mark_started(&app).unwrap();
        store.mark_started(&variant).unwrap();
        store.mark_started(&done).unwrap();
        store.mark_completed(&done).unwrap();
        store.mark_started(&in_flight).unwrap();
    }

    let processor = RecordingProcessor::new();
    let summary = h.run(h.config(), &processor).await;
    info!("Resumed run: {:?}", summary);

    assert_eq!(processor.names(), vec!["img2.png", "img3.png"]);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.apps_completed, 1);

    let store = h.store();
    let retried = store
        .record(&image_key(&h, "App1/VariantA/img2.png"))
        .unwrap();
    assert_eq!(retried.status, ProgressStatus::Completed);
    assert_eq!(retried.attempts, 2);
}

#[tokio::test]
async fn test_resume_after_crash_mid_archive() {
    let h = Harness::new();
    h.write_zip("App1/bundle.zip", &[("a.png", b"a"), ("b.png", b"b")]);
    let mut config = h.config();
    config.concurrency = Some(1);

    // The first run dies on b.png after a.png from the archive completed
    let crashing = RecordingProcessor::panicking_on("b.png");
    let engine = h.engine(config.clone(), &crashing);
    let outcome = engine.run_until(futures::future::pending()).await;
    assert_eq!(outcome.exit_code(), 1);
    engine.close().unwrap();

    assert!(h.source.join("App1/bundle").join(SPLICE_MARKER).exists());
    assert!(h.store().is_completed(&image_key(&h, "App1/bundle/a.png")));

    let resumed = RecordingProcessor::new();
    let summary = h.run(config, &resumed).await;

    // The leftover extraction is spliced again under the archive's context
    assert_eq!(resumed.names(), vec!["b.png"]);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.archives_spliced, 1);
    assert_eq!(summary.archives_skipped, 0);
    assert_eq!(summary.variants_completed, 1);
    assert!(!h.source.join("App1/bundle").exists());
    assert!(!h.output.join("App1/bundle").exists());
    assert_eq!(
        zip_members(&h.output.join("App1/bundle.zip")),
        vec!["a.png", "b.png"]
    );

    let store = h.store();
    assert!(store.is_completed(&ProgressKey::app(AGENT, "App1")));
    assert!(store.is_completed(&ProgressKey::variant(AGENT, "App1", "default")));
    assert!(store.is_completed(&image_key(&h, "App1/bundle/b.png")));
}

#[tokio::test]
async fn test_marker_for_another_archive_is_not_resumed() {
    let h = Harness::new();
    h.write_zip("App1/bundle.zip", &[("zipped.png", b"z")]);
    let laid_out = h.write("App1/bundle/a.png", b"a");
    h.write(&format!("App1/bundle/{}", SPLICE_MARKER), b"other.zip");

    let processor = RecordingProcessor::new();
    let summary = h.run(h.config(), &processor).await;

    assert_eq!(summary.archives_skipped, 1);
    assert_eq!(processor.names(), vec!["a.png"]);
    assert!(laid_out.exists());
    assert!(h.store().is_completed(&ProgressKey::variant(AGENT, "App1", "bundle")));
}

#[tokio::test]
async fn test_torn_log_tail_is_tolerated() {
    let h = Harness::new();
    h.write("App1/VariantA/img1.png", b"1");
    h.write("App1/VariantA/img2.png", b"2");

    let first = RecordingProcessor::new();
    h.run(h.config(), &first).await;

    // A crash mid-append leaves garbage at the end of the streams
    for stream in ["apps", "images"] {
        let path = h.logs.join("index").join(format!("{}.jsonl", stream));
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"seq\":12345,\"ts\":\"2025-01-01T00:").unwrap();
    }
    h.write("App1/VariantB/img3.png", b"3");

    let store = h.store();
    assert!(store.is_completed(&ProgressKey::app(AGENT, "App1")));
    assert_eq!(store.counts(Scope::Image).completed, 2);
    drop(store);

    // The completed app is still skipped and later appends stay readable
    let second = RecordingProcessor::new();
    let summary = h.run(h.config(), &second).await;
    assert_eq!(second.call_count(), 0);
    assert_eq!(summary.apps_skipped, 1);

    let store = h.store();
    assert_eq!(store.runs().len(), 4);
}

#[tokio::test]
async fn test_stale_lock_requires_force_unlock() {
    let h = Harness::new();
    h.write("App1/VariantA/img1.png", b"1");
    fs::create_dir_all(&h.logs).unwrap();
    fs::write(h.logs.join("LOCK"), "pid=99999 host=elsewhere started=2025-01-01T00:00:00Z\n").unwrap();

    let err = EngineBuilder::new(h.config()).build().unwrap_err();
    match &err {
        WalkError::LogDirLocked { holder, .. } => assert!(holder.contains("host=elsewhere")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.exit_code(), 2);

    let processor = RecordingProcessor::new();
    let engine = EngineBuilder::new(h.config())
        .processor(std::sync::Arc::new(processor.clone()))
        .force_unlock(true)
        .build()
        .unwrap();
    let holder = fs::read_to_string(h.logs.join("LOCK")).unwrap();
    assert!(holder.contains(&format!("pid={}", std::process::id())));

    engine.run().await.unwrap();
    engine.close().unwrap();
    assert!(!h.logs.join("LOCK").exists());
    assert_eq!(processor.call_count(), 1);
}

#[tokio::test]
async fn test_signal_flushes_and_next_run_finishes() {
    let h = Harness::new();
    for i in 0..6 {
        h.write(&format!("App1/VariantA/img{}.png", i), b"x");
    }

    let processor = RecordingProcessor::new();
    let engine = h.engine(h.config(), &processor);
    let outcome = engine
        .run_until(async { InterruptSignal::TERMINATE })
        .await;

    assert!(matches!(outcome, RunOutcome::Interrupted(s) if s == InterruptSignal::TERMINATE));
    assert_eq!(outcome.exit_code(), 143);
    engine.close().unwrap();

    // The abort path compacted before returning
    assert!(h.logs.join("index").join("errors.json").exists());

    let store = h.store();
    let interruption = store
        .errors()
        .into_iter()
        .find(|e| e.context.action == "system_interruption")
        .unwrap();
    assert_eq!(interruption.context.signal.as_deref(), Some("SIGTERM"));
    assert_eq!(store.runs().last().unwrap().status, RunStatus::Interrupted);
    drop(store);

    let resumed = RecordingProcessor::new();
    let summary = h.run(h.config(), &resumed).await;
    assert_eq!(summary.processed + summary.skipped, 6);
    assert_eq!(resumed.call_count(), summary.processed);
    assert!(h.store().is_completed(&ProgressKey::app(AGENT, "App1")));
}

#[tokio::test]
async fn test_panicking_processor_faults_the_run() {
    let h = Harness::new();
    h.write("App1/VariantA/boom.png", b"x");

    let processor = RecordingProcessor::panicking_on("boom");
    let engine = h.engine(h.config(), &processor);
    let outcome = engine.run_until(futures::future::pending()).await;

    match &outcome {
        RunOutcome::Faulted(WalkError::UnhandledFault(message)) => {
            assert!(message.contains("processor blew up"))
        }
        other => panic!("unexpected outcome: {:?}", other.exit_code()),
    }
    assert_eq!(outcome.exit_code(), 1);
    engine.close().unwrap();

    let store = h.store();
    assert!(store
        .errors()
        .iter()
        .any(|e| e.context.action == "uncaught_exception"));
    assert_eq!(store.runs().last().unwrap().status, RunStatus::Failed);
    let key = image_key(&h, "App1/VariantA/boom.png");
    assert_eq!(store.status(&key), Some(ProgressStatus::Running));
    drop(store);

    // The item left running is picked up again
    let fixed = RecordingProcessor::new();
    let summary = h.run(h.config(), &fixed).await;
    assert_eq!(summary.processed, 1);
    assert!(h.store().is_completed(&key));
}

#[tokio::test]
async fn test_failing_processor_never_aborts_the_batch() {
    let h = Harness::new();
    for app in ["A", "B", "C"] {
        h.write(&format!("{}/v/bad.png", app), b"x");
        h.write(&format!("{}/v/good.png", app), b"x");
    }

    let processor = RecordingProcessor::failing_on("bad");
    let summary = h.run(h.config(), &processor).await;

    assert_eq!(processor.call_count(), 6);
    assert_eq!(summary.failed, 3);
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.apps_completed, 3);
    assert_eq!(h.store().errors().len(), 3);
}
