//! Integration tests for full batch scenarios
//!
//! Exercises the engine end to end over real directory trees: plain
//! App/Variant layouts, archive splicing with recompression, resume after
//! completed work and the completion policies.

use ::assetwalk::*;
use async_trait::async_trait;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

pub const AGENT: &str = "Agent1Crop";

/// Processor that copies its input and records every invocation
#[derive(Clone, Default)]
pub struct RecordingProcessor {
    pub calls: Arc<Mutex<Vec<PathBuf>>>,
    /// Inputs whose file name contains this fail with a downstream error
    pub fail_on: Option<String>,
    /// Inputs whose file name contains this panic
    pub panic_on: Option<String>,
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(marker: &str) -> Self {
        Self {
            fail_on: Some(marker.to_string()),
            ..Self::default()
        }
    }

    pub fn panicking_on(marker: &str) -> Self {
        Self {
            panic_on: Some(marker.to_string()),
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// File names of the processed inputs, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ItemProcessor for RecordingProcessor {
    async fn process(
        &self,
        input: &Path,
        destination: &Path,
    ) -> std::result::Result<PathBuf, ProcessingError> {
        self.calls.lock().unwrap().push(input.to_path_buf());
        let name = input.file_name().unwrap().to_string_lossy().into_owned();

        if let Some(marker) = &self.panic_on {
            if name.contains(marker.as_str()) {
                panic!("processor blew up on {}", name);
            }
        }
        if let Some(marker) = &self.fail_on {
            if name.contains(marker.as_str()) {
                return Err(ProcessingError::downstream(input, "rejected by test processor"));
            }
        }

        tokio::fs::copy(input, destination)
            .await
            .map_err(|e| ProcessingError::downstream(input, e))?;
        Ok(destination.to_path_buf())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Temporary source/output/logs layout
pub struct Harness {
    pub temp: TempDir,
    pub source: PathBuf,
    pub output: PathBuf,
    pub logs: PathBuf,
}

impl Harness {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("uploads");
        let output = temp.path().join("outputs");
        let logs = temp.path().join("logs");
        fs::create_dir_all(&source).unwrap();
        Self {
            temp,
            source,
            output,
            logs,
        }
    }

    /// Write a file below the source root
    pub fn write(&self, relative: &str, content: &[u8]) -> PathBuf {
        let path = self.source.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    /// Write a zip archive below the source root
    pub fn write_zip(&self, relative: &str, members: &[(&str, &[u8])]) -> PathBuf {
        let path = self.source.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, zip_bytes(members)).unwrap();
        path
    }

    /// Canonical source path, as used in image keys
    pub fn canonical(&self, relative: &str) -> PathBuf {
        self.source.canonicalize().unwrap().join(relative)
    }

    /// Config with the source root holding App folders directly
    pub fn config(&self) -> EngineConfig {
        let mut config = EngineConfig::new(AGENT, &self.source, &self.output, &self.logs);
        config.hierarchy = vec![HierarchyLevel::App, HierarchyLevel::Variant];
        config.concurrency = Some(2);
        config
    }

    pub fn engine(&self, config: EngineConfig, processor: &RecordingProcessor) -> Engine {
        EngineBuilder::new(config)
            .processor(Arc::new(processor.clone()))
            .build()
            .unwrap()
    }

    /// Build, run and close an engine
    pub async fn run(&self, config: EngineConfig, processor: &RecordingProcessor) -> WalkSummary {
        let engine = self.engine(config, processor);
        let summary = engine.run().await.unwrap();
        engine.close().unwrap();
        summary
    }

    /// Open the progress store read-write (no engine may be running)
    pub fn store(&self) -> ProgressStore {
        progress_store(&self.logs)
    }
}

pub fn progress_store(logs: &Path) -> ProgressStore {
    ProgressStore::open_at(logs, AGENT, CompactionPolicy::default(), false, false).unwrap()
}

pub fn zip_bytes(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, data) in members {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn zip_members(path: &Path) -> Vec<String> {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    names.sort();
    names
}

pub fn image_key(harness: &Harness, relative: &str) -> ProgressKey {
    ProgressKey::image(AGENT, &harness.canonical(relative))
}

#[tokio::test]
async fn test_app_with_variant_folder() {
    let h = Harness::new();
    h.write("App1/VariantA/img1.png", b"one");
    h.write("App1/VariantA/img2.png", b"two");

    let processor = RecordingProcessor::new();
    let summary = h.run(h.config(), &processor).await;

    assert_eq!(summary.processed, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.apps_completed, 1);
    assert_eq!(summary.variants_completed, 1);
    assert_eq!(processor.names(), vec!["img1.png", "img2.png"]);

    assert_eq!(fs::read(h.output.join("App1/VariantA/img1.png")).unwrap(), b"one");
    assert_eq!(fs::read(h.output.join("App1/VariantA/img2.png")).unwrap(), b"two");

    let store = h.store();
    assert!(store.is_completed(&ProgressKey::app(AGENT, "App1")));
    assert!(store.is_completed(&ProgressKey::variant(AGENT, "App1", "VariantA")));
    assert!(store.is_completed(&image_key(&h, "App1/VariantA/img1.png")));
    assert!(store.is_completed(&image_key(&h, "App1/VariantA/img2.png")));

    let statuses: Vec<RunStatus> = store.runs().iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![RunStatus::Started, RunStatus::Success]);
    let finished = store.runs().pop().unwrap();
    assert_eq!(finished.summary.unwrap().processed, 2);
}

#[tokio::test]
async fn test_archive_spliced_and_recompressed() {
    let h = Harness::new();
    let archive = h.write_zip("App2/bundle.zip", &[("img3.png", b"three")]);

    let processor = RecordingProcessor::new();
    let summary = h.run(h.config(), &processor).await;

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.archives_spliced, 1);
    assert_eq!(summary.archives_failed, 0);
    assert_eq!(processor.names(), vec!["img3.png"]);

    // Extraction and plain output are both cleaned up
    assert!(archive.exists());
    assert!(!h.source.join("App2/bundle").exists());
    assert!(!h.output.join("App2/bundle").exists());

    let rebuilt = h.output.join("App2/bundle.zip");
    assert_eq!(zip_members(&rebuilt), vec!["img3.png"]);
    let mut zip = ZipArchive::new(File::open(&rebuilt).unwrap()).unwrap();
    let mut content = Vec::new();
    std::io::copy(&mut zip.by_name("img3.png").unwrap(), &mut content).unwrap();
    assert_eq!(content, b"three");

    // Leaves directly under the App land in the default variant
    let store = h.store();
    assert!(store.is_completed(&ProgressKey::app(AGENT, "App2")));
    assert!(store.is_completed(&ProgressKey::variant(AGENT, "App2", "default")));
    assert!(store.is_completed(&image_key(&h, "App2/bundle/img3.png")));
}

#[tokio::test]
async fn test_archive_without_recompression_keeps_output_dir() {
    let h = Harness::new();
    h.write_zip("App2/bundle.zip", &[("v/img.png", b"x")]);

    let mut config = h.config();
    config.recompress_archives = false;
    let processor = RecordingProcessor::new();
    let summary = h.run(config, &processor).await;

    assert_eq!(summary.processed, 1);
    assert!(h.output.join("App2/bundle/v/img.png").exists());
    assert!(!h.output.join("App2/bundle.zip").exists());
    assert!(!h.source.join("App2/bundle").exists());
}

#[tokio::test]
async fn test_nested_archives() {
    let h = Harness::new();
    let inner = zip_bytes(&[("deep.png", b"deep")]);
    h.write_zip(
        "App1/outer.zip",
        &[("top.png", b"top"), ("inner.zip", inner.as_slice())],
    );

    let processor = RecordingProcessor::new();
    let summary = h.run(h.config(), &processor).await;

    assert_eq!(processor.names(), vec!["deep.png", "top.png"]);
    assert_eq!(summary.archives_spliced, 2);

    let outer = h.output.join("App1/outer.zip");
    assert_eq!(zip_members(&outer), vec!["inner.zip", "top.png"]);
    assert!(!h.output.join("App1/outer").exists());
    assert!(!h.source.join("App1/outer").exists());
}

#[tokio::test]
async fn test_completed_app_is_skipped_wholesale() {
    let h = Harness::new();
    h.write("App1/VariantA/img1.png", b"one");

    {
        let store = h.store();
        let app = ProgressKey::app(AGENT, "App1");
        store.mark_started(&app).unwrap();
        store.mark_completed(&app).unwrap();
    }

    let processor = RecordingProcessor::new();
    let summary = h.run(h.config(), &processor).await;

    assert_eq!(processor.call_count(), 0);
    assert_eq!(summary.apps_skipped, 1);
    assert_eq!(summary.processed, 0);

    let store = h.store();
    assert_eq!(store.counts(Scope::Variant), StatusCounts::default());
    assert_eq!(store.counts(Scope::Image), StatusCounts::default());
    assert!(!h.output.join("App1").exists());
}

#[tokio::test]
async fn test_second_run_is_idempotent() {
    let h = Harness::new();
    h.write("App1/VariantA/img1.png", b"one");
    h.write("App1/loose.png", b"loose");
    h.write_zip("App2/bundle.zip", &[("img3.png", b"three")]);

    let first = RecordingProcessor::new();
    let summary = h.run(h.config(), &first).await;
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.apps_completed, 2);

    let before = h.store().record(&image_key(&h, "App1/VariantA/img1.png")).unwrap();

    let second = RecordingProcessor::new();
    let engine = h.engine(h.config(), &second);
    let summary = engine.run().await.unwrap();
    assert_eq!(second.call_count(), 0);
    assert_eq!(summary.apps_skipped, 2);
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.archives_spliced, 0);

    // Completed keys cost no writes: the progress streams stay empty
    for stream in ["apps", "variants", "images"] {
        let path = h.logs.join("index").join(format!("{}.jsonl", stream));
        assert_eq!(fs::metadata(&path).unwrap().len(), 0, "{} grew", stream);
    }
    engine.close().unwrap();
    let after = h.store().record(&image_key(&h, "App1/VariantA/img1.png")).unwrap();
    assert_eq!(after, before);

    // Force reprocesses everything once more
    let mut config = h.config();
    config.force_reprocess = true;
    let forced = RecordingProcessor::new();
    let summary = h.run(config, &forced).await;
    assert_eq!(forced.names(), vec!["img1.png", "img3.png", "loose.png"]);
    assert_eq!(summary.processed, 3);
}

#[tokio::test]
async fn test_reserved_and_foreign_entries_are_ignored() {
    let h = Harness::new();
    h.write("App1/VariantA/img1.PNG", b"upper");
    h.write("App1/VariantA/notes.txt", b"text");
    h.write("App1/VariantA/._img1.PNG", b"fork");
    h.write("App1/VariantA/.DS_Store", b"junk");
    h.write("App1/__MACOSX/VariantA/img1.png", b"junk");
    h.write("App1/VariantA/skip-me.png", b"pattern");

    let mut config = h.config();
    config.ignore_patterns = vec!["skip-*".to_string()];
    let processor = RecordingProcessor::new();
    let summary = h.run(config, &processor).await;

    assert_eq!(processor.names(), vec!["img1.PNG"]);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.variants_completed, 1);
    assert!(!h.output.join("App1/__MACOSX").exists());
}

#[tokio::test]
async fn test_always_policy_completes_despite_failures() {
    let h = Harness::new();
    h.write("App1/VariantA/good.png", b"good");
    h.write("App1/VariantA/bad.png", b"bad");

    let processor = RecordingProcessor::failing_on("bad");
    let summary = h.run(h.config(), &processor).await;

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.apps_completed, 1);

    let store = h.store();
    assert!(store.is_completed(&ProgressKey::app(AGENT, "App1")));
    let bad = store
        .record(&image_key(&h, "App1/VariantA/bad.png"))
        .unwrap();
    assert_eq!(bad.status, ProgressStatus::Failed);
    assert!(bad.error.unwrap().contains("rejected"));

    let errors = store.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].context.action, "process");
    assert_eq!(errors[0].context.app.as_deref(), Some("App1"));
    assert_eq!(errors[0].context.variant.as_deref(), Some("VariantA"));
    assert!(errors[0].context.path.as_ref().unwrap().ends_with("bad.png"));
}

#[tokio::test]
async fn test_require_success_retries_failed_scopes() {
    let h = Harness::new();
    h.write("App1/VariantA/good.png", b"good");
    h.write("App1/VariantA/bad.png", b"bad");

    let mut config = h.config();
    config.completion_policy = CompletionPolicy::RequireSuccess;

    let failing = RecordingProcessor::failing_on("bad");
    let summary = h.run(config.clone(), &failing).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.apps_completed, 0);
    assert_eq!(summary.variants_completed, 0);
    {
        let store = h.store();
        assert_eq!(store.status(&ProgressKey::app(AGENT, "App1")), Some(ProgressStatus::Failed));
        assert_eq!(
            store.status(&ProgressKey::variant(AGENT, "App1", "VariantA")),
            Some(ProgressStatus::Failed)
        );
    }

    // Only the failed item is retried
    let fixed = RecordingProcessor::new();
    let summary = h.run(config, &fixed).await;
    assert_eq!(fixed.names(), vec!["bad.png"]);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.apps_completed, 1);
    assert!(h.store().is_completed(&ProgressKey::app(AGENT, "App1")));
}

#[tokio::test]
async fn test_invalid_archive_is_recorded_and_skipped() {
    let h = Harness::new();
    h.write("App1/broken.zip", b"definitely not a zip");
    h.write("App1/empty.zip", b"");
    h.write("App1/VariantA/img1.png", b"one");

    let processor = RecordingProcessor::new();
    let summary = h.run(h.config(), &processor).await;

    assert_eq!(summary.archives_failed, 2);
    assert_eq!(summary.processed, 1);
    assert!(!h.source.join("App1/broken").exists());
    assert!(!h.source.join("App1/empty").exists());

    let store = h.store();
    let unzip: Vec<_> = store
        .errors()
        .into_iter()
        .filter(|e| e.context.action == "unzip")
        .collect();
    assert_eq!(unzip.len(), 2);
    assert!(unzip.iter().all(|e| e.context.app.as_deref() == Some("App1")));
    assert!(unzip.iter().any(|e| e.message.contains("EMPTY")));
    assert!(unzip.iter().any(|e| e.message.contains("BAD_SIGNATURE")));
    // Always policy: the App still completes
    assert!(store.is_completed(&ProgressKey::app(AGENT, "App1")));
}

#[tokio::test]
async fn test_existing_sibling_directory_skips_archive() {
    let h = Harness::new();
    h.write_zip("App1/bundle.zip", &[("zipped.png", b"z")]);
    h.write("App1/bundle/loose.png", b"l");

    let processor = RecordingProcessor::new();
    let summary = h.run(h.config(), &processor).await;

    assert_eq!(summary.archives_skipped, 1);
    assert_eq!(summary.archives_spliced, 0);
    // The directory is walked as a variant instead
    assert_eq!(processor.names(), vec!["loose.png"]);
    assert!(h.source.join("App1/bundle/loose.png").exists());
}

#[tokio::test]
async fn test_timestamped_output_directory() {
    let h = Harness::new();
    h.write("App1/VariantA/img1.png", b"one");

    let mut config = h.config();
    config.timestamped_output = true;
    let processor = RecordingProcessor::new();
    let engine = h.engine(config, &processor);
    let root = engine.output_root().to_path_buf();
    engine.run().await.unwrap();
    engine.close().unwrap();

    assert_eq!(root.parent().unwrap(), h.output.as_path());
    assert!(root.file_name().unwrap().to_string_lossy().ends_with('Z'));
    assert!(root.join("App1/VariantA/img1.png").exists());
}
