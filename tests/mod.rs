//! Main test module for assetwalk
//!
//! This module includes all test suites:
//! - Integration tests for full batch scenarios
//! - Chaos tests for crashes, torn logs, locks and signals
//! - Property-based tests for journal and ordering invariants

pub mod integration;
pub mod chaos;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use crate::integration::{Harness, RecordingProcessor, AGENT};
    use ::assetwalk::*;
    use std::fs;

    #[tokio::test]
    async fn test_empty_source_tree() {
        let h = Harness::new();
        let processor = RecordingProcessor::new();
        let summary = h.run(h.config(), &processor).await;

        assert_eq!(summary, WalkSummary::default());
        let store = h.store();
        let statuses: Vec<RunStatus> = store.runs().iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![RunStatus::Started, RunStatus::Success]);
    }

    #[tokio::test]
    async fn test_empty_app_and_variant_complete() {
        let h = Harness::new();
        fs::create_dir_all(h.source.join("App1/VariantA")).unwrap();

        let processor = RecordingProcessor::new();
        let summary = h.run(h.config(), &processor).await;

        assert_eq!(summary.apps_completed, 1);
        assert_eq!(summary.variants_completed, 1);
        assert_eq!(processor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_loose_leaves_at_root_have_no_scope() {
        let h = Harness::new();
        h.write("stray.png", b"x");

        let processor = RecordingProcessor::new();
        let summary = h.run(h.config(), &processor).await;

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.apps_completed, 0);
        let key = ProgressKey::image(AGENT, &h.canonical("stray.png"));
        assert!(key.as_str().starts_with(&format!("{}:/", AGENT)));
        assert!(h.store().is_completed(&key));
        assert!(h.output.join("stray.png").exists());
    }

    #[tokio::test]
    async fn test_directories_below_schema_are_plain_containers() {
        let h = Harness::new();
        h.write("App1/VariantA/nested/deeper/img.png", b"x");

        let processor = RecordingProcessor::new();
        let summary = h.run(h.config(), &processor).await;

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.variants_completed, 1);
        assert!(h.output.join("App1/VariantA/nested/deeper/img.png").exists());
    }

    #[tokio::test]
    async fn test_natural_processing_order() {
        let h = Harness::new();
        for name in ["img10.png", "img2.png", "img1.png"] {
            h.write(&format!("App1/V/{}", name), b"x");
        }

        let mut config = h.config();
        config.concurrency = Some(1);
        let processor = RecordingProcessor::new();
        h.run(config, &processor).await;

        let order: Vec<String> = processor
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(order, vec!["img1.png", "img2.png", "img10.png"]);
    }

    #[tokio::test]
    async fn test_default_variant_disabled() {
        let h = Harness::new();
        h.write("App1/loose.png", b"x");

        let mut config = h.config();
        config.default_variant = None;
        let processor = RecordingProcessor::new();
        let summary = h.run(config, &processor).await;

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.variants_completed, 0);
        let store = h.store();
        assert_eq!(store.counts(Scope::Variant), StatusCounts::default());
        assert!(store.is_completed(&ProgressKey::image(AGENT, &h.canonical("App1/loose.png"))));
    }

    #[test]
    fn test_output_inside_source_is_rejected() {
        let h = Harness::new();
        let mut config = h.config();
        config.output_dir = h.source.join("out");

        let err = EngineBuilder::new(config).build().unwrap_err();
        assert!(matches!(err, WalkError::Config(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_missing_source_is_rejected() {
        let h = Harness::new();
        let mut config = h.config();
        config.source_dir = h.temp.path().join("nope");

        let err = EngineBuilder::new(config).build().unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(!h.logs.join("LOCK").exists());
    }

    #[test]
    fn test_bad_ignore_pattern_is_rejected() {
        let h = Harness::new();
        let mut config = h.config();
        config.ignore_patterns = vec!["[".to_string()];

        let err = EngineBuilder::new(config).build().unwrap_err();
        assert!(matches!(err, WalkError::Pattern(_)));
    }

    #[tokio::test]
    async fn test_agents_share_logs_but_not_progress() {
        let h = Harness::new();
        h.write("App1/V/img.png", b"x");

        let crop = RecordingProcessor::new();
        h.run(h.config(), &crop).await;

        let mut config = h.config();
        config.agent = "Agent2Ocr".to_string();
        let ocr = RecordingProcessor::new();
        let summary = h.run(config, &ocr).await;

        assert_eq!(ocr.call_count(), 1);
        assert_eq!(summary.apps_completed, 1);
        assert!(h.store().is_completed(&ProgressKey::app("Agent2Ocr", "App1")));
    }
}
