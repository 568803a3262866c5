//! Live tests against the DashScope API.
//!
//! These make real (billed) calls and are ignored by default.
//! Run with: DASHSCOPE_API_KEY=your_key cargo test --test dashscope_live -- --ignored

use std::sync::Arc;
use tempfile::TempDir;

use image_forge::backend::DashScopeProcessor;
use image_forge::config::{BackendSettings, GenerationSettings};
use image_forge::refine::{PromptRefiner, QwenRefiner, RefineRequest};
use image_forge::scheduler::{
    JobContext, RefiningTaskGenerator, ServiceKind, TaskGenerator, TaskOutcome, TaskProcessor,
};

fn settings(output_dir: &std::path::Path) -> BackendSettings {
    let api_key = std::env::var("DASHSCOPE_API_KEY")
        .expect("DASHSCOPE_API_KEY environment variable must be set for live tests");
    BackendSettings {
        api_key: Some(api_key),
        output_dir: output_dir.to_path_buf(),
        ..BackendSettings::default()
    }
}

#[tokio::test]
#[ignore]
async fn test_refine_prompt() {
    let dir = TempDir::new().unwrap();
    let refiner = QwenRefiner::from_settings(&settings(dir.path())).unwrap();

    let refined = refiner
        .refine(&RefineRequest::new("a lighthouse on a cliff", "scenery").with_style("watercolor"))
        .await;
    assert!(refined.is_ok(), "Refine failed: {:?}", refined.err());

    let refined = refined.unwrap();
    assert!(!refined.positive.trim().is_empty());
}

#[tokio::test]
#[ignore]
async fn test_generate_one_z_image() {
    let dir = TempDir::new().unwrap();
    let backend = settings(dir.path());

    let refiner = Arc::new(QwenRefiner::from_settings(&backend).unwrap());
    let generator = RefiningTaskGenerator::new(refiner, GenerationSettings::default())
        .with_backend_defaults(&backend);
    let processor = DashScopeProcessor::new(backend).unwrap();

    let ctx = JobContext::new("a red fox in snow", ServiceKind::ZImage, 1)
        .with_category("animals")
        .with_size("1024*1024");
    let tasks = generator.generate(&ctx).await.unwrap();
    assert_eq!(tasks.len(), 1);

    let outcome = processor.process(&tasks[0]).await;
    assert!(outcome.is_ok(), "Generation failed: {:?}", outcome.err());

    match outcome.unwrap() {
        TaskOutcome::Success { saved_path, .. } => {
            let path = saved_path.expect("artifact saved locally");
            assert!(path.starts_with(dir.path()));
            assert!(std::fs::metadata(&path).unwrap().len() > 0);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}
