//! The standard task generator: one refinement call per job, then a fresh
//! draw of sampling parameters for every task.

use async_trait::async_trait;
use rand::{RngExt, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::job::{JobContext, ServiceKind};
use super::task::{GenerationError, RefinedPrompt, SamplingParams, Task, TaskGenerator};
use crate::config::{BackendSettings, GenerationSettings};
use crate::error::RefineError;
use crate::refine::{PromptRefiner, RefineRequest};

/// Uniform draw from `[lo, hi]`. An empty range yields `lo`; a non-finite
/// bound yields the other one, or 0.0 when neither is finite.
fn draw(rng: &mut ChaCha8Rng, [lo, hi]: [f64; 2]) -> f64 {
    match (lo.is_finite(), hi.is_finite()) {
        (true, true) if lo < hi && (hi - lo).is_finite() => rng.random_range(lo..=hi),
        (true, _) => lo,
        (false, true) => hi,
        (false, false) => 0.0,
    }
}

/// [`TaskGenerator`] backed by a [`PromptRefiner`].
pub struct RefiningTaskGenerator {
    refiner: Arc<dyn PromptRefiner>,
    settings: GenerationSettings,
    default_models: HashMap<ServiceKind, String>,
    rng: Mutex<ChaCha8Rng>,
}

impl RefiningTaskGenerator {
    /// Creates a generator. A configured `sampling_seed` makes every draw
    /// reproducible; otherwise the RNG is seeded from the OS.
    pub fn new(refiner: Arc<dyn PromptRefiner>, settings: GenerationSettings) -> Self {
        let rng = match settings.sampling_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        };
        Self {
            refiner,
            settings,
            default_models: HashMap::new(),
            rng: Mutex::new(rng),
        }
    }

    /// Model used for `service` when the request does not name one.
    pub fn with_default_model(mut self, service: ServiceKind, model: impl Into<String>) -> Self {
        self.default_models.insert(service, model.into());
        self
    }

    /// Registers the backend's configured model names as defaults.
    pub fn with_backend_defaults(self, backend: &BackendSettings) -> Self {
        self.with_default_model(ServiceKind::Wan, backend.wan_model.clone())
            .with_default_model(ServiceKind::ZImage, backend.z_image_model.clone())
            .with_default_model(ServiceKind::Text, backend.refine_model.clone())
    }

    fn request_for(&self, ctx: &JobContext) -> RefineRequest {
        let negative = ctx
            .negative_prompt
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.settings.default_negative_prompt);
        let style = ctx
            .style
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.settings.default_style);

        RefineRequest::new(ctx.prompt.trim(), ctx.category.clone())
            .with_style(style)
            .with_negative(negative)
            .with_role(self.settings.role.clone())
    }

    fn model_for(&self, ctx: &JobContext) -> String {
        if !ctx.model.trim().is_empty() {
            return ctx.model.trim().to_string();
        }
        self.default_models
            .get(&ctx.service)
            .cloned()
            .unwrap_or_default()
    }

    fn sample(&self) -> SamplingParams {
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        SamplingParams {
            seed: rng.random_range(0..=u32::MAX),
            temperature: draw(&mut rng, self.settings.temperature_range),
            top_p: draw(&mut rng, self.settings.top_p_range),
        }
    }

    /// Applies the fallback policy to a failed refinement.
    fn recover(
        &self,
        err: RefineError,
        fallback: RefinedPrompt,
    ) -> Result<RefinedPrompt, GenerationError> {
        if self.settings.refine_fallback {
            warn!(error = %err, "Prompt refinement failed, using unrefined prompt");
            Ok(fallback)
        } else {
            Err(err.into())
        }
    }
}

#[async_trait]
impl TaskGenerator for RefiningTaskGenerator {
    async fn generate(&self, ctx: &JobContext) -> Result<Vec<Task>, GenerationError> {
        if ctx.prompt.trim().is_empty() {
            return Err(GenerationError::InvalidRequest(
                "prompt must not be empty".to_string(),
            ));
        }

        let request = self.request_for(ctx);
        let refined = match self.refiner.refine(&request).await {
            Ok(refined) => refined,
            Err(e) => {
                let fallback = RefinedPrompt::new(request.prompt.clone(), request.negative.clone());
                self.recover(e, fallback)?
            }
        };

        let model = self.model_for(ctx);
        let tasks: Vec<Task> = (0..ctx.count)
            .map(|index| Task {
                index,
                prompt: refined.clone(),
                sampling: self.sample(),
                service: ctx.service,
                model: model.clone(),
                category: ctx.category.clone(),
                size: ctx.size.clone(),
                resolution: ctx.resolution.clone(),
                inherited: false,
                delta_ratio: None,
            })
            .collect();

        debug!(tasks = tasks.len(), model = %model, "Generated tasks");
        Ok(tasks)
    }

    async fn chain(
        &self,
        ctx: &JobContext,
        previous: &RefinedPrompt,
        ratio: f64,
    ) -> Result<RefinedPrompt, GenerationError> {
        let request = self.request_for(ctx);
        match self
            .refiner
            .refine_delta(&previous.positive, &request, ratio)
            .await
        {
            Ok(refined) => Ok(refined),
            Err(e) => self.recover(e, previous.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        refines: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl PromptRefiner for Echo {
        async fn refine(&self, request: &RefineRequest) -> Result<RefinedPrompt, RefineError> {
            self.refines.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RefineError::MissingApiKey);
            }
            Ok(RefinedPrompt::new(
                format!("refined {} [{}]", request.prompt, request.style),
                request.negative.clone(),
            ))
        }

        async fn refine_delta(
            &self,
            base_positive: &str,
            _request: &RefineRequest,
            ratio: f64,
        ) -> Result<RefinedPrompt, RefineError> {
            Ok(RefinedPrompt::new(format!("{} +{}", base_positive, ratio), "n"))
        }
    }

    fn settings(seed: u64) -> GenerationSettings {
        GenerationSettings {
            temperature_range: [0.5, 1.5],
            top_p_range: [0.7, 0.9],
            default_style: "photo".to_string(),
            sampling_seed: Some(seed),
            ..GenerationSettings::default()
        }
    }

    fn echo(fail: bool) -> Arc<Echo> {
        Arc::new(Echo {
            refines: AtomicUsize::new(0),
            fail,
        })
    }

    #[tokio::test]
    async fn test_generate_refines_once_and_samples_in_range() {
        let refiner = echo(false);
        let generator = RefiningTaskGenerator::new(refiner.clone(), settings(7))
            .with_default_model(ServiceKind::Wan, "wan2.6-t2i");
        let ctx = JobContext::new("a cat", ServiceKind::Wan, 4);

        let tasks = generator.generate(&ctx).await.unwrap();
        assert_eq!(tasks.len(), 4);
        assert_eq!(refiner.refines.load(Ordering::SeqCst), 1);
        for (i, task) in tasks.iter().enumerate() {
            assert_eq!(task.index, i);
            assert_eq!(task.prompt.positive, "refined a cat [photo]");
            assert_eq!(task.model, "wan2.6-t2i");
            assert!((0.5..=1.5).contains(&task.sampling.temperature));
            assert!((0.7..=0.9).contains(&task.sampling.top_p));
        }
    }

    #[tokio::test]
    async fn test_fixed_seed_is_reproducible() {
        let ctx = JobContext::new("a cat", ServiceKind::ZImage, 3);
        let a = RefiningTaskGenerator::new(echo(false), settings(42))
            .generate(&ctx)
            .await
            .unwrap();
        let b = RefiningTaskGenerator::new(echo(false), settings(42))
            .generate(&ctx)
            .await
            .unwrap();
        let seeds = |tasks: &[Task]| tasks.iter().map(|t| t.sampling).collect::<Vec<_>>();
        assert_eq!(seeds(&a), seeds(&b));
    }

    #[tokio::test]
    async fn test_refine_failure_policy() {
        let ctx = JobContext::new("a cat", ServiceKind::Wan, 1).with_negative_prompt("ugly");

        let lenient = RefiningTaskGenerator::new(echo(true), settings(1));
        let tasks = lenient.generate(&ctx).await.unwrap();
        assert_eq!(tasks[0].prompt.positive, "a cat");
        assert_eq!(tasks[0].prompt.negative, "ugly");

        let strict = RefiningTaskGenerator::new(
            echo(true),
            GenerationSettings {
                refine_fallback: false,
                ..settings(1)
            },
        );
        assert!(matches!(
            strict.generate(&ctx).await,
            Err(GenerationError::Refine(RefineError::MissingApiKey))
        ));
    }

    #[tokio::test]
    async fn test_chain_uses_previous_positive() {
        let generator = RefiningTaskGenerator::new(echo(false), settings(1));
        let ctx = JobContext::new("a cat", ServiceKind::Wan, 2);
        let next = generator
            .chain(&ctx, &RefinedPrompt::new("base", "n"), 0.1)
            .await
            .unwrap();
        assert_eq!(next.positive, "base +0.1");
    }

    #[tokio::test]
    async fn test_blank_prompt_is_rejected() {
        let generator = RefiningTaskGenerator::new(echo(false), settings(1));
        let ctx = JobContext::new("   ", ServiceKind::Wan, 2);
        assert!(matches!(
            generator.generate(&ctx).await,
            Err(GenerationError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_draw_tolerates_degenerate_ranges() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        assert_eq!(draw(&mut rng, [0.9, 0.3]), 0.9);
        assert_eq!(draw(&mut rng, [0.5, 0.5]), 0.5);
        assert_eq!(draw(&mut rng, [f64::NAN, 0.8]), 0.8);
        assert_eq!(draw(&mut rng, [0.2, f64::NAN]), 0.2);
        assert_eq!(draw(&mut rng, [0.2, f64::INFINITY]), 0.2);
        assert_eq!(draw(&mut rng, [f64::NAN, f64::NAN]), 0.0);
        assert_eq!(draw(&mut rng, [-f64::MAX, f64::MAX]), -f64::MAX);

        let v = draw(&mut rng, [0.7, 0.95]);
        assert!((0.7..=0.95).contains(&v));
    }
}
