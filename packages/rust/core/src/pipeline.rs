//! End-to-end brief run: resolve → search → assemble → generate → validate → deliver.
//!
//! Stages run strictly in order and stop at the first failure. Whatever
//! happens, the run produces exactly one [`RunOutcome`], which is handed to
//! the [`RunLogger`] before [`BriefEngine::run`] returns.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tracing::{error, info, instrument};

use briefengine_delivery::{Delivery, DeliveryProvider, Dispatcher, TelegramBot};
use briefengine_markup::MarkupSchema;
use briefengine_prompt::PromptVars;
use briefengine_registry::ModuleRegistry;
use briefengine_search::{AggregateOptions, BraveSearch, SearchProvider, default_freshness};
use briefengine_shared::{
    AppConfig, BriefError, Credentials, GenerationOptions, Result, RetryPolicy, RunId, RunOutcome, RunRequest,
    Stage,
};

use crate::generator::{AnthropicProvider, BriefGenerator, ModelProvider};
use crate::logger::RunLogger;

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a stage.
    fn stage(&self, stage: Stage);
    /// Free-form detail within the current stage.
    fn detail(&self, message: &str);
    /// Called once the outcome has been recorded.
    fn done(&self, outcome: &RunOutcome);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage(&self, _stage: Stage) {}
    fn detail(&self, _message: &str) {}
    fn done(&self, _outcome: &RunOutcome) {}
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The three external collaborators a run needs.
pub struct Providers {
    pub search: Arc<dyn SearchProvider>,
    pub model: Arc<dyn ModelProvider>,
    pub delivery: Arc<dyn DeliveryProvider>,
}

impl Providers {
    /// Brave search, Anthropic model, and Telegram delivery built from config.
    pub fn from_config(config: &AppConfig, credentials: &Credentials) -> Result<Self> {
        Ok(Self {
            search: Arc::new(BraveSearch::new(&config.search, credentials.search_api_key.clone())?),
            model: Arc::new(AnthropicProvider::new(&config.model, credentials.model_api_key.clone())?),
            delivery: Arc::new(TelegramBot::new(&config.delivery, credentials.bot_token.clone())?),
        })
    }
}

/// Limits and defaults applied to every run.
#[derive(Debug, Clone)]
struct EngineSettings {
    max_evidence: usize,
    max_prompt_chars: usize,
    search_concurrency: usize,
    search_timeout: Duration,
    search_min_interval: Duration,
    results_per_query: u32,
    default_model: String,
    default_max_tokens: u32,
}

impl From<&AppConfig> for EngineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_evidence: config.engine.max_evidence,
            max_prompt_chars: config.engine.max_prompt_chars,
            search_concurrency: config.engine.search_concurrency,
            search_timeout: Duration::from_secs(config.search.timeout_secs),
            search_min_interval: Duration::from_millis(config.search.min_interval_ms),
            results_per_query: config.search.results_per_query,
            default_model: config.model.default_model.clone(),
            default_max_tokens: config.model.default_max_tokens,
        }
    }
}

/// Runs briefs against a registry loaded once at startup.
pub struct BriefEngine {
    registry: Arc<ModuleRegistry>,
    search: Arc<dyn SearchProvider>,
    generator: BriefGenerator,
    dispatcher: Dispatcher,
    logger: Arc<dyn RunLogger>,
    settings: EngineSettings,
}

/// Where a run got to, and the brief if one was generated.
struct RunTrace {
    stage: Stage,
    output: Option<String>,
}

impl RunTrace {
    fn enter(&mut self, stage: Stage, progress: &dyn ProgressReporter) {
        self.stage = stage;
        progress.stage(stage);
    }
}

impl BriefEngine {
    pub fn new(
        config: &AppConfig,
        registry: Arc<ModuleRegistry>,
        providers: Providers,
        logger: Arc<dyn RunLogger>,
    ) -> Self {
        let policy = RetryPolicy::from(&config.retry);
        Self {
            registry,
            search: providers.search,
            generator: BriefGenerator::new(
                providers.model,
                policy.clone(),
                Duration::from_secs(config.model.timeout_secs),
            ),
            dispatcher: Dispatcher::new(
                providers.delivery,
                policy,
                Duration::from_secs(config.delivery.timeout_secs),
            ),
            logger,
            settings: EngineSettings::from(config),
        }
    }

    /// Execute one run request. Never fails: the result is the recorded outcome.
    #[instrument(skip_all, fields(module = %request.module, run_type = %request.run_type))]
    pub async fn run(&self, request: &RunRequest, progress: &dyn ProgressReporter) -> RunOutcome {
        let id = RunId::new();
        let started_at = Utc::now();
        let mut trace = RunTrace {
            stage: Stage::ConfigResolver,
            output: None,
        };

        info!(run_id = %id, "starting brief run");
        let result = self.execute(request, progress, &mut trace).await;
        let finished_at = Utc::now();

        let outcome = match result {
            Ok(delivery) => RunOutcome {
                id,
                module: request.module.clone(),
                run_type: request.run_type.to_string(),
                started_at,
                finished_at,
                stage: trace.stage,
                success: true,
                error_kind: None,
                error_detail: None,
                delivery_id: Some(delivery.message_id),
                output: trace.output,
            },
            Err(e) => {
                let stage = e.stage().unwrap_or(trace.stage);
                error!(%stage, kind = e.kind(), error = %e, "brief run failed");
                RunOutcome {
                    id,
                    module: request.module.clone(),
                    run_type: request.run_type.to_string(),
                    started_at,
                    finished_at,
                    stage,
                    success: false,
                    error_kind: Some(e.kind().to_string()),
                    error_detail: Some(e.to_string()),
                    delivery_id: None,
                    output: trace.output,
                }
            }
        };

        self.logger.record(&outcome).await;
        progress.done(&outcome);
        outcome
    }

    async fn execute(
        &self,
        request: &RunRequest,
        progress: &dyn ProgressReporter,
        trace: &mut RunTrace,
    ) -> Result<Delivery> {
        // --- Config Resolver ---
        trace.enter(Stage::ConfigResolver, progress);
        let resolved = self.registry.resolve(&request.module, &request.run_type)?;
        let module = &resolved.module;
        let variant = &resolved.variant;

        // --- Search Aggregator ---
        trace.enter(Stage::SearchAggregator, progress);
        let options = AggregateOptions {
            concurrency: self.settings.search_concurrency,
            timeout: self.settings.search_timeout,
            results_per_query: self.settings.results_per_query,
            freshness: variant
                .freshness
                .clone()
                .or_else(|| default_freshness(&request.run_type)),
            max_evidence: self.settings.max_evidence,
            min_interval: self.settings.search_min_interval,
        };
        let evidence = briefengine_search::aggregate(Arc::clone(&self.search), &variant.queries, &options).await?;
        progress.detail(&format!(
            "{} evidence items from {}/{} queries",
            evidence.items.len(),
            evidence.queries_succeeded,
            variant.queries.len()
        ));

        // --- Prompt Assembler ---
        trace.enter(Stage::PromptAssembler, progress);
        let vars = PromptVars {
            date: request.date.unwrap_or_else(|| Local::now().date_naive()),
            run_type: &request.run_type,
            module: &module.name,
        };
        let prompt = briefengine_prompt::assemble(
            &variant.prompt_template,
            &vars,
            &evidence.items,
            self.settings.max_prompt_chars,
        )?;

        // --- Brief Generator ---
        trace.enter(Stage::BriefGenerator, progress);
        let generation_options = GenerationOptions {
            model: module
                .model
                .clone()
                .unwrap_or_else(|| self.settings.default_model.clone()),
            max_tokens: module.max_tokens.unwrap_or(self.settings.default_max_tokens),
        };
        let generation = self.generator.generate(&prompt.text, &generation_options).await?;
        trace.output = Some(generation.text.clone());

        // --- Output Validator ---
        trace.enter(Stage::OutputValidator, progress);
        let schema = MarkupSchema::telegram_html(variant.sections.clone());
        briefengine_markup::validate(&generation.text, &schema)?;

        // --- Delivery Dispatcher ---
        trace.enter(Stage::DeliveryDispatcher, progress);
        self.dispatcher
            .dispatch(module, &module.destination, &generation.text)
            .await
    }
}

/// Outcome for a request that failed before the pipeline could start, e.g.
/// a missing credential or an unknown module. Errors without a stage of
/// their own are attributed to the Config Resolver.
pub fn setup_failure(request: &RunRequest, started_at: DateTime<Utc>, error: &BriefError) -> RunOutcome {
    RunOutcome {
        id: RunId::new(),
        module: request.module.clone(),
        run_type: request.run_type.to_string(),
        started_at,
        finished_at: Utc::now(),
        stage: error.stage().unwrap_or(Stage::ConfigResolver),
        success: false,
        error_kind: Some(error.kind().to_string()),
        error_detail: Some(error.to_string()),
        delivery_id: None,
        output: None,
    }
}

/// Exit-facing summary of a failed outcome: `stage=<Stage> kind=<Kind>: <detail>`.
pub fn failure_summary(outcome: &RunOutcome) -> Option<String> {
    if outcome.success {
        return None;
    }
    Some(format!(
        "stage={} kind={}: {}",
        outcome.stage,
        outcome.error_kind.as_deref().unwrap_or("Unknown"),
        outcome.error_detail.as_deref().unwrap_or("")
    ))
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::NaiveDate;

    use briefengine_search::{RawResult, SearchQuery};
    use briefengine_shared::{Destination, ModuleDefinition, ProviderError, RunType, SectionRule, VariantDefinition};

    use super::*;

    // -- Fakes ---------------------------------------------------------------

    #[derive(Default)]
    struct FakeSearch {
        results: HashMap<String, Vec<RawResult>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SearchProvider for FakeSearch {
        fn name(&self) -> &str {
            "fake-search"
        }
        async fn search(&self, query: &SearchQuery) -> std::result::Result<Vec<RawResult>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results
                .get(&query.text)
                .cloned()
                .ok_or_else(|| ProviderError::transient("HTTP 503: unavailable"))
        }
    }

    struct FakeModel {
        reply: std::result::Result<String, ProviderError>,
        calls: AtomicU32,
        prompts: Mutex<Vec<String>>,
    }

    impl FakeModel {
        fn replying(text: &str) -> Self {
            Self {
                reply: Ok(text.to_string()),
                calls: AtomicU32::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                reply: Err(ProviderError::transient("HTTP 529: overloaded")),
                calls: AtomicU32::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ModelProvider for FakeModel {
        fn name(&self) -> &str {
            "fake-model"
        }
        async fn generate(
            &self,
            prompt: &str,
            _options: &GenerationOptions,
        ) -> std::result::Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.reply.clone()
        }
    }

    struct FakeDelivery {
        fail: bool,
        calls: AtomicU32,
        sent: Mutex<Vec<(Destination, String)>>,
    }

    impl FakeDelivery {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                calls: AtomicU32::new(0),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DeliveryProvider for FakeDelivery {
        fn name(&self) -> &str {
            "fake-delivery"
        }
        async fn send(&self, destination: &Destination, text: &str) -> std::result::Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::transient("HTTP 429: Too Many Requests"));
            }
            self.sent.lock().unwrap().push((destination.clone(), text.to_string()));
            Ok("981".into())
        }
    }

    #[derive(Default)]
    struct RecordingLogger {
        outcomes: Mutex<Vec<RunOutcome>>,
    }

    #[async_trait]
    impl RunLogger for RecordingLogger {
        async fn record(&self, outcome: &RunOutcome) {
            self.outcomes.lock().unwrap().push(outcome.clone());
        }
    }

    // -- Fixtures ------------------------------------------------------------

    const QUERIES: [&str; 3] = ["stone company news", "stone competitors", "stone deals"];

    fn stone_news() -> ModuleDefinition {
        let mut variants = BTreeMap::new();
        variants.insert(
            RunType::daily(),
            VariantDefinition {
                prompt_path: "prompts/stone-news-daily.md".into(),
                prompt_template: "Daily brief for {module}, {date}.\n\n{evidence}".into(),
                queries: QUERIES.iter().map(|q| q.to_string()).collect(),
                freshness: None,
                sections: vec![
                    SectionRule {
                        title: "Top Stories".into(),
                        required: true,
                    },
                    SectionRule {
                        title: "Competitors".into(),
                        required: false,
                    },
                ],
            },
        );
        ModuleDefinition {
            name: "stone-news".into(),
            destination: Destination {
                chat_id: "-1001234".into(),
                thread_id: Some(42),
            },
            model: None,
            max_tokens: None,
            variants,
        }
    }

    fn hit(title: &str, url: &str) -> RawResult {
        RawResult {
            title: title.into(),
            url: url.into(),
            source: Some("Example".into()),
            snippet: format!("{title}."),
            ..RawResult::default()
        }
    }

    /// Three queries, five results, two of which share one URL.
    fn five_results() -> FakeSearch {
        let mut results = HashMap::new();
        results.insert(
            QUERIES[0].to_string(),
            vec![hit("Chair", "https://news.example.com/1"), hit("Revenue", "https://news.example.com/2")],
        );
        results.insert(
            QUERIES[1].to_string(),
            vec![hit("Rival", "https://news.example.com/3"), hit("Revenue again", "https://news.example.com/2")],
        );
        results.insert(QUERIES[2].to_string(), vec![hit("Quarry", "https://news.example.com/4")]);
        FakeSearch {
            results,
            calls: AtomicU32::new(0),
        }
    }

    const GOOD_BRIEF: &str = "\
<b>Top Stories</b>
• Stone names a new chair <a href=\"https://news.example.com/1\">Example</a>
• Revenue up 4% <a href=\"https://news.example.com/2\">Example</a>
• Stone buys a quarry <a href=\"https://news.example.com/4\">Example</a>

<b>Competitors</b>
• Rival opens a plant <a href=\"https://news.example.com/3\">Example</a>
";

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.retry.initial_backoff_ms = 0;
        config.retry.max_backoff_ms = 0;
        config.search.min_interval_ms = 0;
        config
    }

    struct Harness {
        engine: BriefEngine,
        search: Arc<FakeSearch>,
        model: Arc<FakeModel>,
        delivery: Arc<FakeDelivery>,
        logger: Arc<RecordingLogger>,
    }

    fn harness(search: FakeSearch, model: FakeModel, delivery: FakeDelivery) -> Harness {
        let search = Arc::new(search);
        let model = Arc::new(model);
        let delivery = Arc::new(delivery);
        let logger = Arc::new(RecordingLogger::default());
        let registry = Arc::new(ModuleRegistry::from_definitions([stone_news()]));

        let engine = BriefEngine::new(
            &config(),
            registry,
            Providers {
                search: search.clone(),
                model: model.clone(),
                delivery: delivery.clone(),
            },
            logger.clone(),
        );

        Harness {
            engine,
            search,
            model,
            delivery,
            logger,
        }
    }

    fn daily() -> RunRequest {
        RunRequest {
            date: NaiveDate::from_ymd_opt(2026, 10, 16),
            ..RunRequest::new("stone-news", RunType::daily())
        }
    }

    // -- Scenarios -----------------------------------------------------------

    #[tokio::test]
    async fn full_run_succeeds() {
        let h = harness(five_results(), FakeModel::replying(GOOD_BRIEF), FakeDelivery::new(false));

        let outcome = h.engine.run(&daily(), &SilentProgress).await;

        assert!(outcome.success, "{outcome:?}");
        assert_eq!(outcome.stage, Stage::DeliveryDispatcher);
        assert_eq!(outcome.delivery_id.as_deref(), Some("981"));
        assert_eq!(outcome.output.as_deref(), Some(GOOD_BRIEF));
        assert!(failure_summary(&outcome).is_none());

        // Four distinct evidence items reached the prompt.
        let prompts = h.model.prompts.lock().unwrap();
        assert_eq!(prompts[0].matches("URL: https://news.example.com/").count(), 4);
        assert!(prompts[0].starts_with("Daily brief for stone-news, October 16, 2026."));

        let sent = h.delivery.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.thread_id, Some(42));

        assert_eq!(h.logger.outcomes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_run_type_fails_fast() {
        let h = harness(five_results(), FakeModel::replying(GOOD_BRIEF), FakeDelivery::new(false));
        let request = RunRequest::new("stone-news", RunType::flash());

        let outcome = h.engine.run(&request, &SilentProgress).await;

        assert!(!outcome.success);
        assert_eq!(outcome.stage, Stage::ConfigResolver);
        assert_eq!(outcome.error_kind.as_deref(), Some("VariantNotFound"));
        assert_eq!(h.search.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.model.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.delivery.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.logger.outcomes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_module_is_config_not_found() {
        let h = harness(five_results(), FakeModel::replying(GOOD_BRIEF), FakeDelivery::new(false));
        let outcome = h.engine.run(&RunRequest::new("nope", RunType::daily()), &SilentProgress).await;

        assert_eq!(outcome.error_kind.as_deref(), Some("ConfigNotFound"));
        assert_eq!(h.search.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.logger.outcomes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn all_searches_failing_aborts_before_model() {
        let h = harness(
            FakeSearch::default(),
            FakeModel::replying(GOOD_BRIEF),
            FakeDelivery::new(false),
        );

        let outcome = h.engine.run(&daily(), &SilentProgress).await;

        assert!(!outcome.success);
        assert_eq!(outcome.stage, Stage::SearchAggregator);
        assert_eq!(outcome.stage.as_str(), "Search Aggregator");
        assert_eq!(outcome.error_kind.as_deref(), Some("SearchUnavailable"));
        assert_eq!(h.search.calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.model.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            failure_summary(&outcome).unwrap().split(':').next(),
            Some("stage=Search Aggregator kind=SearchUnavailable")
        );
    }

    #[tokio::test]
    async fn bullet_without_link_blocks_delivery() {
        let bad = GOOD_BRIEF.replace(
            "• Rival opens a plant <a href=\"https://news.example.com/3\">Example</a>",
            "• Rival opens a plant",
        );
        let h = harness(five_results(), FakeModel::replying(&bad), FakeDelivery::new(false));

        let outcome = h.engine.run(&daily(), &SilentProgress).await;

        assert!(!outcome.success);
        assert_eq!(outcome.stage, Stage::OutputValidator);
        assert_eq!(outcome.error_kind.as_deref(), Some("OutputMalformed"));
        assert!(outcome.error_detail.as_deref().unwrap().contains("line 7"));
        assert_eq!(outcome.output.as_deref(), Some(bad.as_str()));
        assert_eq!(h.model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.delivery.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn model_retry_ceiling() {
        let h = harness(five_results(), FakeModel::failing(), FakeDelivery::new(false));

        let outcome = h.engine.run(&daily(), &SilentProgress).await;

        assert_eq!(h.model.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.stage, Stage::BriefGenerator);
        assert_eq!(outcome.error_kind.as_deref(), Some("ModelUnavailable"));
        assert!(outcome.output.is_none());
        assert_eq!(h.delivery.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn delivery_retry_ceiling_preserves_output() {
        let h = harness(five_results(), FakeModel::replying(GOOD_BRIEF), FakeDelivery::new(true));

        let outcome = h.engine.run(&daily(), &SilentProgress).await;

        assert_eq!(h.delivery.calls.load(Ordering::SeqCst), 3);
        assert!(!outcome.success);
        assert_eq!(outcome.stage, Stage::DeliveryDispatcher);
        assert_eq!(outcome.error_kind.as_deref(), Some("DeliveryFailed"));
        assert_eq!(outcome.output.as_deref(), Some(GOOD_BRIEF));
        assert!(outcome.delivery_id.is_none());
        assert_eq!(h.logger.outcomes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn template_error_stops_before_model() {
        let search = Arc::new(five_results());
        let model = Arc::new(FakeModel::replying(GOOD_BRIEF));
        let logger = Arc::new(RecordingLogger::default());

        let mut module = stone_news();
        if let Some(variant) = module.variants.get_mut(&RunType::daily()) {
            variant.prompt_template = "Brief for {audience}\n{evidence}".into();
        }

        let engine = BriefEngine::new(
            &config(),
            Arc::new(ModuleRegistry::from_definitions([module])),
            Providers {
                search: search.clone(),
                model: model.clone(),
                delivery: Arc::new(FakeDelivery::new(false)),
            },
            logger.clone(),
        );

        let outcome = engine.run(&daily(), &SilentProgress).await;
        assert_eq!(outcome.stage, Stage::PromptAssembler);
        assert_eq!(outcome.error_kind.as_deref(), Some("TemplateError"));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn setup_failure_defaults_to_config_resolver() {
        let started_at = Utc::now();
        let missing_key = BriefError::config("search credential not found. Set the BRAVE_API_KEY environment variable.");

        let outcome = setup_failure(&daily(), started_at, &missing_key);

        assert!(!outcome.success);
        assert_eq!(outcome.stage, Stage::ConfigResolver);
        assert_eq!(outcome.error_kind.as_deref(), Some("Config"));
        assert_eq!(outcome.module, "stone-news");
        assert_eq!(outcome.run_type, "daily");
        assert!(outcome.finished_at >= started_at);
        assert_eq!(
            failure_summary(&outcome).as_deref(),
            Some("stage=Config Resolver kind=Config: config error: search credential not found. Set the BRAVE_API_KEY environment variable.")
        );
    }
}
