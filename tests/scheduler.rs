//! Scheduler concurrency scenarios
//!
//! The dedup map is the single serialization point: concurrent submits for
//! one key must converge on one runner invocation, and the retry budget
//! bounds invocations for a failing job. Also covers the full
//! resolve → transform → resolve loop.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use variant_registry::capability::CapabilityStatement;
use variant_registry::checksum::ContentHash;
use variant_registry::error::RunnerError;
use variant_registry::media::{MediaType, MediaTypePattern};
use variant_registry::registry::{CachePolicy, KindId, RegistryEntry, TransformRule};
use variant_registry::representation::{PayloadSource, Representation, ToolVersion};
use variant_registry::resolver::{Resolution, VariantResolver};
use variant_registry::runner::{JobSpec, Runner, RunnerCatalog, RunnerOutput};
use variant_registry::scheduler::{RetryPolicy, TransformScheduler};
use variant_registry::transform::{SourceRef, ToolImage, TransformRequest};
use variant_registry::TransformError;

struct StubRunner {
    invocations: Arc<AtomicU32>,
    fail_always: bool,
    delay: Duration,
}

#[async_trait]
impl Runner for StubRunner {
    async fn run(&self, spec: &JobSpec) -> Result<RunnerOutput, RunnerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail_always {
            return Err(RunnerError::ToolFailure("always failing".to_string()));
        }
        Ok(RunnerOutput {
            media_type: spec.output_media_type.clone(),
            payload: PayloadSource::external(
                "/content/m1/blocks/b1/variants/text__html/deadbeef".to_string(),
            ),
            width: None,
            height: None,
            bytes: Some(512),
            content_hash: Some(ContentHash::from_bytes(b"rendered html")),
            generated_by: Some("markdown-render".to_string()),
            tool_version: Some(ToolVersion::parse("cmark-sidecar", "1.4.2").unwrap()),
            created_at: None,
        })
    }
}

fn scheduler(invocations: Arc<AtomicU32>, fail_always: bool, delay: Duration) -> TransformScheduler {
    let mut catalog = RunnerCatalog::new();
    catalog.register(
        "markdown-render",
        ToolImage::parse("cmark-sidecar", "1.4.2").unwrap(),
        Arc::new(StubRunner { invocations, fail_always, delay }),
    );
    let retry = RetryPolicy {
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
    };
    TransformScheduler::new(catalog, retry, 1024 * 1024)
}

fn request() -> TransformRequest {
    TransformRequest {
        kind_id: KindId::parse("core:markdown").unwrap(),
        sources: vec![SourceRef {
            locator: "/content/m1/blocks/b1/variants/text__markdown/cafe".to_string(),
            content_hash: ContentHash::from_bytes(b"# hello"),
        }],
        operation: "markdown-render".to_string(),
        options: serde_json::json!({"sanitize": true}),
        output: MediaType::parse("text/html").unwrap(),
        timeout_secs: 5,
        max_attempts: 4,
    }
}

#[tokio::test]
async fn concurrent_submits_converge_on_one_job() {
    let invocations = Arc::new(AtomicU32::new(0));
    let scheduler = scheduler(invocations.clone(), false, Duration::from_millis(50));

    let mut waiters = Vec::new();
    for _ in 0..16 {
        let scheduler = scheduler.clone();
        waiters.push(tokio::spawn(async move {
            scheduler
                .run_to_completion(request(), Duration::from_secs(5))
                .await
        }));
    }

    let mut results = Vec::new();
    for waiter in waiters {
        results.push(waiter.await.unwrap().unwrap());
    }

    // exactly one runner invocation, N identical results
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    for r in &results[1..] {
        assert_eq!(r, &results[0]);
    }
}

#[tokio::test]
async fn always_failing_runner_hits_exact_attempt_limit() {
    let invocations = Arc::new(AtomicU32::new(0));
    let scheduler = scheduler(invocations.clone(), true, Duration::ZERO);

    let err = scheduler
        .run_to_completion(request(), Duration::from_secs(5))
        .await
        .unwrap_err();
    match err {
        TransformError::Terminal { attempts, error, .. } => {
            assert_eq!(attempts, 4);
            assert!(matches!(error, RunnerError::ToolFailure(_)));
        }
        other => panic!("expected Terminal, got {:?}", other),
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn all_waiters_see_the_same_terminal_failure() {
    let invocations = Arc::new(AtomicU32::new(0));
    let scheduler = scheduler(invocations.clone(), true, Duration::from_millis(5));

    let mut waiters = Vec::new();
    for _ in 0..8 {
        let scheduler = scheduler.clone();
        waiters.push(tokio::spawn(async move {
            scheduler
                .run_to_completion(request(), Duration::from_secs(5))
                .await
        }));
    }

    for waiter in waiters {
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, TransformError::Terminal { attempts: 4, .. }));
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn raising_the_budget_requeues_a_terminal_failure() {
    let invocations = Arc::new(AtomicU32::new(0));
    let scheduler = scheduler(invocations.clone(), true, Duration::ZERO);

    let mut first = request();
    first.max_attempts = 2;
    let err = scheduler
        .run_to_completion(first, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, TransformError::Terminal { attempts: 2, .. }));

    // Same key, higher budget: the job is requeued and the attempt count
    // carries over instead of restarting.
    let mut second = request();
    second.max_attempts = 3;
    let err = scheduler
        .run_to_completion(second, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, TransformError::Terminal { attempts: 3, .. }));
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn transform_result_feeds_back_into_resolution() {
    let mut markdown = RegistryEntry {
        kind_id: KindId::parse("core:markdown").unwrap(),
        schema_ref: "schema:core:markdown".to_string(),
        allowed_representations: vec![
            MediaTypePattern::parse("text/markdown").unwrap(),
            MediaTypePattern::parse("text/html").unwrap(),
        ],
        transform_rules: vec![],
        sanitization_policy_ref: None,
        fallback_policy: vec![],
        cache_policy: CachePolicy::default(),
    };
    markdown.transform_rules.push(TransformRule {
        input: MediaTypePattern::parse("text/markdown").unwrap(),
        output: MediaTypePattern::parse("text/html").unwrap(),
        operation: "markdown-render".to_string(),
        default_options: serde_json::json!({"sanitize": true}),
    });

    let authored = Representation::new(
        MediaType::parse("text/markdown").unwrap(),
        PayloadSource::external("/content/m1/blocks/b1/variants/text__markdown/cafe"),
    )
    .with_content_hash(ContentHash::from_bytes(b"# hello"))
    .with_created_at(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());

    let resolver = VariantResolver::default();
    let caps = CapabilityStatement::from_accept(&["text/html"]).unwrap();
    let mut available = vec![authored];

    // First pass: nothing servable, a transform is planned.
    let request = match resolver.resolve(&markdown, &available, &caps) {
        Resolution::NeedsTransform(request) => request,
        other => panic!("expected NeedsTransform, got {:?}", other),
    };

    let invocations = Arc::new(AtomicU32::new(0));
    let scheduler = scheduler(invocations.clone(), false, Duration::ZERO);
    let produced = scheduler
        .run_to_completion(request, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(produced.has_provenance());

    // The new representation joins the available set; the same capability
    // statement now resolves directly.
    available.push(produced);
    match resolver.resolve(&markdown, &available, &caps) {
        Resolution::Selected(r) => assert_eq!(r.media_type.essence(), "text/html"),
        other => panic!("expected Selected, got {:?}", other),
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}
