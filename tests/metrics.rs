use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use lessonmark::application::render::{
    DebounceSettings, DebouncedRenderer, ImageRequest, ImageResolveError, ImageResolver,
    MarkdownRenderService, RenderPipelineConfig, RenderRequest, RenderService, metric_names,
    resolve_images,
};
use lessonmark::infra::telemetry;
use metrics_util::debugging::DebuggingRecorder;

struct MissingEverything;

#[async_trait]
impl ImageResolver for MissingEverything {
    async fn resolve(
        &self,
        request: ImageRequest<'_>,
    ) -> Result<Option<String>, ImageResolveError> {
        Err(ImageResolveError::NotFound {
            src: request.src.to_string(),
        })
    }
}

#[tokio::test]
async fn pipeline_emits_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let service = Arc::new(
        MarkdownRenderService::new(&RenderPipelineConfig::default())
            .expect("pipeline config is valid"),
    );

    // Render latency
    service
        .render(&RenderRequest::new("# Title\n\n```kotlin\nval x = 1\n```\n"))
        .expect("render succeeds");

    // Failed image resolution keeps the source and is counted
    let html = resolve_images(
        "<p><img src=\"missing.png\" alt=\"m\" /></p>",
        Some("/lessons/"),
        &MissingEverything,
    )
    .await
    .expect("resolution never fails the render");
    assert!(html.contains("src=\"missing.png\""), "{html}");

    // Superseded debounce submissions
    let renderer = DebouncedRenderer::spawn(
        service,
        DebounceSettings {
            quiet_period: Duration::from_millis(50),
        },
    );
    let mut updates = renderer.subscribe();
    renderer.submit("a", None).expect("submit");
    renderer.submit("ab", None).expect("submit");
    tokio::time::timeout(Duration::from_secs(5), updates.changed())
        .await
        .expect("render published in time")
        .expect("renderer alive");

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        metric_names::RENDER_MS,
        metric_names::IMAGE_RESOLVE_FAILED_TOTAL,
        metric_names::DEBOUNCE_SUPERSEDED_TOTAL,
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
    assert!(
        !names.contains(metric_names::HIGHLIGHT_FALLBACK_TOTAL),
        "bundled grammars should not fall back"
    );
}
