use std::{
    future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use metrics::counter;
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::{JoinHandle, JoinSet},
    time::Instant,
};
use tracing::{debug, warn};

use super::service::highlight::escape_html;
use super::service::images::{ImageResolver, resolve_images};
use super::types::{RenderError, RenderOutput, RenderRequest, RenderService, RenderedHtml};

pub(crate) const METRIC_DEBOUNCE_SUPERSEDED_TOTAL: &str = "lessonmark_debounce_superseded_total";

pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(150);

/// Restartable "act after this long without activity" deadline.
#[derive(Debug, Clone)]
pub struct TrailingDebounce {
    deadline: Option<Instant>,
    quiet_period: Duration,
}

impl TrailingDebounce {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            deadline: None,
            quiet_period,
        }
    }

    /// Restart the timer at `now + quiet_period`.
    pub fn reset(&mut self) {
        self.deadline = Some(Instant::now() + self.quiet_period);
    }

    pub fn clear(&mut self) {
        self.deadline = None;
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves at the deadline; never resolves while nothing is pending.
    /// Guard `select!` branches with [`is_pending`](Self::is_pending).
    pub async fn sleep_until(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => future::pending::<()>().await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceSettings {
    pub quiet_period: Duration,
}

impl Default for DebounceSettings {
    fn default() -> Self {
        Self {
            quiet_period: DEFAULT_QUIET_PERIOD,
        }
    }
}

impl From<&crate::config::RenderSettings> for DebounceSettings {
    fn from(settings: &crate::config::RenderSettings) -> Self {
        Self {
            quiet_period: settings.debounce,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DebounceError {
    #[error("debounced renderer has shut down")]
    Closed,
}

struct Submission {
    generation: u64,
    request: RenderRequest,
}

/// Re-renders markdown once its input has been quiet for the configured period.
///
/// Each submission restarts the timer; only the newest pending value reaches
/// the pipeline. Results are published on a `watch` channel and a result never
/// replaces one from a newer submission. Dropping the renderer stops the
/// worker together with any pending timer.
pub struct DebouncedRenderer {
    input: mpsc::UnboundedSender<Submission>,
    output: watch::Receiver<RenderedHtml>,
    next_generation: AtomicU64,
    worker: JoinHandle<()>,
}

impl DebouncedRenderer {
    /// Start the worker on the current tokio runtime.
    pub fn spawn(service: Arc<dyn RenderService>, settings: DebounceSettings) -> Self {
        Self::start(service, None, settings)
    }

    /// As [`spawn`](Self::spawn), resolving image sources between compile and sanitise.
    pub fn spawn_with_resolver(
        service: Arc<dyn RenderService>,
        resolver: Arc<dyn ImageResolver>,
        settings: DebounceSettings,
    ) -> Self {
        Self::start(service, Some(resolver), settings)
    }

    fn start(
        service: Arc<dyn RenderService>,
        resolver: Option<Arc<dyn ImageResolver>>,
        settings: DebounceSettings,
    ) -> Self {
        let (input, inbox) = mpsc::unbounded_channel();
        let (publisher, output) = watch::channel(RenderedHtml::default());

        let worker = tokio::spawn(run_worker(
            Pipeline { service, resolver },
            settings,
            inbox,
            Arc::new(publisher),
        ));

        Self {
            input,
            output,
            next_generation: AtomicU64::new(1),
            worker,
        }
    }

    /// Queue new markdown, restarting the quiet period. Returns the submission's generation.
    pub fn submit(
        &self,
        markdown: impl Into<String>,
        base_path: Option<&str>,
    ) -> Result<u64, DebounceError> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut request = RenderRequest::new(markdown);
        if let Some(base_path) = base_path {
            request = request.with_base_path(base_path);
        }

        self.input
            .send(Submission {
                generation,
                request,
            })
            .map_err(|_| DebounceError::Closed)?;

        Ok(generation)
    }

    pub fn subscribe(&self) -> watch::Receiver<RenderedHtml> {
        self.output.clone()
    }

    /// Most recently published result.
    pub fn latest(&self) -> RenderedHtml {
        self.output.borrow().clone()
    }
}

impl Drop for DebouncedRenderer {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[derive(Clone)]
struct Pipeline {
    service: Arc<dyn RenderService>,
    resolver: Option<Arc<dyn ImageResolver>>,
}

async fn run_worker(
    pipeline: Pipeline,
    settings: DebounceSettings,
    mut inbox: mpsc::UnboundedReceiver<Submission>,
    publisher: Arc<watch::Sender<RenderedHtml>>,
) {
    let mut debounce = TrailingDebounce::new(settings.quiet_period);
    let mut pending: Option<Submission> = None;
    let mut renders = JoinSet::new();

    loop {
        tokio::select! {
            received = inbox.recv() => {
                let Some(submission) = received else {
                    break;
                };
                // A submission can arrive behind a newer one when callers race.
                let arrived_late = pending
                    .as_ref()
                    .is_some_and(|current| current.generation > submission.generation);
                let superseded = if arrived_late {
                    Some(submission)
                } else {
                    pending.replace(submission)
                };
                if superseded.is_some() {
                    counter!(METRIC_DEBOUNCE_SUPERSEDED_TOTAL).increment(1);
                }
                debounce.reset();
            }
            () = debounce.sleep_until(), if debounce.is_pending() => {
                debounce.clear();
                if let Some(submission) = pending.take() {
                    let pipeline = pipeline.clone();
                    let publisher = Arc::clone(&publisher);
                    renders.spawn(async move {
                        let rendered = pipeline.render(submission).await;
                        publish(&publisher, rendered);
                    });
                }
            }
            Some(joined) = renders.join_next(), if !renders.is_empty() => {
                if let Err(err) = joined {
                    warn!(
                        target = "application::render::debounce",
                        error = %err,
                        "Render task did not complete"
                    );
                }
            }
        }
    }
}

impl Pipeline {
    async fn render(&self, submission: Submission) -> RenderedHtml {
        let Submission {
            generation,
            request,
        } = submission;

        if request.markdown.is_empty() {
            return RenderedHtml::empty(generation);
        }

        match self.run_stages(&request).await {
            Ok(output) => RenderedHtml::from_output(generation, output),
            Err(err) => {
                warn!(
                    target = "application::render::debounce",
                    generation,
                    error = %err,
                    "Render failed; publishing escaped source"
                );
                let raw_html = format!("<pre>{}</pre>", escape_html(&request.markdown));
                let html = self.service.sanitize(&raw_html);
                RenderedHtml {
                    generation,
                    html,
                    raw_html,
                }
            }
        }
    }

    async fn run_stages(&self, request: &RenderRequest) -> Result<RenderOutput, RenderError> {
        let Some(resolver) = &self.resolver else {
            let service = Arc::clone(&self.service);
            let request = request.clone();
            return tokio::task::spawn_blocking(move || service.render(&request))
                .await
                .map_err(join_error)?;
        };

        let service = Arc::clone(&self.service);
        let compile_request = request.clone();
        let compiled = tokio::task::spawn_blocking(move || service.compile(&compile_request))
            .await
            .map_err(join_error)??;

        let resolved = resolve_images(&compiled, request.base_path(), resolver.as_ref()).await?;

        let service = Arc::clone(&self.service);
        let (raw_html, html) = tokio::task::spawn_blocking(move || {
            let html = service.sanitize(&resolved);
            (resolved, html)
        })
        .await
        .map_err(join_error)?;

        Ok(RenderOutput::from_stages(raw_html, html))
    }
}

fn join_error(err: tokio::task::JoinError) -> RenderError {
    RenderError::Document {
        message: format!("render task failed: {err}"),
    }
}

// Results from older submissions never replace newer ones.
fn publish(publisher: &watch::Sender<RenderedHtml>, rendered: RenderedHtml) {
    let generation = rendered.generation;
    let published = publisher.send_if_modified(|current| {
        if rendered.generation > current.generation {
            *current = rendered;
            true
        } else {
            false
        }
    });

    if !published {
        debug!(
            target = "application::render::debounce",
            generation, "Discarded stale render"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::application::render::service::images::{ImageRequest, ImageResolveError};

    const WINDOW: Duration = Duration::from_millis(40);

    #[derive(Default)]
    struct EchoService {
        compiled: Mutex<Vec<String>>,
        calls: AtomicUsize,
        slow_input: Option<(&'static str, Duration)>,
    }

    impl EchoService {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RenderService for EchoService {
        fn compile(&self, request: &RenderRequest) -> Result<String, RenderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.compiled
                .lock()
                .expect("lock")
                .push(request.markdown.clone());
            if let Some((input, delay)) = self.slow_input
                && request.markdown == input
            {
                std::thread::sleep(delay);
            }
            if request.markdown.starts_with("fail") {
                return Err(RenderError::Markdown {
                    message: "boom".to_string(),
                });
            }
            Ok(format!("<p>{}</p>", request.markdown))
        }

        fn sanitize(&self, html: &str) -> String {
            html.to_string()
        }
    }

    async fn next_render(rx: &mut watch::Receiver<RenderedHtml>) -> RenderedHtml {
        timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("render published in time")
            .expect("renderer alive");
        rx.borrow_and_update().clone()
    }

    #[tokio::test]
    async fn trailing_debounce_tracks_pending_deadline() {
        let mut debounce = TrailingDebounce::new(Duration::from_millis(5));
        assert!(!debounce.is_pending());
        debounce.reset();
        assert!(debounce.is_pending());
        let deadline = debounce.deadline().expect("deadline set");
        debounce.sleep_until().await;
        assert!(Instant::now() >= deadline);
        debounce.clear();
        assert!(!debounce.is_pending());
    }

    #[tokio::test]
    async fn burst_collapses_to_last_value() {
        let service = Arc::new(EchoService::default());
        let renderer = DebouncedRenderer::spawn(
            service.clone(),
            DebounceSettings {
                quiet_period: WINDOW,
            },
        );
        let mut rx = renderer.subscribe();

        renderer.submit("a", None).expect("submit");
        renderer.submit("ab", None).expect("submit");
        let last = renderer.submit("abc", None).expect("submit");

        let rendered = next_render(&mut rx).await;
        assert_eq!(rendered.generation, last);
        assert_eq!(rendered.html, "<p>abc</p>");

        sleep(WINDOW * 3).await;
        assert_eq!(service.calls(), 1);
        assert_eq!(*service.compiled.lock().expect("lock"), vec!["abc"]);
    }

    #[tokio::test]
    async fn separated_inputs_each_render() {
        let service = Arc::new(EchoService::default());
        let renderer = DebouncedRenderer::spawn(
            service.clone(),
            DebounceSettings {
                quiet_period: WINDOW,
            },
        );
        let mut rx = renderer.subscribe();

        renderer.submit("one", None).expect("submit");
        assert_eq!(next_render(&mut rx).await.html, "<p>one</p>");
        renderer.submit("two", None).expect("submit");
        assert_eq!(next_render(&mut rx).await.html, "<p>two</p>");
        assert_eq!(service.calls(), 2);
        assert_eq!(renderer.latest().html, "<p>two</p>");
    }

    #[tokio::test]
    async fn empty_input_skips_the_pipeline() {
        let service = Arc::new(EchoService::default());
        let renderer = DebouncedRenderer::spawn(
            service.clone(),
            DebounceSettings {
                quiet_period: WINDOW,
            },
        );
        let mut rx = renderer.subscribe();

        let generation = renderer.submit("", None).expect("submit");
        let rendered = next_render(&mut rx).await;
        assert_eq!(rendered, RenderedHtml::empty(generation));
        assert_eq!(service.calls(), 0);
    }

    #[tokio::test]
    async fn failures_publish_escaped_source() {
        let service = Arc::new(EchoService::default());
        let renderer = DebouncedRenderer::spawn(
            service,
            DebounceSettings {
                quiet_period: WINDOW,
            },
        );
        let mut rx = renderer.subscribe();

        renderer.submit("fail <b>&</b>", None).expect("submit");
        let rendered = next_render(&mut rx).await;
        assert_eq!(rendered.html, "<pre>fail &lt;b&gt;&amp;&lt;/b&gt;</pre>");
    }

    #[tokio::test]
    async fn stale_render_never_overwrites_newer_result() {
        let service = Arc::new(EchoService {
            slow_input: Some(("slow", Duration::from_millis(300))),
            ..EchoService::default()
        });
        let renderer = DebouncedRenderer::spawn(
            service.clone(),
            DebounceSettings {
                quiet_period: WINDOW,
            },
        );
        let mut rx = renderer.subscribe();

        renderer.submit("slow", None).expect("submit");
        sleep(WINDOW * 3).await;
        let fast = renderer.submit("fast", None).expect("submit");

        let rendered = next_render(&mut rx).await;
        assert_eq!(rendered.generation, fast);
        assert_eq!(rendered.html, "<p>fast</p>");

        sleep(Duration::from_millis(400)).await;
        assert_eq!(service.calls(), 2);
        assert_eq!(renderer.latest().html, "<p>fast</p>");
    }

    #[tokio::test]
    async fn dropping_renderer_stops_publishing() {
        let service = Arc::new(EchoService::default());
        let renderer = DebouncedRenderer::spawn(
            service.clone(),
            DebounceSettings {
                quiet_period: WINDOW,
            },
        );
        let mut rx = renderer.subscribe();
        renderer.submit("never", None).expect("submit");
        drop(renderer);

        let closed = timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("channel settles");
        assert!(closed.is_err(), "publisher should be gone");
        assert_eq!(service.calls(), 0);
    }

    #[tokio::test]
    async fn base_path_reaches_the_request() {
        struct BaseEcho;
        impl RenderService for BaseEcho {
            fn compile(&self, request: &RenderRequest) -> Result<String, RenderError> {
                Ok(request.base_path().unwrap_or("none").to_string())
            }
            fn sanitize(&self, html: &str) -> String {
                html.to_string()
            }
        }

        let renderer = DebouncedRenderer::spawn(
            Arc::new(BaseEcho),
            DebounceSettings {
                quiet_period: WINDOW,
            },
        );
        let mut rx = renderer.subscribe();
        renderer.submit("x", Some("/lessons/2")).expect("submit");
        assert_eq!(next_render(&mut rx).await.html, "/lessons/2/");
    }

    #[derive(Default)]
    struct RecordingResolver {
        seen: Mutex<Vec<(Option<String>, String)>>,
    }

    #[async_trait]
    impl ImageResolver for RecordingResolver {
        async fn resolve(
            &self,
            request: ImageRequest<'_>,
        ) -> Result<Option<String>, ImageResolveError> {
            self.seen
                .lock()
                .expect("lock")
                .push((request.file_dir.map(str::to_string), request.src.to_string()));
            Ok(Some(format!("safe-file:///content/{}", request.src)))
        }
    }

    #[tokio::test]
    async fn resolver_runs_between_compile_and_sanitize() {
        let service = Arc::new(EchoService::default());
        let resolver = Arc::new(RecordingResolver::default());
        let renderer = DebouncedRenderer::spawn_with_resolver(
            service.clone(),
            resolver.clone(),
            DebounceSettings {
                quiet_period: WINDOW,
            },
        );
        let mut rx = renderer.subscribe();

        renderer
            .submit("<img src=\"draft.png\">", None)
            .expect("submit");
        let generation = renderer
            .submit("<img src=\"chart.png\">", Some("/lessons/2/"))
            .expect("submit");

        let rendered = next_render(&mut rx).await;
        assert_eq!(rendered.generation, generation);
        assert!(
            rendered
                .html
                .contains("src=\"safe-file:///content/chart.png\""),
            "{}",
            rendered.html
        );
        assert!(
            rendered.raw_html.contains("safe-file:///content/chart.png"),
            "{}",
            rendered.raw_html
        );
        assert_eq!(service.calls(), 1);
        assert_eq!(
            *resolver.seen.lock().expect("lock"),
            vec![(Some("/lessons/2/".to_string()), "chart.png".to_string())]
        );
    }
}
