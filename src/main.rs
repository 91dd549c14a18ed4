use std::{path::Path, process, sync::Arc};

use lessonmark::{
    HIGHLIGHT_CSS,
    application::{
        error::AppError,
        render::{
            DebounceSettings, DebouncedRenderer, LocalFileResolver, MarkdownRenderService,
            RenderPipelineConfig, RenderRequest, RenderService,
            base_path_for_content_url,
        },
    },
    config::{self, RenderArgs, RenderOverrides, Settings, StreamArgs},
    infra::telemetry,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{Dispatch, Level, debug, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

const STREAM_CHUNK_BYTES: usize = 4096;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Render(RenderArgs::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Render(args) => run_render(settings, args).await,
        config::Command::Stream(args) => run_stream(settings, args).await,
        config::Command::Stylesheet => write_stdout(HIGHLIGHT_CSS).await,
    }
}

async fn run_render(settings: Settings, args: RenderArgs) -> Result<(), AppError> {
    let service = MarkdownRenderService::new(&RenderPipelineConfig::from(&settings.render))?;

    let markdown = match args.file.as_deref() {
        Some(path) => read_file(path).await?,
        None => read_stdin().await?,
    };

    let base_path = resolve_base_path(&settings, &args.overrides, args.file.as_deref());
    let mut request = RenderRequest::new(markdown);
    if let Some(base_path) = base_path.as_deref() {
        request = request.with_base_path(base_path);
    }

    let output = match args.resolve_images.as_deref() {
        Some(scheme) => {
            let mut resolver = LocalFileResolver::new(scheme);
            if let Ok(cwd) = std::env::current_dir() {
                resolver = resolver.with_root(cwd);
            }
            service.render_with_resolver(&request, &resolver).await?
        }
        None => service.render(&request)?,
    };

    info!(
        bytes = request.markdown.len(),
        code = output.contains_code,
        math = output.contains_math,
        mermaid = output.contains_mermaid,
        "Rendered document"
    );

    if args.json {
        let body = serde_json::to_string_pretty(&output)
            .map_err(|err| AppError::unexpected(format!("failed to encode render: {err}")))?;
        write_stdout(&format!("{body}\n")).await
    } else if args.raw {
        write_stdout(&output.raw_html).await
    } else {
        write_stdout(&output.html).await
    }
}

/// Feeds stdin into the debounced renderer and prints every published render.
async fn run_stream(settings: Settings, args: StreamArgs) -> Result<(), AppError> {
    let service: Arc<dyn RenderService> = Arc::new(MarkdownRenderService::new(
        &RenderPipelineConfig::from(&settings.render),
    )?);
    let renderer = DebouncedRenderer::spawn(service, DebounceSettings::from(&settings.render));
    let mut updates = renderer.subscribe();
    let base_path = resolve_base_path(&settings, &args.overrides, None);

    let mut stdin = tokio::io::stdin();
    let mut buffer = Vec::new();
    let mut chunk = vec![0u8; STREAM_CHUNK_BYTES];
    let mut last_generation = 0;
    let mut printed_generation = 0;

    loop {
        tokio::select! {
            read = stdin.read(&mut chunk) => {
                let count = read?;
                if count == 0 {
                    break;
                }
                buffer.extend_from_slice(&chunk[..count]);
                let markdown = String::from_utf8_lossy(&buffer).into_owned();
                last_generation = renderer.submit(markdown, base_path.as_deref())?;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let rendered = updates.borrow_and_update().clone();
                debug!(generation = rendered.generation, "Published render");
                printed_generation = rendered.generation;
                write_stdout(&format!("{}\n", rendered.html)).await?;
            }
        }
    }

    // Drain until the final submission has been published.
    loop {
        let rendered = updates.borrow_and_update().clone();
        if rendered.generation > printed_generation {
            printed_generation = rendered.generation;
            write_stdout(&format!("{}\n", rendered.html)).await?;
        }
        if rendered.generation >= last_generation {
            return Ok(());
        }
        if updates.changed().await.is_err() {
            return Err(AppError::unexpected(
                "renderer stopped before the final render",
            ));
        }
    }
}

fn resolve_base_path(
    settings: &Settings,
    overrides: &RenderOverrides,
    file: Option<&Path>,
) -> Option<String> {
    if let Some(content_url) = overrides.content_url.as_deref() {
        return base_path_for_content_url(content_url);
    }
    if settings.render.base_path.is_some() {
        return settings.render.base_path.clone();
    }
    file.and_then(Path::parent)
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(|parent| format!("{}/", parent.display()))
}

async fn read_file(path: &Path) -> Result<String, AppError> {
    tokio::fs::read_to_string(path).await.map_err(|err| {
        AppError::validation(format!("failed to read `{}`: {err}", path.display()))
    })
}

async fn read_stdin() -> Result<String, AppError> {
    let mut markdown = String::new();
    tokio::io::stdin().read_to_string(&mut markdown).await?;
    Ok(markdown)
}

async fn write_stdout(text: &str) -> Result<(), AppError> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(text.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}
