//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{collections::BTreeMap, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::render::{DEFAULT_DIAGRAM_LANGUAGE, Language};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "lessonmark";
const ENV_PREFIX: &str = "LESSONMARK";
const DEFAULT_DEBOUNCE_MS: u64 = 150;
const MAX_DEBOUNCE_MS: u64 = 10_000;

/// Command-line arguments for the lessonmark binary.
#[derive(Debug, Parser)]
#[command(
    name = "lessonmark",
    version,
    about = "Render lesson markdown into sanitised HTML"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "LESSONMARK_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Render a markdown file (or stdin) once and print the HTML.
    Render(RenderArgs),
    /// Read stdin incrementally and print each debounced render.
    Stream(StreamArgs),
    /// Print the stylesheet matching the highlighter's class names.
    Stylesheet,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RenderOverrides {
    /// Override the fence info string rendered as a diagram container.
    #[arg(long = "diagram-language", value_name = "NAME")]
    pub diagram_language: Option<String>,

    /// Override the prefix used to resolve `![[...]]` embeds.
    #[arg(long = "base-path", value_name = "PATH", conflicts_with = "content_url")]
    pub base_path: Option<String>,

    /// Derive the embed prefix from the URL the markdown was fetched from.
    #[arg(long = "content-url", value_name = "URL")]
    pub content_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RenderArgs {
    #[command(flatten)]
    pub overrides: RenderOverrides,

    /// Markdown file to render; stdin when omitted.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub file: Option<PathBuf>,

    /// Print the compiler output before sanitisation.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub raw: bool,

    /// Rewrite local image paths to this URL scheme (for example `safe-file`).
    #[arg(long = "resolve-images", value_name = "SCHEME")]
    pub resolve_images: Option<String>,

    /// Print the render as JSON, including content flags.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StreamArgs {
    #[command(flatten)]
    pub overrides: RenderOverrides,

    /// Override the quiet period before a render starts.
    #[arg(long = "debounce-ms", value_name = "MILLISECONDS")]
    pub debounce_ms: Option<u64>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub render: RenderSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub debounce: Duration,
    pub diagram_language: String,
    pub task_lists: bool,
    pub math: bool,
    pub attributes: bool,
    pub base_path: Option<String>,
    pub language_aliases: BTreeMap<String, Language>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    raw.apply_logging_overrides(&cli.logging);
    match cli.command.as_ref() {
        Some(Command::Render(args)) => raw.apply_render_overrides(&args.overrides),
        Some(Command::Stream(args)) => {
            raw.apply_render_overrides(&args.overrides);
            if let Some(ms) = args.debounce_ms {
                raw.render.debounce_ms = Some(ms);
            }
        }
        Some(Command::Stylesheet) | None => {}
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    render: RawRenderSettings,
}

impl RawSettings {
    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_render_overrides(&mut self, overrides: &RenderOverrides) {
        if let Some(language) = overrides.diagram_language.as_ref() {
            self.render.diagram_language = Some(language.clone());
        }
        if let Some(base_path) = overrides.base_path.as_ref() {
            self.render.base_path = Some(base_path.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, render } = raw;

        let logging = build_logging_settings(logging)?;
        let render = build_render_settings(render)?;

        Ok(Self { logging, render })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let debounce_ms = render.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS);
    if debounce_ms > MAX_DEBOUNCE_MS {
        return Err(LoadError::invalid(
            "render.debounce_ms",
            format!("must not exceed {MAX_DEBOUNCE_MS}"),
        ));
    }

    let diagram_language = render
        .diagram_language
        .map(|value| value.trim().to_lowercase())
        .unwrap_or_else(|| DEFAULT_DIAGRAM_LANGUAGE.to_string());
    if diagram_language.is_empty() || diagram_language.contains(char::is_whitespace) {
        return Err(LoadError::invalid(
            "render.diagram_language",
            "must be a single non-empty word",
        ));
    }

    let base_path = render.base_path.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let mut language_aliases = BTreeMap::new();
    for (alias, name) in render.language_aliases {
        let language = Language::from_name(&name).ok_or_else(|| {
            LoadError::invalid(
                "render.language_aliases",
                format!("`{alias}` maps to unknown language `{name}`"),
            )
        })?;
        language_aliases.insert(alias, language);
    }

    Ok(RenderSettings {
        debounce: Duration::from_millis(debounce_ms),
        diagram_language,
        task_lists: render.task_lists.unwrap_or(true),
        math: render.math.unwrap_or(true),
        attributes: render.attributes.unwrap_or(true),
        base_path,
        language_aliases,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    debounce_ms: Option<u64>,
    diagram_language: Option<String>,
    task_lists: Option<bool>,
    math: Option<bool>,
    attributes: Option<bool>,
    base_path: Option<String>,
    language_aliases: BTreeMap<String, String>,
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
