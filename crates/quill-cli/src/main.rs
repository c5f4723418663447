//! Command-line front-end: starts one generation job and renders progress,
//! preview growth, and connection health until the job reaches a terminal
//! state. Ctrl-C cancels optimistically.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use quill_job::{
    GenerationJobRuntime, GenerationJobRuntimeConfig, GenerationRequest, JobControlApi,
    JobControlApiConfig, JobStatus, ScriptType,
};
use quill_stream::{
    ConnectionRegistry, ConnectionState, LivenessMonitorConfig, ReconnectPolicyConfig,
};

const RENDER_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliScriptType {
    Screenplay,
    Teleplay,
    StagePlay,
    AudioDrama,
}

impl From<CliScriptType> for ScriptType {
    fn from(value: CliScriptType) -> Self {
        match value {
            CliScriptType::Screenplay => ScriptType::Screenplay,
            CliScriptType::Teleplay => ScriptType::Teleplay,
            CliScriptType::StagePlay => ScriptType::StagePlay,
            CliScriptType::AudioDrama => ScriptType::AudioDrama,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "quill",
    about = "Drive a remote script-generation job and stream its progress"
)]
struct CliArgs {
    /// Base URL of the job-control API.
    #[arg(long, env = "QUILL_API_BASE", default_value = "http://127.0.0.1:8787/v1")]
    api_base: String,

    /// Project the episode belongs to.
    #[arg(long)]
    project_id: String,

    /// Episode number within the project.
    #[arg(long)]
    episode: Option<u32>,

    /// What the script should be about.
    #[arg(long)]
    description: String,

    #[arg(long, value_enum, default_value_t = CliScriptType::Screenplay)]
    script_type: CliScriptType,

    /// Model name forwarded to the service, when set.
    #[arg(long)]
    model: Option<String>,

    #[arg(long, default_value_t = 0.7)]
    temperature: f32,

    #[arg(long, default_value_t = 4_000)]
    target_length_words: u32,

    /// Seconds of stream silence tolerated before reconnecting.
    #[arg(long, default_value_t = 45)]
    heartbeat_timeout_seconds: u64,

    /// Automatic reconnect attempts before asking for a manual retry.
    #[arg(long, default_value_t = 5)]
    max_retries: usize,
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = CliArgs::parse();
    run(args).await
}

async fn run(args: CliArgs) -> Result<()> {
    let request = GenerationRequest {
        project_id: args.project_id.clone(),
        episode_number: args.episode,
        description: args.description.clone(),
        script_type: args.script_type.into(),
        model: args.model.clone(),
        temperature: args.temperature,
        target_length_words: args.target_length_words,
    };

    let control = JobControlApi::new(JobControlApiConfig::new(args.api_base.clone()))
        .context("failed to build the job-control client")?;
    let registry = Arc::new(ConnectionRegistry::new());
    let config = GenerationJobRuntimeConfig {
        liveness: LivenessMonitorConfig {
            heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout_seconds.max(1)),
            ..LivenessMonitorConfig::default()
        },
        reconnect: ReconnectPolicyConfig {
            max_retries: args.max_retries,
            ..ReconnectPolicyConfig::default()
        },
        ..GenerationJobRuntimeConfig::default()
    };

    let mut runtime = GenerationJobRuntime::new(config, Arc::new(control), registry.clone());
    let job_id = runtime
        .start(request)
        .await
        .context("failed to start the generation job")?;
    println!("job {job_id} accepted, streaming progress (Ctrl-C cancels)");

    let mut last_progress_line = String::new();
    let mut last_connection_line = String::new();
    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("cancel requested");
                if let Err(error) = runtime.cancel().await {
                    tracing::warn!(error = %error, "cancellation bookkeeping failed");
                }
                break runtime.state();
            }
            _ = tokio::time::sleep(RENDER_INTERVAL) => {
                let state = runtime.state();
                render_progress(&state.progress_message(), state.eta_message(), &mut last_progress_line);
                render_connection(&state, &mut last_connection_line);
                if state.is_terminal() {
                    break state;
                }
            }
        }
    };
    registry.cleanup_all();

    match outcome.status {
        JobStatus::Completed => {
            println!("generation complete ({} tokens)", outcome.token_count);
            if let Some(final_content) = outcome.final_content.as_deref() {
                println!("{final_content}");
            }
            Ok(())
        }
        JobStatus::Canceled => {
            println!("generation canceled");
            Ok(())
        }
        JobStatus::Failed => {
            let message = outcome
                .error
                .as_ref()
                .map(|failure| failure.message.clone())
                .unwrap_or_else(|| "unknown failure".to_string());
            if outcome.can_retry {
                bail!("generation failed (retryable): {message}");
            }
            bail!("generation failed: {message}");
        }
        other => bail!("generation ended in unexpected state {}", other.as_str()),
    }
}

fn render_progress(message: &str, eta: Option<String>, last_line: &mut String) {
    let line = match eta {
        Some(eta) => format!("{message} - {eta}"),
        None => message.to_string(),
    };
    if line != *last_line {
        println!("{line}");
        *last_line = line;
    }
}

fn render_connection(state: &quill_job::JobState, last_line: &mut String) {
    let connection = &state.connection;
    let line = match connection.state {
        ConnectionState::Retrying => format!(
            "connection lost, retry {}/{} in {}s",
            connection.retry_count,
            connection.max_retries,
            connection.next_retry_in_seconds.unwrap_or_default()
        ),
        ConnectionState::CircuitOpen => format!(
            "connection paused after repeated failures, cooling down {}s",
            connection.next_retry_in_seconds.unwrap_or_default()
        ),
        _ => String::new(),
    };
    if line != *last_line {
        if !line.is_empty() {
            println!("{line}");
        }
        *last_line = line;
    }
}
