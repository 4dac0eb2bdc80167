//! Configuration loading: `.env` + environment variables, with an optional
//! JSON file applied on top. File values win, so a deployment can pin its
//! settings while the environment supplies machine-local paths and secrets.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context};
use auricle_core::{AuthHeader, PipelineConfig};
use serde::Deserialize;

/// Build the pipeline config from the environment, then apply `config_file`
/// overrides when given.
pub fn load_config(config_file: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    dotenvy::dotenv().ok();
    let mut config = config_from_env()?;
    if let Some(path) = config_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let overrides: ConfigOverrides = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        overrides.apply(&mut config);
    }
    Ok(config)
}

fn config_from_env() -> anyhow::Result<PipelineConfig> {
    let defaults = PipelineConfig::default();

    Ok(PipelineConfig {
        api_url: env_string("API_URL"),
        api_token: env_string("API_TOKEN"),
        auth_header: match env_string("AUTH_HEADER").as_deref() {
            None => defaults.auth_header,
            Some(raw) => parse_auth_header(raw)?,
        },

        whisper_backend: env_string("WHISPER_BACKEND").unwrap_or(defaults.whisper_backend),
        model_path: env_string("MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.model_path),
        model_name: env_string("MODEL_NAME").unwrap_or(defaults.model_name),
        language: env_string("SPEECH_LANGUAGE").unwrap_or(defaults.language),
        n_threads: env_parse("N_THREADS")?.unwrap_or(defaults.n_threads),

        sample_rate: env_parse("SAMPLE_RATE")?.unwrap_or(defaults.sample_rate),
        frame_duration_ms: env_parse("FRAME_DURATION_MS")?.unwrap_or(defaults.frame_duration_ms),
        vad_aggressiveness: env_parse("VAD_AGGRESSIVENESS")?.unwrap_or(defaults.vad_aggressiveness),
        silence_duration_ms: env_parse("SILENCE_DURATION_MS")?
            .unwrap_or(defaults.silence_duration_ms),
        min_recording_duration_ms: env_parse("MIN_RECORDING_DURATION_MS")?
            .unwrap_or(defaults.min_recording_duration_ms),

        connectivity_check_interval: env_parse("CONNECTIVITY_CHECK_INTERVAL")?
            .unwrap_or(defaults.connectivity_check_interval),
        send_check_interval: env_parse("SEND_CHECK_INTERVAL")?
            .unwrap_or(defaults.send_check_interval),
        request_timeout: env_parse("REQUEST_TIMEOUT")?.unwrap_or(defaults.request_timeout),
        max_retries: env_parse("MAX_RETRIES")?.unwrap_or(defaults.max_retries),
        base_retry_delay: env_parse("BASE_RETRY_DELAY")?.unwrap_or(defaults.base_retry_delay),
        max_retry_delay: env_parse("MAX_RETRY_DELAY")?.unwrap_or(defaults.max_retry_delay),
        max_concurrent_sends: env_parse("MAX_CONCURRENT_SENDS")?
            .unwrap_or(defaults.max_concurrent_sends),

        temp_dir: env_string("TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.temp_dir),
        output_dir: env_string("OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.output_dir),
        queue_dir: env_string("QUEUE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.queue_dir),
        log_dir: env_string("LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.log_dir),
    })
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        None => Ok(None),
        Some(raw) => match raw.parse::<T>() {
            Ok(value) => Ok(Some(value)),
            Err(e) => bail!("invalid {key}={raw}: {e}"),
        },
    }
}

fn parse_auth_header(raw: &str) -> anyhow::Result<AuthHeader> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "bearer" => Ok(AuthHeader::Bearer),
        "x-api-key" | "api-key" => Ok(AuthHeader::ApiKey),
        other => bail!("invalid AUTH_HEADER={other} (expected bearer or x-api-key)"),
    }
}

/// Per-key overrides from the optional JSON config file. Fields absent from
/// the file keep their environment-derived values.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigOverrides {
    api_url: Option<String>,
    api_token: Option<String>,
    auth_header: Option<AuthHeader>,

    whisper_backend: Option<String>,
    model_path: Option<PathBuf>,
    model_name: Option<String>,
    language: Option<String>,
    n_threads: Option<u32>,

    sample_rate: Option<u32>,
    frame_duration_ms: Option<u32>,
    vad_aggressiveness: Option<u8>,
    silence_duration_ms: Option<u32>,
    min_recording_duration_ms: Option<u32>,

    connectivity_check_interval: Option<u64>,
    send_check_interval: Option<u64>,
    request_timeout: Option<u64>,
    max_retries: Option<u32>,
    base_retry_delay: Option<u64>,
    max_retry_delay: Option<u64>,
    max_concurrent_sends: Option<usize>,

    temp_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    queue_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
}

impl ConfigOverrides {
    fn apply(self, config: &mut PipelineConfig) {
        macro_rules! apply_field {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = self.$field {
                    config.$field = value;
                })*
            };
        }

        if let Some(api_url) = self.api_url {
            config.api_url = Some(api_url);
        }
        if let Some(api_token) = self.api_token {
            config.api_token = Some(api_token);
        }
        apply_field!(
            auth_header,
            whisper_backend,
            model_path,
            model_name,
            language,
            n_threads,
            sample_rate,
            frame_duration_ms,
            vad_aggressiveness,
            silence_duration_ms,
            min_recording_duration_ms,
            connectivity_check_interval,
            send_check_interval,
            request_timeout,
            max_retries,
            base_retry_delay,
            max_retry_delay,
            max_concurrent_sends,
            temp_dir,
            output_dir,
            queue_dir,
            log_dir,
        );
    }
}
