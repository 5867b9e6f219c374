use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use courier_core::AllowList;
use courier_pipeline::{PipelineConfig, RetryOptions};
use courier_store::StoreConfig;

const MAX_CONCURRENT: i64 = 256;

/// Composition ids become one segment of object keys.
fn parse_composition_id(raw: &str) -> Result<String, String> {
    if raw.is_empty() || raw == "." || raw == ".." {
        return Err(format!("invalid composition id: {raw:?}"));
    }
    if let Some(c) = raw
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(format!("composition id may not contain {c:?}"));
    }
    Ok(raw.to_string())
}

#[derive(Debug, Parser)]
#[command(name = "courier", about = "Upload files and deliver them as one composition")]
pub struct CliConfig {
    /// Local data directory for uploaded objects (ignored when S3 is configured)
    #[arg(long, env = "COURIER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Composition id. A random one is generated when omitted.
    #[arg(long, value_parser = parse_composition_id)]
    pub composition: Option<String>,

    /// Upload attempts per file, including the first
    #[arg(long, env = "COURIER_MAX_RETRIES", default_value = "3")]
    pub max_retries: u32,

    /// Delay before the first retry (milliseconds)
    #[arg(long, default_value = "1000")]
    pub initial_delay_ms: u64,

    /// Upper bound for any retry delay (milliseconds)
    #[arg(long, default_value = "10000")]
    pub max_delay_ms: u64,

    /// Uploads in flight at once
    #[arg(
        long,
        env = "COURIER_MAX_CONCURRENT",
        default_value = "4",
        value_parser = clap::value_parser!(u16).range(1..=MAX_CONCURRENT)
    )]
    pub max_concurrent: u16,

    /// Override the allow-list size limit (bytes)
    #[arg(long)]
    pub max_size_bytes: Option<u64>,

    /// JSON file with `allowed_mime_types`, `allowed_extensions`, `max_size_bytes`
    #[arg(long)]
    pub allow_list: Option<PathBuf>,

    /// Per-file deadline covering all attempts (seconds)
    #[arg(long)]
    pub deadline_secs: Option<u64>,

    /// Files to attach
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

impl CliConfig {
    pub fn composition_id(&self) -> String {
        self.composition
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    /// Environment-derived store settings, with `--data-dir` taking precedence.
    pub fn store_config(&self) -> StoreConfig {
        let config = StoreConfig::from_env();
        match &self.data_dir {
            Some(dir) => config.with_local_dir(dir.to_string_lossy()),
            None => config,
        }
    }

    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut allow_list = match &self.allow_list {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("read allow-list {}", path.display()))?;
                serde_json::from_str::<AllowList>(&raw)
                    .with_context(|| format!("parse allow-list {}", path.display()))?
            }
            None => AllowList::default(),
        };
        if let Some(max) = self.max_size_bytes {
            allow_list = allow_list.with_max_size(max);
        }

        let retry = RetryOptions {
            max_retries: self.max_retries,
            initial_delay_ms: self.initial_delay_ms,
            max_delay_ms: self.max_delay_ms,
            ..RetryOptions::default()
        };

        let mut config = PipelineConfig::default()
            .with_retry(retry)
            .with_max_concurrent(usize::from(self.max_concurrent))
            .with_allow_list(allow_list);
        if let Some(secs) = self.deadline_secs {
            config = config.with_upload_deadline(Duration::from_secs(secs));
        }
        Ok(config)
    }
}
