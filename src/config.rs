use std::time::Duration;

use anyhow::bail;
use clap::Parser;

use crate::services::channel::ChannelSettings;

/// Runtime configuration for the `bookforge` server.
///
/// Every value can be given as a CLI flag or an environment variable (a
/// `.env` file is loaded first). The defaults match the batch and progress
/// cadence the web client expects.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "bookforge",
    version,
    about = "Generates books chapter by chapter and streams progress"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:3000"))]
    pub server_addr: String,

    /// Messages endpoint of the text-generation backend.
    ///
    /// Environment variable: `LLM_API_URL`
    #[arg(
        long,
        env = "LLM_API_URL",
        default_value_t = String::from("https://api.anthropic.com/v1/messages")
    )]
    pub llm_api_url: String,

    /// API key for the backend. Without one, chapters are filled with sample
    /// content so the rest of the pipeline can be exercised offline.
    ///
    /// Environment variable: `LLM_API_KEY`
    #[arg(long, env = "LLM_API_KEY", hide_env_values = true)]
    pub llm_api_key: Option<String>,

    /// Model used for the fast tier (regular chapters, outlines).
    ///
    /// Environment variable: `LLM_FAST_MODEL`
    #[arg(long, env = "LLM_FAST_MODEL", default_value_t = String::from("claude-3-5-haiku-20241022"))]
    pub llm_fast_model: String,

    /// Model used for the premium tier (hook chapters).
    ///
    /// Environment variable: `LLM_PREMIUM_MODEL`
    #[arg(long, env = "LLM_PREMIUM_MODEL", default_value_t = String::from("claude-sonnet-4-5"))]
    pub llm_premium_model: String,

    /// Upper bound on tokens generated per chapter.
    ///
    /// Environment variable: `LLM_MAX_TOKENS`
    #[arg(long, env = "LLM_MAX_TOKENS", default_value_t = 8192)]
    pub llm_max_tokens: u32,

    /// Number of chapters generated concurrently. The next batch starts only
    /// after every chapter of the current one has finished or failed.
    ///
    /// Environment variable: `BATCH_SIZE`
    #[arg(long, env = "BATCH_SIZE", default_value_t = 5)]
    pub batch_size: usize,

    /// Per-chapter generation timeout, in seconds.
    ///
    /// Environment variable: `CHAPTER_TIMEOUT_SECS`
    #[arg(long, env = "CHAPTER_TIMEOUT_SECS", default_value_t = 300)]
    pub chapter_timeout_secs: u64,

    /// How long a job stays in the registry after it was created.
    ///
    /// Environment variable: `JOB_RETENTION_SECS`
    #[arg(long, env = "JOB_RETENTION_SECS", default_value_t = 300)]
    pub job_retention_secs: u64,

    /// How long an evicted id keeps answering "not found" instead of
    /// "waiting".
    ///
    /// Environment variable: `TOMBSTONE_RETENTION_SECS`
    #[arg(long, env = "TOMBSTONE_RETENTION_SECS", default_value_t = 3600)]
    pub tombstone_retention_secs: u64,

    /// Interval between progress events, in milliseconds.
    ///
    /// Environment variable: `PROGRESS_INTERVAL_MS`
    #[arg(long, env = "PROGRESS_INTERVAL_MS", default_value_t = 1000)]
    pub progress_interval_ms: u64,

    /// Ticks a progress stream waits for a job that does not exist yet.
    ///
    /// Environment variable: `PROGRESS_WAIT_ATTEMPTS`
    #[arg(long, env = "PROGRESS_WAIT_ATTEMPTS", default_value_t = 15)]
    pub progress_wait_attempts: u32,

    /// Hard limit on the lifetime of one progress stream, in seconds.
    ///
    /// Environment variable: `PROGRESS_TIMEOUT_SECS`
    #[arg(long, env = "PROGRESS_TIMEOUT_SECS", default_value_t = 600)]
    pub progress_timeout_secs: u64,

    /// Events buffered per progress subscriber before ticks are dropped.
    ///
    /// Environment variable: `CHANNEL_BUFFER`
    #[arg(long, env = "CHANNEL_BUFFER", default_value_t = 4)]
    pub channel_buffer: usize,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub fast_model: String,
    pub premium_model: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server_addr: String,
    pub llm: LlmConfig,
    pub batch_size: usize,
    pub chapter_timeout: Duration,
    pub job_retention: Duration,
    pub tombstone_retention: Duration,
    pub channel: ChannelSettings,
}

impl TryFrom<CliArgs> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.batch_size == 0 {
            bail!("BATCH_SIZE must be greater than 0");
        }
        if args.progress_interval_ms == 0 {
            bail!("PROGRESS_INTERVAL_MS must be greater than 0");
        }
        if args.channel_buffer == 0 {
            bail!("CHANNEL_BUFFER must be greater than 0");
        }
        if args.job_retention_secs == 0 {
            bail!("JOB_RETENTION_SECS must be greater than 0");
        }
        if args.chapter_timeout_secs == 0 {
            bail!("CHAPTER_TIMEOUT_SECS must be greater than 0");
        }

        let api_key = args
            .llm_api_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());

        Ok(Self {
            server_addr: args.server_addr,
            llm: LlmConfig {
                api_url: args.llm_api_url,
                api_key,
                fast_model: args.llm_fast_model,
                premium_model: args.llm_premium_model,
                max_tokens: args.llm_max_tokens,
            },
            batch_size: args.batch_size,
            chapter_timeout: Duration::from_secs(args.chapter_timeout_secs),
            job_retention: Duration::from_secs(args.job_retention_secs),
            tombstone_retention: Duration::from_secs(args.tombstone_retention_secs),
            channel: ChannelSettings {
                interval: Duration::from_millis(args.progress_interval_ms),
                max_wait_attempts: args.progress_wait_attempts,
                timeout: Duration::from_secs(args.progress_timeout_secs),
                buffer: args.channel_buffer,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<AppConfig> {
        let mut argv = vec!["bookforge"];
        argv.extend_from_slice(args);
        AppConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_match_the_client_contract() {
        let config = parse(&["--llm-api-key", ""]).unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.job_retention, Duration::from_secs(300));
        assert_eq!(config.channel.interval, Duration::from_secs(1));
        assert_eq!(config.channel.max_wait_attempts, 15);
        assert_eq!(config.channel.timeout, Duration::from_secs(600));
        assert!(config.llm.api_key.is_none());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = parse(&["--batch-size", "0"]).unwrap_err();
        assert!(err.to_string().contains("BATCH_SIZE"));
    }
}
