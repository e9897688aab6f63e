//! Process configuration
//!
//! Loaded once from the environment at startup and handed to each component.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// AI service settings
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

/// Object storage settings (AWS S3 or MinIO)
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Custom endpoint for MinIO-style deployments; None means AWS
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    /// Base URL used for returned artifact links
    pub public_url: Option<String>,
    pub public_read: bool,
}

/// PDF conversion tooling
#[derive(Debug, Clone)]
pub struct ToolConfig {
    pub pdftotext_path: String,
    pub auto_install: bool,
    pub chrome_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub queue_prefix: String,
    pub upload_dir: PathBuf,
    pub pdf_workers: usize,
    pub ai: AiConfig,
    pub storage: StorageConfig,
    pub tools: ToolConfig,
}

impl Config {
    /// Build configuration from environment variables.
    ///
    /// The only required value is the AI API key; everything else has a default.
    pub fn from_env() -> Result<Self> {
        let api_key = env_opt("GEMINI_API_KEY")
            .or_else(|| env_opt("GEMINI_KEY"))
            .ok_or_else(|| Error::fatal("GEMINI_API_KEY is not configured"))?;

        let pdf_workers = match env_opt("PDF_WORKERS") {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| Error::fatal(format!("Invalid PDF_WORKERS: {}", raw)))?,
            None => 4,
        };

        Ok(Self {
            redis_url: env_or("REDIS_URL", "redis://localhost:6379"),
            queue_prefix: env_or("QUEUE_PREFIX", "exam"),
            upload_dir: env_opt("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            pdf_workers: pdf_workers.max(1),
            ai: AiConfig {
                api_key,
                model: env_or("GEMINI_MODEL", "gemini-2.0-flash"),
                base_url: env_or(
                    "GEMINI_BASE_URL",
                    "https://generativelanguage.googleapis.com/v1beta",
                ),
            },
            storage: StorageConfig {
                endpoint: env_opt("S3_ENDPOINT"),
                region: env_or("S3_REGION", "us-east-1"),
                access_key: env_or("S3_ACCESS_KEY", "minioadmin"),
                secret_key: env_or("S3_SECRET_KEY", "minioadmin"),
                bucket: env_or("S3_BUCKET", "exam-transcripts"),
                public_url: env_opt("S3_PUBLIC_URL"),
                public_read: env_flag("S3_PUBLIC_READ", false),
            },
            tools: ToolConfig {
                pdftotext_path: env_or("PDFTOTEXT_PATH", "pdftotext"),
                auto_install: env_flag("PDFTOTEXT_AUTO_INSTALL", true),
                chrome_path: env_opt("CHROME_PATH").map(PathBuf::from),
            },
        })
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.into())
}

fn env_flag(key: &str, default: bool) -> bool {
    env_opt(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}
