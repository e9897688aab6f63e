//! S3/MinIO artifact storage for rendered transcripts

use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use aws_sdk_s3::Client;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::info;

use crate::config::StorageConfig;
use crate::error::Result;

pub const PDF_CONTENT_TYPE: &str = "application/pdf";

/// Escaped in object URLs: everything but unreserved characters and `@`
const KEY_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'@');

/// Object key for a student's transcript
pub fn transcript_key(exam_key: &str, email: &str) -> String {
    format!("transcript-{}-{}.pdf", exam_key, email)
}

/// Durable storage for generated artifacts
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under `key` and return a URL that serves them.
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;
}

/// S3/MinIO storage client
#[derive(Clone)]
pub struct StorageClient {
    client: Client,
    bucket: String,
    public_read: bool,
    url_base: String,
}

impl StorageClient {
    pub fn new(config: &StorageConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "exam-pipeline",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials);
        if let Some(endpoint) = &config.endpoint {
            info!("Using S3-compatible storage at {}", endpoint);
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            public_read: config.public_read,
            url_base: url_base(config),
        }
    }

    pub fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.url_base, utf8_percent_encode(key, KEY_ENCODE))
    }
}

/// Base that object keys are appended to.
///
/// Public URL if configured, else path-style endpoint, else AWS virtual-host.
fn url_base(config: &StorageConfig) -> String {
    if let Some(public) = &config.public_url {
        return public.trim_end_matches('/').to_string();
    }
    match &config.endpoint {
        Some(endpoint) => format!("{}/{}", endpoint.trim_end_matches('/'), config.bucket),
        None => format!("https://{}.s3.{}.amazonaws.com", config.bucket, config.region),
    }
}

#[async_trait]
impl ArtifactStore for StorageClient {
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let size = bytes.len();
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes));
        if self.public_read {
            request = request.acl(ObjectCannedAcl::PublicRead);
        }
        request
            .send()
            .await
            .with_context(|| format!("Failed to upload {}", key))?;

        let url = self.object_url(key);
        info!("Uploaded {} ({} bytes) to {}", key, size, url);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StorageConfig {
        StorageConfig {
            endpoint: None,
            region: "eu-west-1".into(),
            access_key: "minioadmin".into(),
            secret_key: "minioadmin".into(),
            bucket: "exam-transcripts".into(),
            public_url: None,
            public_read: false,
        }
    }

    #[test]
    fn test_transcript_key() {
        assert_eq!(
            transcript_key("MTH101", "ada@example.com"),
            "transcript-MTH101-ada@example.com.pdf"
        );
    }

    #[test]
    fn test_url_base_aws() {
        assert_eq!(
            url_base(&config()),
            "https://exam-transcripts.s3.eu-west-1.amazonaws.com"
        );
    }

    #[test]
    fn test_url_base_endpoint_and_public() {
        let mut cfg = config();
        cfg.endpoint = Some("http://localhost:9000/".into());
        assert_eq!(url_base(&cfg), "http://localhost:9000/exam-transcripts");

        cfg.public_url = Some("https://cdn.example.com/transcripts/".into());
        assert_eq!(url_base(&cfg), "https://cdn.example.com/transcripts");
    }

    #[tokio::test]
    async fn test_object_url() {
        let client = StorageClient::new(&config());
        assert_eq!(
            client.object_url("transcript-MTH101-ada@example.com.pdf"),
            "https://exam-transcripts.s3.eu-west-1.amazonaws.com/transcript-MTH101-ada@example.com.pdf"
        );
    }

    #[tokio::test]
    async fn test_object_url_escapes_reserved_characters() {
        let client = StorageClient::new(&config());
        let key = transcript_key("MTH 101", "a+b%c@example.com");
        assert_eq!(
            client.object_url(&key),
            "https://exam-transcripts.s3.eu-west-1.amazonaws.com/transcript-MTH%20101-a%2Bb%25c@example.com.pdf"
        );
    }
}
