//! PDF text extraction
//!
//! Strategy A parses the PDF in-process with `pdf-extract`. If it never
//! yields text, strategy B pipes the bytes through the `pdftotext` CLI.
//! Each strategy gets its own retry envelope; an empty string means both
//! came up empty.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::config::ToolConfig;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// 3 attempts per strategy, waiting 300ms * attempt between them
pub const EXTRACT_RETRY: RetryPolicy = RetryPolicy::linear(3, Duration::from_millis(300));

/// Library diagnostics that show up on most real-world PDFs
const NOISY_DIAGNOSTICS: &[&str] = &["FormatError", "Indexing all PDF objects"];

const MISSING_TOOL: &str = "pdftotext command not found. Install the \"poppler-utils\" package.";

/// The external `pdftotext` converter
pub struct PdfToText {
    program: String,
    auto_install: bool,
    available: OnceCell<PathBuf>,
}

impl PdfToText {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            program: config.pdftotext_path.clone(),
            auto_install: config.auto_install,
            available: OnceCell::new(),
        }
    }

    /// Resolve the tool, installing poppler-utils once if allowed.
    ///
    /// A missing tool is `Error::Fatal`: retrying cannot fix a deployment.
    pub async fn ensure_available(&self) -> Result<&Path> {
        let path = self
            .available
            .get_or_try_init(|| async {
                if let Some(path) = find_executable(&self.program) {
                    return Ok(path);
                }
                if self.auto_install {
                    install_poppler().await;
                    if let Some(path) = find_executable(&self.program) {
                        info!("pdftotext installed at {:?}", path);
                        return Ok(path);
                    }
                }
                error!("pdftotext command not found (looked for '{}')", self.program);
                Err(Error::fatal(MISSING_TOOL))
            })
            .await?;
        Ok(path.as_path())
    }

    /// One conversion run: PDF bytes on stdin, UTF-8 layout text on stdout.
    async fn convert(&self, program: &Path, bytes: Arc<Vec<u8>>) -> anyhow::Result<String> {
        let mut child = Command::new(program)
            .args(["-q", "-enc", "UTF-8", "-layout", "-", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn pdftotext")?;

        // Feed stdin concurrently so a large stdout can't stall the child
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&bytes).await {
                    debug!("pdftotext closed stdin early: {}", e);
                }
            })
        });

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for pdftotext")?;
        if let Some(writer) = writer {
            let _ = writer.await;
        }

        if !output.status.success() {
            bail!(
                "pdftotext exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Look `program` up the way a shell would: as a path if it has a separator,
/// otherwise through `$PATH`.
fn find_executable(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|path| path.is_file())
}

async fn install_poppler() {
    warn!("Attempting to install pdftotext via apt-get");
    for args in [&["update"][..], &["install", "-y", "poppler-utils"][..]] {
        let status = Command::new("apt-get")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                error!("Failed to install pdftotext: apt-get {:?} exited with {}", args, status);
                return;
            }
            Err(e) => {
                error!("Failed to install pdftotext: {}", e);
                return;
            }
        }
    }
}

pub struct TextExtractor {
    pdftotext: PdfToText,
    library_retry: RetryPolicy,
    tool_retry: RetryPolicy,
}

impl TextExtractor {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            pdftotext: PdfToText::new(config),
            library_retry: EXTRACT_RETRY,
            tool_retry: EXTRACT_RETRY,
        }
    }

    pub fn with_retry(mut self, library: RetryPolicy, tool: RetryPolicy) -> Self {
        self.library_retry = library;
        self.tool_retry = tool;
        self
    }

    /// Precondition check for producers: fail before a job is ever queued.
    pub async fn ensure_tool(&self) -> Result<()> {
        self.pdftotext.ensure_available().await.map(|_| ())
    }

    /// Extract plain text, or `""` if neither strategy produced any.
    pub async fn extract_text(&self, pdf: &[u8]) -> Result<String> {
        let bytes = Arc::new(pdf.to_vec());

        let attempts = self.library_retry.attempts.max(1);
        for attempt in 1..=attempts {
            match extract_in_process(bytes.clone()).await {
                Ok(text) if !text.trim().is_empty() => return Ok(text),
                Ok(_) => debug!("pdf-extract attempt {} found no text", attempt),
                Err(e) => log_library_failure(attempt, &e),
            }
            tokio::time::sleep(self.library_retry.delay_after(attempt)).await;
        }

        let program = self.pdftotext.ensure_available().await?.to_path_buf();
        let attempts = self.tool_retry.attempts.max(1);
        for attempt in 1..=attempts {
            match self.pdftotext.convert(&program, bytes.clone()).await {
                Ok(text) if !text.trim().is_empty() => return Ok(text),
                Ok(_) => debug!("pdftotext attempt {} found no text", attempt),
                Err(e) => warn!("pdftotext attempt {} failed: {:#}", attempt, e),
            }
            tokio::time::sleep(self.tool_retry.delay_after(attempt)).await;
        }

        warn!("No text extracted from PDF ({} bytes)", pdf.len());
        Ok(String::new())
    }
}

/// pdf-extract is synchronous and may panic on malformed input
async fn extract_in_process(bytes: Arc<Vec<u8>>) -> anyhow::Result<String> {
    tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
        .await
        .map_err(|e| anyhow!("pdf-extract panicked: {}", e))?
        .map_err(|e| anyhow!("{}", e))
}

fn log_library_failure(attempt: u32, err: &anyhow::Error) {
    let msg = err.to_string();
    if NOISY_DIAGNOSTICS.iter().any(|noise| msg.contains(noise)) {
        debug!("pdf-extract attempt {} failed: {}", attempt, msg);
    } else {
        warn!("pdf-extract attempt {} failed: {}", attempt, msg);
    }
}
