use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};

use exam_pipeline::ai::{AiClient, GeminiClient};
use exam_pipeline::config::Config;
use exam_pipeline::exam::RedisExamRepository;
use exam_pipeline::extractor::TextExtractor;
use exam_pipeline::pipeline::{OpenExamProcessor, PdfJobProcessor};
use exam_pipeline::queue::{JobQueue, RedisJobStore, WorkerPool, PDF_QUEUE, SCHEDULER_QUEUE};
use exam_pipeline::storage::StorageClient;
use exam_pipeline::transcript::ChromiumRasterizer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("exam_pipeline=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    info!("Starting exam pipeline worker...");

    let store = RedisJobStore::connect(&config.redis_url, config.queue_prefix.clone()).await?;
    let exams = Arc::new(RedisExamRepository::new(
        store.connection(),
        config.queue_prefix.clone(),
    ));
    let queue = JobQueue::new(Arc::new(store));

    // Fail fast if the PDF-to-text fallback cannot be provisioned
    let extractor = Arc::new(TextExtractor::new(&config.tools));
    extractor.ensure_tool().await?;
    info!("pdftotext is available");

    let ai = AiClient::new(Arc::new(GeminiClient::new(config.ai.clone())));
    info!("AI client configured for model {}", config.ai.model);

    let storage = Arc::new(StorageClient::new(&config.storage));
    info!("Object storage client initialized for bucket {}", config.storage.bucket);

    let rasterizer = Arc::new(ChromiumRasterizer::new(config.tools.chrome_path.clone()));

    let pdf_processor = Arc::new(PdfJobProcessor::new(
        exams.clone(),
        extractor,
        ai,
        rasterizer,
        storage,
    ));
    let open_processor = Arc::new(OpenExamProcessor::new(exams));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = WorkerPool::new("pdf", queue.clone(), PDF_QUEUE, pdf_processor)
        .with_concurrency(config.pdf_workers)
        .spawn(shutdown_rx.clone());
    handles.extend(
        WorkerPool::new("scheduler", queue, SCHEDULER_QUEUE, open_processor).spawn(shutdown_rx),
    );

    info!("Waiting for jobs...");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, finishing in-flight jobs");
    shutdown_tx.send(true)?;

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Worker task ended abnormally: {}", e);
        }
    }
    info!("Exam pipeline worker stopped");
    Ok(())
}
