//! Dedicated worker threads for document conversion.
//!
//! Each worker is a named OS thread running its own current-thread tokio
//! runtime, so LibreOffice and image work never stalls the request runtime.
//! Workers share one bounded job queue.
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use crate::chat_db::{ChatDatabase, NewFileImage};
use crate::conversion::{ConversionError, DocumentKind, DocumentRenderer};
use crate::metrics;

pub const QUEUE_FULL_MESSAGE: &str = "Conversion queue is full";

/// One upload waiting to be rendered.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub file_id: i64,
    pub kind: DocumentKind,
    pub data: Vec<u8>,
    pub client_pages: Vec<Vec<u8>>,
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<ConversionJob>>>;

pub struct ConversionPool {
    sender: Mutex<Option<mpsc::Sender<ConversionJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    database: Arc<ChatDatabase>,
}

impl ConversionPool {
    pub fn start(
        workers: usize,
        queue_size: usize,
        database: Arc<ChatDatabase>,
        renderer: Arc<dyn DocumentRenderer>,
    ) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let receiver: SharedReceiver = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers.max(1));
        for i in 0..workers.max(1) {
            let name = format!("conversion-worker-{}", i);
            let receiver = receiver.clone();
            let database = database.clone();
            let renderer = renderer.clone();
            let handle = thread::Builder::new().name(name.clone()).spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create runtime for {}: {}", thread_name(), e);
                        return;
                    }
                };
                rt.block_on(run_worker_loop(receiver, database, renderer));
            })?;
            info!("Spawned worker thread: {}", name);
            handles.push(handle);
        }

        info!("Conversion pool started with {} workers, queue size {}", handles.len(), queue_size.max(1));
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            database,
        })
    }

    /// Queues a job without waiting. When the queue is full or closed the
    /// file is marked failed and `false` is returned.
    pub fn submit(&self, job: ConversionJob) -> anyhow::Result<bool> {
        let file_id = job.file_id;
        let sender = self
            .sender
            .lock()
            .map_err(|_| anyhow::anyhow!("Conversion pool lock poisoned"))?
            .clone();

        let reason = match sender.map(|s| s.try_send(job)) {
            Some(Ok(())) => {
                metrics::inc_conversion_queue();
                debug!(file_id, "Queued conversion job");
                return Ok(true);
            }
            Some(Err(TrySendError::Full(_))) => QUEUE_FULL_MESSAGE,
            Some(Err(TrySendError::Closed(_))) | None => "Conversion pool is shut down",
        };

        warn!(file_id, reason, "Conversion job rejected");
        metrics::inc_conversion_job("rejected");
        self.database.files.mark_failed(file_id, reason)?;
        Ok(false)
    }

    /// Closes the queue and waits for the workers to drain it.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let handles = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => return,
        };
        if handles.is_empty() {
            return;
        }
        info!("Shutting down conversion pool");
        for handle in handles {
            let _ = handle.join();
        }
        info!("Conversion pool shutdown complete");
    }
}

impl Drop for ConversionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn thread_name() -> String {
    thread::current().name().unwrap_or("conversion-worker").to_string()
}

async fn run_worker_loop(receiver: SharedReceiver, database: Arc<ChatDatabase>, renderer: Arc<dyn DocumentRenderer>) {
    loop {
        let job = receiver.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };
        metrics::dec_conversion_queue();
        process_job(&database, renderer.as_ref(), job).await;
    }
    debug!("Worker thread {} shutting down", thread_name());
}

/// Runs one job through `pending -> processing -> completed | failed`.
/// A job whose file is no longer pending is skipped.
pub(crate) async fn process_job(database: &ChatDatabase, renderer: &dyn DocumentRenderer, job: ConversionJob) {
    let file_id = job.file_id;
    match database.files.mark_processing(file_id) {
        Ok(true) => {}
        Ok(false) => {
            debug!(file_id, "File is not pending, skipping conversion");
            return;
        }
        Err(e) => {
            error!(file_id, "Failed to claim conversion job: {}", e);
            return;
        }
    }

    let started = Instant::now();
    let rendered = match renderer.render(job.kind, &job.data, &job.client_pages).await {
        Ok(pages) if pages.is_empty() => Err(ConversionError::NoPages),
        other => other,
    };

    match rendered {
        Ok(pages) => {
            let count = pages.len();
            let images: Vec<NewFileImage> = pages.into_iter().map(Into::into).collect();
            match database.files.complete_with_images(file_id, &images) {
                Ok(_) => {
                    metrics::inc_conversion_job("completed");
                    info!(
                        file_id,
                        kind = %job.kind,
                        pages = count,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Conversion completed"
                    );
                }
                Err(e) => {
                    error!(file_id, "Failed to store converted pages: {}", e);
                    metrics::inc_conversion_job("failed");
                    if let Err(e) = database.files.mark_failed(file_id, &format!("Failed to store pages: {}", e)) {
                        error!(file_id, "Failed to mark file as failed: {}", e);
                    }
                }
            }
        }
        Err(err) => {
            warn!(file_id, kind = %job.kind, "Conversion failed: {}", err);
            metrics::inc_conversion_job("failed");
            if let Err(e) = database.files.mark_failed(file_id, &err.to_string()) {
                error!(file_id, "Failed to mark file as failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_db::ProcessingStatus;
    use crate::conversion::PageImage;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Renders `pages` pages, or fails when the input starts with `corrupt`.
    struct FakeRenderer {
        pages: usize,
        gate: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl DocumentRenderer for FakeRenderer {
        async fn render(
            &self,
            _kind: DocumentKind,
            data: &[u8],
            _client_pages: &[Vec<u8>],
        ) -> Result<Vec<PageImage>, ConversionError> {
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await.map_err(|_| ConversionError::NoPages)?;
            }
            if data.starts_with(b"corrupt") {
                return Err(ConversionError::ToolFailed {
                    tool: "LibreOffice".into(),
                    stderr: "source file could not be loaded".into(),
                });
            }
            Ok((1..=self.pages)
                .map(|page| PageImage {
                    page_number: page as i64,
                    data: vec![0xFF, 0xD8, page as u8],
                    width: 8,
                    height: 8,
                    mime_type: "image/jpeg".into(),
                })
                .collect())
        }
    }

    fn create_test_db() -> (Arc<ChatDatabase>, i64) {
        let db = Arc::new(ChatDatabase::new_in_memory().unwrap());
        let user = db.users.create_user("alice", "hash").unwrap().unwrap();
        (db, user.id)
    }

    fn create_test_job(db: &ChatDatabase, user_id: i64, data: &[u8]) -> ConversionJob {
        let file_id = db
            .files
            .create_file(user_id, "slides.pptx", "ppt", "application/vnd.ms-powerpoint", data)
            .unwrap();
        ConversionJob {
            file_id,
            kind: DocumentKind::Ppt,
            data: data.to_vec(),
            client_pages: Vec::new(),
        }
    }

    async fn wait_for_status(db: &ChatDatabase, file_id: i64, wanted: ProcessingStatus) {
        for _ in 0..200 {
            if db.files.get_status(file_id).unwrap() == Some(wanted) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("file {} never reached {}", file_id, wanted);
    }

    // ===== Lifecycle Tests =====

    #[tokio::test]
    async fn test_three_page_deck_completes() {
        let (db, user_id) = create_test_db();
        let pool = ConversionPool::start(2, 8, db.clone(), Arc::new(FakeRenderer { pages: 3, gate: None })).unwrap();
        let job = create_test_job(&db, user_id, b"PK deck");
        let file_id = job.file_id;

        assert!(pool.submit(job).unwrap());
        wait_for_status(&db, file_id, ProcessingStatus::Completed).await;

        let pages: Vec<i64> = db.files.list_images(file_id).unwrap().iter().map(|i| i.page_number).collect();
        assert_eq!(pages, vec![1, 2, 3]);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_corrupt_document_fails_without_images() {
        let (db, user_id) = create_test_db();
        let pool = ConversionPool::start(1, 8, db.clone(), Arc::new(FakeRenderer { pages: 3, gate: None })).unwrap();
        let job = create_test_job(&db, user_id, b"corrupt bytes");
        let file_id = job.file_id;

        pool.submit(job).unwrap();
        wait_for_status(&db, file_id, ProcessingStatus::Failed).await;

        let record = db.files.get_file(user_id, file_id).unwrap().unwrap();
        assert!(record.error_message.unwrap().contains("could not be loaded"));
        assert_eq!(db.files.count_images(file_id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_pages_is_a_failure() {
        let (db, user_id) = create_test_db();
        let job = create_test_job(&db, user_id, b"PK empty");
        let file_id = job.file_id;

        process_job(&db, &FakeRenderer { pages: 0, gate: None }, job).await;
        let record = db.files.get_file(user_id, file_id).unwrap().unwrap();
        assert_eq!(record.processing_status, ProcessingStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("Document produced no pages"));
    }

    #[tokio::test]
    async fn test_jobs_are_idempotent_per_file() {
        let (db, user_id) = create_test_db();
        let job = create_test_job(&db, user_id, b"PK deck");
        let file_id = job.file_id;
        let renderer = FakeRenderer { pages: 2, gate: None };

        process_job(&db, &renderer, job.clone()).await;
        process_job(&db, &renderer, job).await;
        assert_eq!(db.files.count_images(file_id).unwrap(), 2);
    }

    // ===== Backpressure Tests =====

    #[tokio::test]
    async fn test_full_queue_marks_file_failed() {
        let (db, user_id) = create_test_db();
        let gate = Arc::new(Semaphore::new(0));
        let renderer = FakeRenderer { pages: 1, gate: Some(gate.clone()) };
        let pool = ConversionPool::start(1, 1, db.clone(), Arc::new(renderer)).unwrap();

        let first = create_test_job(&db, user_id, b"one");
        let first_id = first.file_id;
        assert!(pool.submit(first).unwrap());
        wait_for_status(&db, first_id, ProcessingStatus::Processing).await;

        let second = create_test_job(&db, user_id, b"two");
        let second_id = second.file_id;
        assert!(pool.submit(second).unwrap());

        let third = create_test_job(&db, user_id, b"three");
        let third_id = third.file_id;
        assert!(!pool.submit(third).unwrap());
        let record = db.files.get_file(user_id, third_id).unwrap().unwrap();
        assert_eq!(record.processing_status, ProcessingStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some(QUEUE_FULL_MESSAGE));

        gate.add_permits(10);
        wait_for_status(&db, first_id, ProcessingStatus::Completed).await;
        wait_for_status(&db, second_id, ProcessingStatus::Completed).await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let (db, user_id) = create_test_db();
        let pool = ConversionPool::start(1, 4, db.clone(), Arc::new(FakeRenderer { pages: 1, gate: None })).unwrap();
        pool.shutdown();

        let job = create_test_job(&db, user_id, b"late");
        let file_id = job.file_id;
        assert!(!pool.submit(job).unwrap());
        assert_eq!(db.files.get_status(file_id).unwrap(), Some(ProcessingStatus::Failed));
    }
}
