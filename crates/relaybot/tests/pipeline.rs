use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::Notify;

use vidrelay_bot::drive::{RemoteObject, RemotePage, StorageProvider};
use vidrelay_bot::hydrax::{ImportResult, Importer};
use vidrelay_bot::messaging::{ChatApi, ChatError, Keyboard, MessageRef, Messenger};
use vidrelay_bot::pipeline::{InboundVideo, Pipeline, PipelineOutcome, VideoSource};
use vidrelay_bot::progress::ProgressReporter;
use vidrelay_bot::registry::{ProcessingStatus, Registry};
use vidrelay_bot::render;
use vidrelay_bot::stage::Stage;
use vidrelay_bot::supervisor::Supervisor;

const ITEM: &str = "msg-42";

#[derive(Default)]
struct FakeChat {
    edits: Mutex<Vec<(String, Option<Keyboard>)>>,
    replies: AtomicUsize,
    next_id: AtomicI64,
    panic_on: Option<&'static str>,
}

impl FakeChat {
    fn texts(&self) -> Vec<String> {
        self.edits.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    fn last(&self) -> (String, Option<Keyboard>) {
        self.edits.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl ChatApi for FakeChat {
    async fn send_message(
        &self,
        chat_id: i64,
        _text: &str,
        _keyboard: Option<&Keyboard>,
    ) -> Result<MessageRef, ChatError> {
        Ok(MessageRef {
            chat_id,
            message_id: 1000 + self.next_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn edit_message(
        &self,
        _message: MessageRef,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), ChatError> {
        if self.panic_on == Some(text) {
            panic!("renderer blew up");
        }
        self.edits
            .lock()
            .unwrap()
            .push((text.to_string(), keyboard.cloned()));
        Ok(())
    }

    async fn reply_to(
        &self,
        message: MessageRef,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<MessageRef, ChatError> {
        self.replies.fetch_add(1, Ordering::SeqCst);
        self.send_message(message.chat_id, text, keyboard).await
    }

    async fn delete_message(&self, _message: MessageRef) -> Result<(), ChatError> {
        Ok(())
    }
}

enum SourceMode {
    Deliver(Vec<u64>),
    DeliverThenCancel(Arc<Supervisor>),
    Fail,
    Hang(Arc<Notify>),
}

struct FakeSource {
    mode: SourceMode,
}

#[async_trait]
impl VideoSource for FakeSource {
    async fn download(&self, _video: &InboundVideo, dest: &Path, progress: ProgressReporter) -> Result<u64> {
        match &self.mode {
            SourceMode::Deliver(steps) => {
                tokio::fs::write(dest, vec![0u8; 100]).await?;
                for &done in steps {
                    progress.report(done, 100)?;
                }
                Ok(100)
            }
            SourceMode::DeliverThenCancel(supervisor) => {
                tokio::fs::write(dest, vec![0u8; 100]).await?;
                progress.report(100, 100)?;
                assert!(supervisor.cancel(ITEM));
                Ok(100)
            }
            SourceMode::Fail => {
                tokio::fs::write(dest, b"partial").await?;
                bail!("connection reset")
            }
            SourceMode::Hang(started) => {
                tokio::fs::write(dest, b"partial").await?;
                progress.report(10, 100)?;
                started.notify_one();
                std::future::pending().await
            }
        }
    }
}

#[derive(Default)]
struct FakeStorage {
    steps: Vec<u64>,
    cancel_at: Option<(u64, Arc<Supervisor>)>,
    fail: Option<&'static str>,
    cancel_on_finish: Option<Arc<Supervisor>>,
    staged_seen: Mutex<Vec<(PathBuf, bool, String)>>,
    deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl StorageProvider for FakeStorage {
    async fn upload(&self, local_path: &Path, name: &str, progress: ProgressReporter) -> Result<String> {
        self.staged_seen.lock().unwrap().push((
            local_path.to_path_buf(),
            local_path.exists(),
            name.to_string(),
        ));
        for &done in &self.steps {
            if let Some((at, supervisor)) = &self.cancel_at {
                if done == *at {
                    assert!(supervisor.cancel(ITEM));
                }
            }
            progress.report(done, 100)?;
        }
        if let Some(reason) = self.fail {
            bail!(reason);
        }
        if let Some(supervisor) = &self.cancel_on_finish {
            assert!(supervisor.cancel(ITEM));
        }
        Ok("drive-abc".to_string())
    }

    async fn delete(&self, storage_id: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(storage_id.to_string());
        Ok(())
    }

    async fn list(&self, _folder_id: &str, _page_token: Option<&str>, _page_size: u32) -> Result<RemotePage> {
        Ok(RemotePage::default())
    }

    async fn metadata(&self, _storage_id: &str) -> Result<Option<RemoteObject>> {
        Ok(None)
    }

    async fn account_email(&self) -> Result<String> {
        Ok("bot@example.com".to_string())
    }
}

struct FakeImporter {
    result: ImportResult,
    calls: Mutex<Vec<String>>,
    download_dir: PathBuf,
    staged_files_at_import: AtomicUsize,
    late_cancel: Option<Arc<Supervisor>>,
    late_cancel_accepted: Mutex<Option<bool>>,
}

impl FakeImporter {
    fn new(result: ImportResult, download_dir: &Path) -> Self {
        Self {
            result,
            calls: Mutex::new(Vec::new()),
            download_dir: download_dir.to_path_buf(),
            staged_files_at_import: AtomicUsize::new(0),
            late_cancel: None,
            late_cancel_accepted: Mutex::new(None),
        }
    }

    fn imported(slug: &str, download_dir: &Path) -> Self {
        Self::new(
            ImportResult::Imported {
                slug: slug.to_string(),
                video_status: None,
            },
            download_dir,
        )
    }
}

#[async_trait]
impl Importer for FakeImporter {
    async fn import(&self, storage_id: &str) -> ImportResult {
        self.calls.lock().unwrap().push(storage_id.to_string());
        self.staged_files_at_import
            .store(files_in(&self.download_dir), Ordering::SeqCst);
        if let Some(supervisor) = &self.late_cancel {
            *self.late_cancel_accepted.lock().unwrap() = Some(supervisor.cancel(ITEM));
        }
        self.result.clone()
    }
}

fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

struct Harness {
    _tmp: tempfile::TempDir,
    download_dir: PathBuf,
    registry: Arc<Registry>,
    supervisor: Arc<Supervisor>,
    chat: Arc<FakeChat>,
}

impl Harness {
    fn new() -> Self {
        Self::with_chat(FakeChat::default())
    }

    fn with_chat(chat: FakeChat) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        Self {
            download_dir: tmp.path().join("downloads"),
            _tmp: tmp,
            registry: Arc::new(Registry::open_in_memory().unwrap()),
            supervisor: Arc::new(Supervisor::new()),
            chat: Arc::new(chat),
        }
    }

    fn pipeline(&self, source: FakeSource, storage: Arc<FakeStorage>, importer: Arc<FakeImporter>) -> Pipeline {
        Pipeline::new(
            self.registry.clone(),
            Arc::new(Messenger::new(self.chat.clone())),
            self.supervisor.clone(),
            Arc::new(source),
            storage,
            importer,
            self.download_dir.clone(),
        )
    }

    fn assert_cleaned_up(&self) {
        let record = self.registry.processing_record(ITEM).unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Finished);
        assert!(!self.supervisor.contains(ITEM));
        assert_eq!(files_in(&self.download_dir), 0);
    }
}

fn video() -> InboundVideo {
    InboundVideo {
        item_id: ITEM.to_string(),
        message: MessageRef {
            chat_id: 7,
            message_id: 42,
        },
        file_id: "tg-file".to_string(),
        file_name: None,
        file_size: Some(100),
    }
}

#[tokio::test]
async fn video_is_relayed_end_to_end() {
    let h = Harness::new();
    let storage = Arc::new(FakeStorage {
        steps: vec![25, 50, 100],
        ..Default::default()
    });
    let importer = Arc::new(FakeImporter::imported("abc123", &h.download_dir));
    let pipeline = h.pipeline(
        FakeSource {
            mode: SourceMode::Deliver(vec![50, 100]),
        },
        storage.clone(),
        importer.clone(),
    );

    let outcome = pipeline.process(video()).await.unwrap();
    assert_eq!(
        outcome,
        PipelineOutcome::Completed {
            storage_id: "drive-abc".to_string(),
            slug: "abc123".to_string(),
        }
    );

    let upload_texts: Vec<String> = h
        .chat
        .texts()
        .into_iter()
        .filter(|t| t.starts_with("☁️"))
        .collect();
    assert_eq!(
        upload_texts,
        [
            render::stage_status(Stage::Upload, None),
            render::stage_status(Stage::Upload, Some(25)),
            render::stage_status(Stage::Upload, Some(50)),
            render::stage_status(Stage::Upload, Some(100)),
        ]
    );
    let (final_text, final_keyboard) = h.chat.last();
    assert_eq!(final_text, render::completed("abc123"));
    assert!(final_keyboard.is_none());

    let seen = storage.staged_seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].1, "staged file exists while uploading");
    assert_eq!(seen[0].2, "video_42.mp4");

    assert_eq!(*importer.calls.lock().unwrap(), ["drive-abc"]);
    assert_eq!(importer.staged_files_at_import.load(Ordering::SeqCst), 0);

    let uploaded = h.registry.uploaded_items().unwrap();
    assert_eq!(uploaded.len(), 1);
    assert_eq!(uploaded[0].storage_id, "drive-abc");
    assert_eq!(uploaded[0].display_name, "video_42.mp4");
    h.assert_cleaned_up();
}

#[tokio::test]
async fn cancelling_during_upload_leaves_no_trace() {
    let h = Harness::new();
    let storage = Arc::new(FakeStorage {
        steps: vec![25, 40, 60, 100],
        cancel_at: Some((40, h.supervisor.clone())),
        ..Default::default()
    });
    let importer = Arc::new(FakeImporter::imported("never", &h.download_dir));
    let pipeline = h.pipeline(
        FakeSource {
            mode: SourceMode::Deliver(vec![100]),
        },
        storage,
        importer.clone(),
    );

    let outcome = pipeline.process(video()).await.unwrap();
    assert_eq!(outcome, PipelineOutcome::Cancelled);

    let (final_text, final_keyboard) = h.chat.last();
    assert_eq!(final_text, render::CANCELLED);
    assert!(final_keyboard.is_none());
    assert!(!h
        .chat
        .texts()
        .contains(&render::stage_status(Stage::Upload, Some(50))));

    assert!(importer.calls.lock().unwrap().is_empty());
    assert!(h.registry.uploaded_items().unwrap().is_empty());
    h.assert_cleaned_up();
}

#[tokio::test]
async fn cancelling_a_silent_download_interrupts_it() {
    let h = Harness::new();
    let started = Arc::new(Notify::new());
    let importer = Arc::new(FakeImporter::imported("never", &h.download_dir));
    let pipeline = Arc::new(h.pipeline(
        FakeSource {
            mode: SourceMode::Hang(started.clone()),
        },
        Arc::new(FakeStorage::default()),
        importer,
    ));

    let run = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.process(video()).await }
    });
    started.notified().await;
    assert!(h.supervisor.cancel(ITEM));

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome, PipelineOutcome::Cancelled);
    h.assert_cleaned_up();
}

#[tokio::test]
async fn download_failure_is_reported_and_cleaned_up() {
    let h = Harness::new();
    let storage = Arc::new(FakeStorage::default());
    let importer = Arc::new(FakeImporter::imported("never", &h.download_dir));
    let pipeline = h.pipeline(FakeSource { mode: SourceMode::Fail }, storage.clone(), importer);

    match pipeline.process(video()).await.unwrap() {
        PipelineOutcome::Failed(reason) => assert_eq!(reason, "download failed: connection reset"),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(
        h.chat.last().0,
        render::unexpected_error("download failed: connection reset")
    );
    assert!(storage.staged_seen.lock().unwrap().is_empty());
    h.assert_cleaned_up();
}

#[tokio::test]
async fn upload_failure_is_reported_and_cleaned_up() {
    let h = Harness::new();
    let storage = Arc::new(FakeStorage {
        steps: vec![25],
        fail: Some("quota exceeded"),
        ..Default::default()
    });
    let importer = Arc::new(FakeImporter::imported("never", &h.download_dir));
    let pipeline = h.pipeline(
        FakeSource {
            mode: SourceMode::Deliver(vec![100]),
        },
        storage,
        importer.clone(),
    );

    match pipeline.process(video()).await.unwrap() {
        PipelineOutcome::Failed(reason) => assert!(reason.contains("quota exceeded")),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(importer.calls.lock().unwrap().is_empty());
    assert!(h.registry.uploaded_items().unwrap().is_empty());
    h.assert_cleaned_up();
}

#[tokio::test]
async fn refused_import_keeps_the_upload_and_reports_the_reason() {
    let h = Harness::new();
    let storage = Arc::new(FakeStorage {
        steps: vec![100],
        ..Default::default()
    });
    let importer = Arc::new(FakeImporter::new(
        ImportResult::Rejected {
            error: "file not public".to_string(),
        },
        &h.download_dir,
    ));
    let pipeline = h.pipeline(
        FakeSource {
            mode: SourceMode::Deliver(vec![100]),
        },
        storage,
        importer,
    );

    let outcome = pipeline.process(video()).await.unwrap();
    assert_eq!(
        outcome,
        PipelineOutcome::ImportFailed {
            storage_id: "drive-abc".to_string(),
            error: "file not public".to_string(),
        }
    );
    assert_eq!(h.chat.last().0, render::import_failed("file not public"));
    let uploaded = h.registry.uploaded_items().unwrap();
    assert_eq!(uploaded.len(), 1);
    assert_eq!(uploaded[0].storage_id, "drive-abc");
    assert_eq!(uploaded[0].display_name, "video_42.mp4");
    h.assert_cleaned_up();
}

#[tokio::test]
async fn duplicate_item_is_dropped_silently() {
    let h = Harness::new();
    assert!(h.registry.try_start(ITEM).unwrap());
    let importer = Arc::new(FakeImporter::imported("never", &h.download_dir));
    let pipeline = h.pipeline(
        FakeSource {
            mode: SourceMode::Deliver(vec![100]),
        },
        Arc::new(FakeStorage::default()),
        importer,
    );

    assert_eq!(pipeline.process(video()).await.unwrap(), PipelineOutcome::Dropped);
    assert_eq!(h.chat.replies.load(Ordering::SeqCst), 0);
    let record = h.registry.processing_record(ITEM).unwrap().unwrap();
    assert_eq!(record.status, ProcessingStatus::Processing);
}

#[tokio::test]
async fn panicking_status_update_still_finalizes_the_item() {
    let h = Harness::with_chat(FakeChat {
        panic_on: Some(render::IMPORTING),
        ..Default::default()
    });
    let importer = Arc::new(FakeImporter::imported("abc123", &h.download_dir));
    let pipeline = h.pipeline(
        FakeSource {
            mode: SourceMode::Deliver(vec![100]),
        },
        Arc::new(FakeStorage {
            steps: vec![100],
            ..Default::default()
        }),
        importer.clone(),
    );

    let outcome = pipeline.process(video()).await.unwrap();
    assert_eq!(outcome, PipelineOutcome::Failed("internal error".to_string()));
    assert!(importer.calls.lock().unwrap().is_empty());
    let (final_text, final_keyboard) = h.chat.last();
    assert_eq!(final_text, render::unexpected_error("internal error"));
    assert!(final_keyboard.is_none());
    h.assert_cleaned_up();
}

#[tokio::test]
async fn cancellation_is_ignored_once_importing() {
    let h = Harness::new();
    let mut importer = FakeImporter::imported("abc123", &h.download_dir);
    importer.late_cancel = Some(h.supervisor.clone());
    let importer = Arc::new(importer);
    let pipeline = h.pipeline(
        FakeSource {
            mode: SourceMode::Deliver(vec![100]),
        },
        Arc::new(FakeStorage {
            steps: vec![100],
            ..Default::default()
        }),
        importer.clone(),
    );

    let outcome = pipeline.process(video()).await.unwrap();
    assert!(matches!(outcome, PipelineOutcome::Completed { .. }));
    assert_eq!(*importer.late_cancel_accepted.lock().unwrap(), Some(false));
    h.assert_cleaned_up();
}

#[tokio::test]
async fn cancel_accepted_as_upload_finishes_removes_the_object() {
    let h = Harness::new();
    let storage = Arc::new(FakeStorage {
        steps: vec![100],
        cancel_on_finish: Some(h.supervisor.clone()),
        ..Default::default()
    });
    let importer = Arc::new(FakeImporter::imported("never", &h.download_dir));
    let pipeline = h.pipeline(
        FakeSource {
            mode: SourceMode::Deliver(vec![100]),
        },
        storage.clone(),
        importer.clone(),
    );

    let outcome = pipeline.process(video()).await.unwrap();
    assert_eq!(outcome, PipelineOutcome::Cancelled);
    assert_eq!(h.chat.last().0, render::CANCELLED);
    assert_eq!(*storage.deleted.lock().unwrap(), ["drive-abc"]);
    assert!(importer.calls.lock().unwrap().is_empty());
    assert!(h.registry.uploaded_items().unwrap().is_empty());
    h.assert_cleaned_up();
}

#[tokio::test]
async fn cancel_accepted_as_download_finishes_skips_the_upload() {
    let h = Harness::new();
    let storage = Arc::new(FakeStorage::default());
    let importer = Arc::new(FakeImporter::imported("never", &h.download_dir));
    let pipeline = h.pipeline(
        FakeSource {
            mode: SourceMode::DeliverThenCancel(h.supervisor.clone()),
        },
        storage.clone(),
        importer,
    );

    let outcome = pipeline.process(video()).await.unwrap();
    assert_eq!(outcome, PipelineOutcome::Cancelled);
    assert!(storage.staged_seen.lock().unwrap().is_empty());
    h.assert_cleaned_up();
}
