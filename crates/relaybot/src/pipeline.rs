//! Per-item orchestration: admission, download, upload, import and cleanup.
//!
//! ```text
//! Admitted -> Downloading -> Uploading -> Importing -> Completed
//!                 \______________\____________\______-> Cancelled | Failed
//! ```
//!
//! Whatever the terminal state, the registry record is marked finished, the
//! cancellation handle is removed and the staged file is deleted before
//! [`Pipeline::process`] returns. That holds even if a step panics.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::drive::StorageProvider;
use crate::hydrax::{ImportResult, Importer};
use crate::messaging::{MessageRef, Messenger};
use crate::progress::{MilestoneTracker, ProgressReporter};
use crate::registry::Registry;
use crate::render;
use crate::stage::{Stage, StageContext, StageOutcome};
use crate::supervisor::Supervisor;
use crate::util::remove_file_if_exists;

const INTERNAL_ERROR: &str = "internal error";

/// A video received from chat, ready to be relayed.
#[derive(Debug, Clone)]
pub struct InboundVideo {
    pub item_id: String,
    pub message: MessageRef,
    pub file_id: String,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
}

impl InboundVideo {
    /// The sender's file name, or `video_<message id>.mp4`.
    pub fn display_name(&self) -> String {
        match self.file_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("video_{}.mp4", self.message.message_id),
        }
    }
}

#[async_trait]
pub trait VideoSource: Send + Sync {
    /// Writes the video to `dest` and returns the byte count.
    async fn download(&self, video: &InboundVideo, dest: &Path, progress: ProgressReporter) -> Result<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Admitted,
    Downloading,
    Uploading,
    Importing,
    Completed,
    Cancelled,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Admitted => "admitted",
            Self::Downloading => "downloading",
            Self::Uploading => "uploading",
            Self::Importing => "importing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Another orchestrator already owns the item.
    Dropped,
    Completed { storage_id: String, slug: String },
    /// The object stays in storage; only the import was refused.
    ImportFailed { storage_id: String, error: String },
    Cancelled,
    Failed(String),
}

impl PipelineOutcome {
    pub fn state(&self) -> Option<PipelineState> {
        match self {
            Self::Dropped => None,
            Self::Completed { .. } => Some(PipelineState::Completed),
            Self::Cancelled => Some(PipelineState::Cancelled),
            Self::ImportFailed { .. } | Self::Failed(_) => Some(PipelineState::Failed),
        }
    }
}

pub struct Pipeline {
    registry: Arc<Registry>,
    messenger: Arc<Messenger>,
    supervisor: Arc<Supervisor>,
    source: Arc<dyn VideoSource>,
    storage: Arc<dyn StorageProvider>,
    importer: Arc<dyn Importer>,
    download_dir: PathBuf,
}

impl Pipeline {
    pub fn new(
        registry: Arc<Registry>,
        messenger: Arc<Messenger>,
        supervisor: Arc<Supervisor>,
        source: Arc<dyn VideoSource>,
        storage: Arc<dyn StorageProvider>,
        importer: Arc<dyn Importer>,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            messenger,
            supervisor,
            source,
            storage,
            importer,
            download_dir: download_dir.into(),
        }
    }

    /// Takes one video through the whole relay.
    ///
    /// Only an admission failure is returned as `Err`; everything after
    /// admission ends in a [`PipelineOutcome`].
    pub async fn process(&self, video: InboundVideo) -> Result<PipelineOutcome> {
        let item_id = video.item_id.clone();
        let admitted = {
            let id = item_id.clone();
            self.registry
                .run(move |r| r.try_start(&id))
                .await
                .with_context(|| format!("admission of item {item_id} failed"))?
        };
        if !admitted {
            info!("item {item_id} is already being processed, dropping");
            return Ok(PipelineOutcome::Dropped);
        }
        self.enter(&item_id, PipelineState::Admitted);

        let token = self.supervisor.register(&item_id);
        let staged = self.staging_path(&video);
        let mut status = None;

        let run = AssertUnwindSafe(self.drive(&video, &token, &staged, &mut status))
            .catch_unwind()
            .await;
        let outcome = match run {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("item {item_id}: pipeline panicked");
                if let Some(status) = status {
                    let text = render::unexpected_error(INTERNAL_ERROR);
                    if let Err(e) = self.messenger.edit(status, &text, None).await {
                        warn!("item {item_id}: failed to report error: {e}");
                    }
                }
                PipelineOutcome::Failed(INTERNAL_ERROR.to_string())
            }
        };

        remove_file_if_exists(&staged).await;
        self.finalize(&item_id, status).await;
        if let Some(state) = outcome.state() {
            self.enter(&item_id, state);
        }
        Ok(outcome)
    }

    fn staging_path(&self, video: &InboundVideo) -> PathBuf {
        let safe: String = video
            .display_name()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.download_dir.join(format!("{}_{safe}", Uuid::new_v4()))
    }

    fn enter(&self, item_id: &str, state: PipelineState) {
        info!("item {item_id}: {state}");
    }

    async fn drive(
        &self,
        video: &InboundVideo,
        token: &CancellationToken,
        staged: &Path,
        status: &mut Option<MessageRef>,
    ) -> PipelineOutcome {
        match self.stages(video, token, staged, status).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let reason = format!("{e:#}");
                error!("item {}: {reason}", video.item_id);
                if let Some(status) = *status {
                    let text = render::unexpected_error(&reason);
                    if let Err(render_err) = self.messenger.edit(status, &text, None).await {
                        warn!("item {}: failed to report error: {render_err}", video.item_id);
                    }
                }
                PipelineOutcome::Failed(reason)
            }
        }
    }

    async fn stages(
        &self,
        video: &InboundVideo,
        token: &CancellationToken,
        staged: &Path,
        status_slot: &mut Option<MessageRef>,
    ) -> Result<PipelineOutcome> {
        let status = self
            .messenger
            .reply(video.message, render::PREPARING, None)
            .await
            .context("failed to send status message")?;
        *status_slot = Some(status);

        let keyboard = render::cancel_keyboard(&video.item_id);
        let ctx = StageContext {
            item_id: &video.item_id,
            status,
            cancel_keyboard: &keyboard,
            messenger: self.messenger.as_ref(),
            supervisor: self.supervisor.as_ref(),
            token,
        };

        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .with_context(|| format!("failed to create {}", self.download_dir.display()))?;

        self.enter(&video.item_id, PipelineState::Downloading);
        let mut tracker = MilestoneTracker::default();
        let download = {
            let source = Arc::clone(&self.source);
            let video = video.clone();
            let dest = staged.to_path_buf();
            move |reporter: ProgressReporter| async move { source.download(&video, &dest, reporter).await }
        };
        match ctx.run(Stage::Download, &mut tracker, download).await {
            // A cancel accepted as the download finished still stops the item.
            StageOutcome::Completed(_) if token.is_cancelled() => return Ok(self.cancelled(&ctx).await),
            StageOutcome::Completed(bytes) => debug!("item {}: {bytes} bytes staged", video.item_id),
            StageOutcome::Cancelled => return Ok(self.cancelled(&ctx).await),
            StageOutcome::Failed(e) => return Err(e.context("download failed")),
        }
        ctx.finish_progress(Stage::Download, &mut tracker).await;

        self.enter(&video.item_id, PipelineState::Uploading);
        let display_name = video.display_name();
        let mut tracker = MilestoneTracker::default();
        let upload = {
            let storage = Arc::clone(&self.storage);
            let path = staged.to_path_buf();
            let name = display_name.clone();
            move |reporter: ProgressReporter| async move { storage.upload(&path, &name, reporter).await }
        };
        let storage_id = match ctx.run(Stage::Upload, &mut tracker, upload).await {
            StageOutcome::Completed(id) => id,
            StageOutcome::Cancelled => return Ok(self.cancelled(&ctx).await),
            StageOutcome::Failed(e) => return Err(e.context("upload failed")),
        };
        if !self.supervisor.close_cancellation(&video.item_id) {
            info!("item {}: cancelled as the upload finished, removing {storage_id}", video.item_id);
            if let Err(e) = self.storage.delete(&storage_id).await {
                warn!("item {}: failed to remove {storage_id}: {e:#}", video.item_id);
            }
            return Ok(self.cancelled(&ctx).await);
        }
        ctx.finish_progress(Stage::Upload, &mut tracker).await;
        remove_file_if_exists(staged).await;

        let (id, name) = (storage_id.clone(), display_name.clone());
        if let Err(e) = self.registry.run(move |r| r.record_uploaded(&id, &name)).await {
            warn!("item {}: failed to record upload {storage_id}: {e:#}", video.item_id);
        }

        self.enter(&video.item_id, PipelineState::Importing);
        ctx.show(render::IMPORTING, false).await;
        match self.importer.import(&storage_id).await {
            ImportResult::Imported { slug, video_status } => {
                debug!("item {}: Hydrax video status {video_status:?}", video.item_id);
                ctx.show(&render::completed(&slug), false).await;
                Ok(PipelineOutcome::Completed { storage_id, slug })
            }
            ImportResult::Rejected { error } => {
                ctx.show(&render::import_failed(&error), false).await;
                Ok(PipelineOutcome::ImportFailed { storage_id, error })
            }
        }
    }

    async fn cancelled(&self, ctx: &StageContext<'_>) -> PipelineOutcome {
        ctx.show(render::CANCELLED, false).await;
        PipelineOutcome::Cancelled
    }

    async fn finalize(&self, item_id: &str, status: Option<MessageRef>) {
        let id = item_id.to_string();
        if let Err(e) = self.registry.run(move |r| r.finish(&id)).await {
            error!("item {item_id}: failed to mark finished: {e:#}");
        }
        self.supervisor.remove(item_id);
        if let Some(status) = status {
            self.messenger.forget(status);
        }
    }
}
