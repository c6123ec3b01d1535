//! Runs one transfer stage as an interruptible task.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::messaging::{Keyboard, MessageRef, Messenger};
use crate::progress::{percent_of, MilestoneTracker, Progress, ProgressReporter, TransferCancelled};
use crate::render;
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Download,
    Upload,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Upload => "upload",
        }
    }
}

#[derive(Debug)]
pub enum StageOutcome<T> {
    Completed(T),
    Cancelled,
    Failed(anyhow::Error),
}

/// What a stage needs to know about the item it belongs to.
pub struct StageContext<'a> {
    pub item_id: &'a str,
    pub status: MessageRef,
    pub cancel_keyboard: &'a Keyboard,
    pub messenger: &'a Messenger,
    pub supervisor: &'a Supervisor,
    pub token: &'a CancellationToken,
}

impl StageContext<'_> {
    /// Updates the status message. Rendering problems are logged and swallowed.
    pub async fn show(&self, text: &str, with_cancel: bool) {
        let keyboard = with_cancel.then_some(self.cancel_keyboard);
        if let Err(e) = self.messenger.edit(self.status, text, keyboard).await {
            warn!("item {}: failed to update status message: {e}", self.item_id);
        }
    }

    /// Runs `op` in its own task and publishes that task as the item's active
    /// stage. Progress reports are throttled through `tracker` and rendered
    /// with the cancel control attached.
    pub async fn run<T, F, Fut>(
        &self,
        stage: Stage,
        tracker: &mut MilestoneTracker,
        op: F,
    ) -> StageOutcome<T>
    where
        T: Send + 'static,
        F: FnOnce(ProgressReporter) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if self.token.is_cancelled() {
            return StageOutcome::Cancelled;
        }

        self.show(&render::stage_status(stage, None), true).await;

        let (reporter, mut progress_rx) = ProgressReporter::new(self.token.clone());
        let mut task = tokio::spawn(op(reporter));
        self.supervisor
            .set_active_stage(self.item_id, task.abort_handle());

        let mut progress_open = true;
        let joined = loop {
            tokio::select! {
                biased;
                update = progress_rx.recv(), if progress_open => match update {
                    Some(update) => self.on_progress(stage, tracker, update).await,
                    None => progress_open = false,
                },
                joined = &mut task => break joined,
                _ = self.token.cancelled() => {
                    task.abort();
                    break (&mut task).await;
                }
            }
        };

        self.supervisor.clear_active_stage(self.item_id);
        while let Ok(update) = progress_rx.try_recv() {
            self.on_progress(stage, tracker, update).await;
        }

        match joined {
            Ok(Ok(value)) => StageOutcome::Completed(value),
            Ok(Err(e)) if e.is::<TransferCancelled>() || self.token.is_cancelled() => {
                debug!("item {}: {} stopped by cancellation: {e}", self.item_id, stage.name());
                StageOutcome::Cancelled
            }
            Ok(Err(e)) => StageOutcome::Failed(e),
            Err(join) if join.is_cancelled() => StageOutcome::Cancelled,
            Err(join) => {
                error!("item {}: {} task panicked: {join}", self.item_id, stage.name());
                StageOutcome::Failed(anyhow::anyhow!("{} task panicked", stage.name()))
            }
        }
    }

    async fn on_progress(&self, stage: Stage, tracker: &mut MilestoneTracker, update: Progress) {
        if self.token.is_cancelled() {
            return;
        }
        let percent = percent_of(update.done, update.total);
        if let Some(shown) = tracker.observe(percent) {
            debug!("item {}: {} milestone {shown}%", self.item_id, stage.name());
            self.show(&render::stage_status(stage, Some(shown)), true)
                .await;
        }
    }

    /// Shows 100% once the stage is done if no progress report got there.
    pub async fn finish_progress(&self, stage: Stage, tracker: &mut MilestoneTracker) {
        if tracker.needs_final() {
            tracker.mark_final();
            self.show(&render::stage_status(stage, Some(100)), true).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::tests::RecordingChat;
    use crate::messaging::Button;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        chat: Arc<RecordingChat>,
        messenger: Messenger,
        supervisor: Supervisor,
        keyboard: Keyboard,
        token: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            let chat = Arc::new(RecordingChat::default());
            let supervisor = Supervisor::new();
            let token = supervisor.register("item");
            Self {
                messenger: Messenger::new(chat.clone()),
                chat,
                supervisor,
                keyboard: Keyboard::single(Button::new("Cancel", "cancel_item")),
                token,
            }
        }

        fn ctx(&self) -> StageContext<'_> {
            StageContext {
                item_id: "item",
                status: MessageRef {
                    chat_id: 1,
                    message_id: 10,
                },
                cancel_keyboard: &self.keyboard,
                messenger: &self.messenger,
                supervisor: &self.supervisor,
                token: &self.token,
            }
        }

        fn texts(&self) -> Vec<String> {
            self.chat
                .edits
                .lock()
                .unwrap()
                .iter()
                .map(|(_, text, _)| text.clone())
                .collect()
        }
    }

    #[tokio::test]
    async fn completed_stage_renders_each_milestone_once() {
        let fx = Fixture::new();
        let mut tracker = MilestoneTracker::default();
        let outcome = fx
            .ctx()
            .run(Stage::Upload, &mut tracker, |reporter| async move {
                for done in [10, 25, 30, 25, 60, 100] {
                    reporter.report(done, 100)?;
                }
                Ok::<_, anyhow::Error>("id-1")
            })
            .await;

        assert!(matches!(outcome, StageOutcome::Completed("id-1")));
        assert_eq!(
            fx.texts(),
            [
                render::stage_status(Stage::Upload, None),
                render::stage_status(Stage::Upload, Some(25)),
                render::stage_status(Stage::Upload, Some(60)),
                render::stage_status(Stage::Upload, Some(100)),
            ]
        );
        assert!(!tracker.needs_final());
    }

    #[tokio::test]
    async fn failure_is_not_reported_as_cancellation() {
        let fx = Fixture::new();
        let mut tracker = MilestoneTracker::default();
        let outcome: StageOutcome<()> = fx
            .ctx()
            .run(Stage::Download, &mut tracker, |_| async {
                Err::<(), _>(anyhow::anyhow!("disk full"))
            })
            .await;
        match outcome {
            StageOutcome::Failed(e) => assert_eq!(e.to_string(), "disk full"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_stage_that_stopped_reporting() {
        let fx = Fixture::new();
        let mut tracker = MilestoneTracker::default();
        let supervisor_cancel = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(fx.supervisor.cancel("item"));
        };
        let ctx = fx.ctx();
        let run = ctx.run(Stage::Download, &mut tracker, |reporter| async move {
            reporter.report(30, 100)?;
            std::future::pending::<()>().await;
            Ok::<(), anyhow::Error>(())
        });
        let (outcome, ()) = tokio::join!(run, supervisor_cancel);
        assert!(matches!(outcome, StageOutcome::Cancelled));
    }

    #[tokio::test]
    async fn already_cancelled_item_does_not_start_a_stage() {
        let fx = Fixture::new();
        fx.token.cancel();
        let mut tracker = MilestoneTracker::default();
        let outcome = fx
            .ctx()
            .run(Stage::Upload, &mut tracker, |_| async { Ok::<(), anyhow::Error>(()) })
            .await;
        assert!(matches!(outcome, StageOutcome::Cancelled));
        assert!(fx.texts().is_empty());
    }

    #[tokio::test]
    async fn finish_progress_forces_one_final_update() {
        let fx = Fixture::new();
        let mut tracker = MilestoneTracker::default();
        tracker.observe(50);
        fx.ctx().finish_progress(Stage::Download, &mut tracker).await;
        fx.ctx().finish_progress(Stage::Download, &mut tracker).await;
        assert_eq!(fx.texts(), [render::stage_status(Stage::Download, Some(100))]);
    }
}
