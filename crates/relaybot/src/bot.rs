//! Update loop and dispatch of commands, callbacks and inbound videos.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, PAGE_SIZE};
use crate::config::Config;
use crate::drive::StorageProvider;
use crate::messaging::{ChatError, Keyboard, MessageRef, Messenger};
use crate::pipeline::{InboundVideo, Pipeline, PipelineOutcome};
use crate::render;
use crate::supervisor::Supervisor;
use crate::telegram::{BotCommand, CallbackQuery, Message, TelegramClient, Update, Video};

const POLL_TIMEOUT_SECS: u64 = 30;
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

pub const BOT_COMMANDS: [BotCommand; 6] = [
    BotCommand {
        command: "start",
        description: "Show the welcome message",
    },
    BotCommand {
        command: "ping",
        description: "Check that the bot is alive",
    },
    BotCommand {
        command: "list",
        description: "List the files uploaded by the bot",
    },
    BotCommand {
        command: "listdrive",
        description: "Browse the whole Google Drive folder",
    },
    BotCommand {
        command: "deletedrive",
        description: "Delete a Drive file by ID (/deletedrive <ID>)",
    },
    BotCommand {
        command: "deletedriveall",
        description: "Delete every Drive file (asks for confirmation)",
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Ping,
    List,
    ListDrive,
    DeleteDrive(Option<String>),
    DeleteDriveAll,
    SetMenu,
}

impl Command {
    /// Parses `/name[@bot] [args]`. Unknown commands yield `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let head = parts.next()?.strip_prefix('/')?;
        let name = head.split('@').next().unwrap_or(head);
        let args: Vec<&str> = parts.collect();
        let command = match name.to_ascii_lowercase().as_str() {
            "start" => Self::Start,
            "ping" => Self::Ping,
            "list" => Self::List,
            "listdrive" => Self::ListDrive,
            "deletedrive" => match args.as_slice() {
                [id] => Self::DeleteDrive(Some(id.to_string())),
                _ => Self::DeleteDrive(None),
            },
            "deletedriveall" => Self::DeleteDriveAll,
            "setmenu" => Self::SetMenu,
            _ => return None,
        };
        Some(command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    Cancel(String),
    List(usize),
    DeleteUploaded(String),
    DeleteAllUploadedConfirm,
    DeleteAllUploaded,
    DriveList(usize),
    DriveDeleteSingle(String),
    DriveDeleteConfirm(String),
    DriveDeleteAllConfirm,
    DriveDeleteAllFinal,
    DriveCancel,
}

impl Callback {
    pub fn parse(data: &str) -> Option<Self> {
        let callback = match data {
            "delete_all_confirm" => Self::DeleteAllUploadedConfirm,
            "delete_all_final" => Self::DeleteAllUploaded,
            "drive_delete_all_confirm" => Self::DriveDeleteAllConfirm,
            "drive_delete_all_final_confirm" => Self::DriveDeleteAllFinal,
            "drive_cancel" => Self::DriveCancel,
            _ => {
                if let Some(id) = non_empty(data.strip_prefix("cancel_")) {
                    Self::Cancel(id)
                } else if let Some(page) = data.strip_prefix("list_") {
                    Self::List(page.parse().ok()?)
                } else if let Some(page) = data.strip_prefix("drivelist_") {
                    Self::DriveList(page.parse().ok()?)
                } else if let Some(id) = non_empty(data.strip_prefix("drive_delete_single_")) {
                    Self::DriveDeleteSingle(id)
                } else if let Some(id) = non_empty(data.strip_prefix("drive_delete_confirm_")) {
                    Self::DriveDeleteConfirm(id)
                } else if let Some(id) = non_empty(data.strip_prefix("delete_")) {
                    Self::DeleteUploaded(id)
                } else {
                    return None;
                }
            }
        };
        Some(callback)
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

/// Identity of an inbound item; Telegram message ids are only unique per chat.
pub fn item_id(message: MessageRef) -> String {
    format!("{}-{}", message.chat_id, message.message_id)
}

pub struct Bot {
    telegram: Arc<TelegramClient>,
    messenger: Arc<Messenger>,
    pipeline: Arc<Pipeline>,
    catalog: Arc<Catalog>,
    storage: Arc<dyn StorageProvider>,
    supervisor: Arc<Supervisor>,
    config: Arc<Config>,
    menu: OnceCell<()>,
}

impl Bot {
    pub fn new(
        telegram: Arc<TelegramClient>,
        messenger: Arc<Messenger>,
        pipeline: Arc<Pipeline>,
        catalog: Arc<Catalog>,
        storage: Arc<dyn StorageProvider>,
        supervisor: Arc<Supervisor>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            telegram,
            messenger,
            pipeline,
            catalog,
            storage,
            supervisor,
            config,
            menu: OnceCell::new(),
        }
    }

    /// Long-polls until `shutdown` fires. Each update is handled on its own task.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!("polling Telegram for updates");
        let mut offset = 0;
        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.telegram.get_updates(offset, POLL_TIMEOUT_SECS) => polled,
            };

            let pause = match polled {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        let bot = Arc::clone(&self);
                        tokio::spawn(async move { bot.handle(update).await });
                    }
                    continue;
                }
                Err(ChatError::RateLimited(delay)) => delay,
                Err(e) => {
                    warn!("getUpdates failed: {e}");
                    POLL_RETRY_DELAY
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!("update loop stopped");
        Ok(())
    }

    async fn handle(&self, update: Update) {
        if let Some(query) = update.callback_query {
            self.handle_callback(query).await;
        } else if let Some(message) = update.message {
            if let Some(video) = message.video.clone() {
                self.handle_video(&message, video).await;
            } else if let Some(command) = message.text.as_deref().and_then(Command::parse) {
                self.handle_command(&message, command).await;
            }
        }
    }

    async fn handle_video(&self, message: &Message, video: Video) {
        let user_id = message.from.as_ref().map_or(0, |u| u.id);
        if !self.config.is_whitelisted(user_id) {
            info!("ignoring video from user {user_id}: not whitelisted");
            return;
        }

        let reference = message.reference();
        let inbound = InboundVideo {
            item_id: item_id(reference),
            message: reference,
            file_id: video.file_id,
            file_name: video.file_name,
            file_size: video.file_size,
        };
        info!("video received from user {user_id}, item {}", inbound.item_id);

        match self.pipeline.process(inbound).await {
            Ok(PipelineOutcome::Dropped) => {}
            Ok(outcome) => debug!("item {} ended as {outcome:?}", item_id(reference)),
            Err(e) => {
                error!("{e:#}");
                self.reply(reference, &render::unexpected_error(&format!("{e:#}")), None)
                    .await;
            }
        }
    }

    async fn handle_command(&self, message: &Message, command: Command) {
        let reference = message.reference();
        let user_id = message.from.as_ref().map_or(0, |u| u.id);
        info!("command {command:?} from user {user_id}");

        if command == Command::Start {
            self.menu.get_or_init(|| self.register_menu()).await;
        }
        if !self.config.is_whitelisted(user_id) {
            info!("access denied for user {user_id}");
            self.reply(reference, render::ACCESS_DENIED, None).await;
            return;
        }

        match command {
            Command::Start => {
                let account = match self.storage.account_email().await {
                    Ok(email) => Some(email),
                    Err(e) => {
                        warn!("could not fetch Drive account: {e:#}");
                        None
                    }
                };
                self.reply(reference, &render::welcome(account.as_deref()), None)
                    .await;
            }
            Command::Ping => {
                self.reply(reference, render::PONG, None).await;
            }
            Command::List => {
                if let Some(status) = self.reply(reference, render::FETCHING_UPLOADED, None).await {
                    self.show_uploaded(status, 1).await;
                }
            }
            Command::ListDrive => {
                if let Some(status) = self.reply(reference, render::FETCHING_DRIVE, None).await {
                    self.show_drive(status, 1).await;
                }
            }
            Command::DeleteDrive(None) => {
                self.reply(reference, render::DELETE_DRIVE_USAGE, None).await;
            }
            Command::DeleteDrive(Some(file_id)) => {
                let (text, keyboard) = render::confirm_drive_delete(&file_id);
                self.reply(reference, &text, Some(&keyboard)).await;
            }
            Command::DeleteDriveAll => {
                let (text, keyboard) = render::confirm_drive_delete_all();
                self.reply(reference, &text, Some(&keyboard)).await;
            }
            Command::SetMenu => {
                self.register_menu().await;
                self.reply(reference, render::MENU_UPDATED, None).await;
            }
        }
    }

    async fn register_menu(&self) {
        if let Err(e) = self.telegram.set_my_commands(&BOT_COMMANDS).await {
            warn!("failed to register the command menu: {e}");
        }
    }

    async fn handle_callback(&self, query: CallbackQuery) {
        let data = query.data.clone().unwrap_or_default();
        debug!("callback {data:?} from user {}", query.from.id);

        if !self.config.is_whitelisted(query.from.id) {
            self.answer(&query, Some("❌ Access denied."), true).await;
            return;
        }
        let Some(callback) = Callback::parse(&data) else {
            self.answer(&query, Some("Unrecognized action."), true).await;
            return;
        };
        let Some(message) = query.message.as_ref().map(Message::reference) else {
            self.answer(&query, Some("This message is too old to act on."), true)
                .await;
            return;
        };

        match callback {
            Callback::Cancel(item_id) => {
                if self.supervisor.cancel(&item_id) {
                    self.answer(&query, Some("Cancelling..."), false).await;
                } else {
                    self.answer(&query, Some("This process can no longer be cancelled."), true)
                        .await;
                }
            }
            Callback::List(page) => {
                self.answer(&query, None, false).await;
                self.show_uploaded(message, page).await;
            }
            Callback::DeleteUploaded(storage_id) => match self.catalog.delete(&storage_id).await {
                Ok(()) => {
                    self.answer(&query, Some("🗑️ File deleted."), false).await;
                    self.show_uploaded(message, 1).await;
                }
                Err(e) => {
                    self.answer(&query, None, false).await;
                    self.edit(message, &render::delete_failed(&format!("{e:#}")), None)
                        .await;
                }
            },
            Callback::DeleteAllUploadedConfirm => {
                self.answer(&query, None, false).await;
                let (text, keyboard) = render::confirm_uploaded_delete_all();
                self.edit(message, &text, Some(&keyboard)).await;
            }
            Callback::DeleteAllUploaded => {
                self.answer(&query, Some("🗑️ Deleting..."), false).await;
                self.edit(message, render::DELETING_UPLOADED_ALL, None).await;
                let report = self.catalog.delete_all().await;
                self.edit(message, &render::bulk_deleted(report), None).await;
            }
            Callback::DriveList(page) => {
                self.answer(&query, None, false).await;
                self.show_drive(message, page).await;
            }
            Callback::DriveDeleteSingle(file_id) => {
                self.answer(&query, None, false).await;
                let (text, keyboard) = render::confirm_drive_delete(&file_id);
                self.edit(message, &text, Some(&keyboard)).await;
            }
            Callback::DriveDeleteConfirm(file_id) => {
                self.answer(&query, Some("🗑️ Deleting file..."), false).await;
                let text = match self.catalog.delete_drive_file(&file_id).await {
                    Ok(()) => render::drive_file_deleted(&file_id),
                    Err(e) => {
                        warn!("failed to delete Drive file {file_id}: {e:#}");
                        render::delete_failed(&format!("{e:#}"))
                    }
                };
                self.edit(message, &text, None).await;
            }
            Callback::DriveDeleteAllConfirm => {
                self.answer(&query, None, false).await;
                let (text, keyboard) = render::confirm_drive_delete_all();
                self.edit(message, &text, Some(&keyboard)).await;
            }
            Callback::DriveDeleteAllFinal => {
                self.answer(&query, Some("🗑️ Deleting everything..."), false).await;
                self.edit(message, render::DELETING_DRIVE_ALL, None).await;
                let text = match self.catalog.delete_all_drive(&self.config.drive_folder_id).await {
                    Ok(report) => render::bulk_deleted(report),
                    Err(e) => render::delete_failed(&format!("{e:#}")),
                };
                self.edit(message, &text, None).await;
            }
            Callback::DriveCancel => {
                self.answer(&query, Some(render::OPERATION_CANCELLED), false).await;
                self.messenger.delete(message).await;
            }
        }
    }

    async fn show_uploaded(&self, message: MessageRef, page: usize) {
        let listing = self.catalog.list(page, PAGE_SIZE).await;
        let (text, keyboard) = render::uploaded_list(&listing);
        self.edit(message, &text, keyboard.as_ref()).await;
    }

    async fn show_drive(&self, message: MessageRef, page: usize) {
        match self.catalog.browse_drive(&self.config.drive_folder_id, page).await {
            Ok(listing) => {
                let (text, keyboard) = render::drive_list(&listing);
                self.edit(message, &text, keyboard.as_ref()).await;
            }
            Err(e) => {
                warn!("failed to list Drive folder: {e:#}");
                self.edit(message, &render::listing_failed(&format!("{e:#}")), None)
                    .await;
            }
        }
    }

    async fn reply(&self, to: MessageRef, text: &str, keyboard: Option<&Keyboard>) -> Option<MessageRef> {
        match self.messenger.reply(to, text, keyboard).await {
            Ok(sent) => Some(sent),
            Err(e) => {
                warn!("failed to reply in chat {}: {e}", to.chat_id);
                None
            }
        }
    }

    async fn edit(&self, message: MessageRef, text: &str, keyboard: Option<&Keyboard>) {
        if let Err(e) = self.messenger.edit(message, text, keyboard).await {
            warn!("failed to edit message {}: {e}", message.message_id);
        }
    }

    async fn answer(&self, query: &CallbackQuery, text: Option<&str>, alert: bool) {
        if let Err(e) = self.telegram.answer_callback_query(&query.id, text, alert).await {
            debug!("failed to answer callback {}: {e}", query.id);
        }
    }
}
