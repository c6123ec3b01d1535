//! User-facing texts and inline keyboards. Texts use Telegram's legacy
//! Markdown: `*bold*` and `` `code` ``.

use crate::catalog::{BulkDeleteReport, CatalogPage, DrivePage};
use crate::messaging::{Button, Keyboard};
use crate::stage::Stage;

pub const PREPARING: &str = "🔄 Preparing to process the video...";
pub const IMPORTING: &str = "🚀 Importing to Hydrax...";
pub const CANCELLED: &str = "⚠️ *Process cancelled by the user.*";
pub const ACCESS_DENIED: &str = "❌ Access denied. You are not on the list of allowed users.";
pub const PONG: &str = "✅ Pong! The bot is up and running.";
pub const OPERATION_CANCELLED: &str = "❌ Operation cancelled.";
pub const FETCHING_UPLOADED: &str = "🔍 Fetching the files uploaded by the bot...";
pub const FETCHING_DRIVE: &str = "🔍 Fetching the Google Drive folder...";
pub const DELETING_DRIVE_ALL: &str = "🗑️ Deleting every file in the Google Drive folder...";
pub const DELETING_UPLOADED_ALL: &str = "🗑️ Deleting every file uploaded by the bot...";
pub const DELETE_DRIVE_USAGE: &str =
    "❌ Usage: `/deletedrive <FILE_ID>`\nGet the FILE_ID with /listdrive.";
pub const MENU_UPDATED: &str = "✅ Command menu updated.";

pub fn stage_status(stage: Stage, percent: Option<i32>) -> String {
    let label = match stage {
        Stage::Download => "⬇️ Downloading video",
        Stage::Upload => "☁️ Uploading to Google Drive",
    };
    match percent {
        Some(p) => format!("{label} ({p}%)..."),
        None => format!("{label}..."),
    }
}

pub fn completed(slug: &str) -> String {
    format!("✅ *Process completed successfully!*\nSlug: `{}`", code(slug))
}

pub fn import_failed(error: &str) -> String {
    format!("❌ *Error importing to Hydrax:*\n`{}`", code(error))
}

pub fn unexpected_error(error: &str) -> String {
    format!("⚠️ *An unexpected error occurred:*\n`{}`", code(error))
}

pub fn listing_failed(error: &str) -> String {
    format!("❌ Could not fetch the file list:\n`{}`", code(error))
}

pub fn drive_file_deleted(file_id: &str) -> String {
    format!("✅ File `{}` deleted from Google Drive.", code(file_id))
}

pub fn delete_failed(error: &str) -> String {
    format!("❌ Error deleting the file:\n`{}`", code(error))
}

pub fn bulk_deleted(report: BulkDeleteReport) -> String {
    let mut text = format!("✅ {} file(s) deleted.", report.deleted);
    if report.failed > 0 {
        text.push_str(&format!("\n⚠️ {} file(s) could not be deleted.", report.failed));
    }
    text
}

pub fn cancel_keyboard(item_id: &str) -> Keyboard {
    Keyboard::single(Button::new("❌ Cancel", format!("cancel_{item_id}")))
}

pub fn welcome(drive_account: Option<&str>) -> String {
    let account = match drive_account {
        Some(email) => format!("`{}`", code(email)),
        None => "(could not be retrieved)".to_string(),
    };
    format!(
        "Hello! 👋\n\
         This bot is up and ready to receive videos.\n\
         Send me a video and it will be processed automatically.\n\
         Use /ping to check that I am alive.\n\
         Use /list to browse and manage the files uploaded by the bot.\n\
         Use /listdrive to browse the whole Google Drive folder.\n\
         Use /deletedrive <ID> to delete a Drive file.\n\
         Use /deletedriveall to delete every file in the Drive folder.\n\
         📁 Google Drive account: {account}"
    )
}

/// Code spans cannot contain backticks in legacy Markdown.
fn code(text: &str) -> String {
    text.replace('`', "'")
}

/// Human-readable size: `0B`, `500 B`, `1.5 KB`, `2.25 GB`.
pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0B".to_string();
    }
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = (value * 100.0).round() / 100.0;
    format!("{rounded} {}", UNITS[unit])
}

pub fn file_icon(mime_type: &str) -> &'static str {
    if mime_type.starts_with("video/") {
        "🎬"
    } else if mime_type.starts_with("image/") {
        "🖼️"
    } else if mime_type.starts_with("audio/") {
        "🎵"
    } else if mime_type == "application/vnd.google-apps.folder" {
        "📁"
    } else {
        "📄"
    }
}

/// Keeps names of up to `limit + 3` chars; longer ones become `limit` chars and `...`.
pub fn truncate(name: &str, limit: usize) -> String {
    if name.chars().count() > limit + 3 {
        let head: String = name.chars().take(limit).collect();
        format!("{head}...")
    } else {
        name.to_string()
    }
}

pub fn uploaded_list(page: &CatalogPage) -> (String, Option<Keyboard>) {
    if page.total == 0 {
        return (
            "📭 No files uploaded by this bot were found in Google Drive.".to_string(),
            None,
        );
    }
    if page.entries.is_empty() {
        return (
            format!(
                "📭 Page {} does not exist ({} pages available).",
                page.page, page.pages
            ),
            Some(Keyboard::single(Button::new("⏮️ First page", "list_1"))),
        );
    }

    let mut text = format!(
        "📋 *Files uploaded by the bot to Google Drive* (Page {}/{}):\n\n",
        page.page, page.pages
    );
    let first_index = (page.page - 1) * page.page_size + 1;
    let mut keyboard = Keyboard::new();
    for (offset, entry) in page.entries.iter().enumerate() {
        let size = entry
            .size
            .map(format_size)
            .unwrap_or_else(|| "unknown size".to_string());
        let name = truncate(&entry.display_name, 30);
        text.push_str(&format!("{}. `{}` ({size})\n", first_index + offset, code(&name)));
        keyboard = keyboard.row(vec![Button::new(
            format!("🗑️ {}", truncate(&entry.display_name, 20)),
            format!("delete_{}", entry.storage_id),
        )]);
    }

    let mut nav = Vec::new();
    if page.page > 1 {
        nav.push(Button::new("⬅️ Previous", format!("list_{}", page.page - 1)));
    }
    if page.page < page.pages {
        nav.push(Button::new("Next ➡️", format!("list_{}", page.page + 1)));
    }
    let keyboard = keyboard
        .row(nav)
        .row(vec![Button::new("🔄 Refresh", format!("list_{}", page.page))])
        .row(vec![Button::new("🗑️ Delete ALL (uploaded)", "delete_all_confirm")]);
    (text, Some(keyboard))
}

pub fn drive_list(page: &DrivePage) -> (String, Option<Keyboard>) {
    if page.items.is_empty() {
        let keyboard = (page.page > 1)
            .then(|| Keyboard::single(Button::new("⏮️ First page", "drivelist_1")));
        return (
            "📭 No files or folders were found in this Google Drive folder.".to_string(),
            keyboard,
        );
    }

    let mut text = format!("📋 *Google Drive contents* (Page {}):\n\n", page.page);
    let mut keyboard = Keyboard::new();
    for (offset, item) in page.items.iter().enumerate() {
        let name = truncate(&item.name, 35);
        text.push_str(&format!(
            "{}. {} `{}` ({})\n   `ID: {}`\n\n",
            offset + 1,
            file_icon(&item.mime_type),
            code(&name),
            format_size(item.size),
            item.id
        ));
        keyboard = keyboard.row(vec![Button::new(
            format!("🗑️ Delete {}", truncate(&item.name, 20)),
            format!("drive_delete_single_{}", item.id),
        )]);
    }

    let mut nav = Vec::new();
    if page.page > 1 {
        nav.push(Button::new("⬅️ Previous", format!("drivelist_{}", page.page - 1)));
    }
    if page.has_more {
        nav.push(Button::new("Next ➡️", format!("drivelist_{}", page.page + 1)));
    }
    let keyboard = keyboard
        .row(nav)
        .row(vec![Button::new("🔄 Refresh", format!("drivelist_{}", page.page))])
        .row(vec![Button::new("🗑️ Delete ALL from Drive", "drive_delete_all_confirm")]);
    (text, Some(keyboard))
}

pub fn confirm_drive_delete(file_id: &str) -> (String, Keyboard) {
    (
        format!(
            "⚠️ *Are you sure you want to delete this file?*\n\
             ID: `{file_id}`\n\
             This action cannot be undone."
        ),
        Keyboard::new()
            .row(vec![Button::new("✅ Yes, delete", format!("drive_delete_confirm_{file_id}"))])
            .row(vec![Button::new("❌ Cancel", "drive_cancel")]),
    )
}

pub fn confirm_drive_delete_all() -> (String, Keyboard) {
    (
        "⚠️ *Do you confirm deleting ALL files in the Google Drive folder?*\n\
         This action cannot be undone."
            .to_string(),
        Keyboard::new()
            .row(vec![Button::new("✅ Yes, delete EVERYTHING", "drive_delete_all_final_confirm")])
            .row(vec![Button::new("❌ Cancel", "drive_cancel")]),
    )
}

pub fn confirm_uploaded_delete_all() -> (String, Keyboard) {
    (
        "⚠️ *Do you confirm deleting ALL files uploaded by the bot?*\n\
         This action cannot be undone."
            .to_string(),
        Keyboard::new()
            .row(vec![Button::new("✅ Yes, delete EVERYTHING", "delete_all_final")])
            .row(vec![Button::new("❌ Cancel", "drive_cancel")]),
    )
}
