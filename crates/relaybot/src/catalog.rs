//! Views over what the bot has stored: the uploaded-items list backed by the
//! local registry, and a browser over the raw Drive folder.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::drive::{RemoteObject, StorageProvider};
use crate::registry::Registry;
use crate::util::lock_mutex;

pub const PAGE_SIZE: usize = 10;
const BULK_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub storage_id: String,
    pub display_name: String,
    pub size: Option<u64>,
    pub mime_type: Option<String>,
    pub uploaded_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogPage {
    pub entries: Vec<CatalogEntry>,
    pub page: usize,
    pub pages: usize,
    pub page_size: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrivePage {
    pub items: Vec<RemoteObject>,
    pub page: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkDeleteReport {
    pub deleted: usize,
    pub failed: usize,
}

pub struct Catalog {
    registry: Arc<Registry>,
    storage: Arc<dyn StorageProvider>,
    /// Per folder, the token that opens page `n + 2` sits at index `n`.
    page_tokens: Mutex<HashMap<String, Vec<String>>>,
}

impl Catalog {
    pub fn new(registry: Arc<Registry>, storage: Arc<dyn StorageProvider>) -> Self {
        Self {
            registry,
            storage,
            page_tokens: Mutex::new(HashMap::new()),
        }
    }

    /// One page of the objects this bot uploaded, newest record last.
    ///
    /// Registry failures degrade to an empty list. Objects that vanished from
    /// storage are dropped from the registry and the page is recounted, so
    /// the totals always match what is shown.
    pub async fn list(&self, page: usize, page_size: usize) -> CatalogPage {
        let page = page.max(1);
        let page_size = page_size.max(1);
        loop {
            let records = match self.registry.run(|r| r.uploaded_items()).await {
                Ok(records) => records,
                Err(e) => {
                    warn!("failed to read uploaded items: {e:#}");
                    Vec::new()
                }
            };

            let total = records.len();
            let start = (page - 1).saturating_mul(page_size);
            let slice: Vec<_> = records.into_iter().skip(start).take(page_size).collect();
            let lookups = join_all(slice.iter().map(|r| self.storage.metadata(&r.storage_id))).await;

            let mut entries = Vec::with_capacity(slice.len());
            let mut pruned = 0;
            for (record, lookup) in slice.into_iter().zip(lookups) {
                match lookup {
                    Ok(Some(object)) => entries.push(CatalogEntry {
                        storage_id: record.storage_id,
                        display_name: record.display_name,
                        size: Some(object.size),
                        mime_type: Some(object.mime_type),
                        uploaded_at_ms: record.uploaded_at_ms,
                    }),
                    Ok(None) => {
                        info!("uploaded item {} no longer exists in storage", record.storage_id);
                        let id = record.storage_id.clone();
                        match self.registry.run(move |r| r.remove_uploaded(&id)).await {
                            Ok(_) => pruned += 1,
                            // Left in place; shown as unknown rather than looping on it.
                            Err(e) => {
                                warn!("failed to drop record {}: {e:#}", record.storage_id);
                                entries.push(CatalogEntry {
                                    storage_id: record.storage_id,
                                    display_name: record.display_name,
                                    size: None,
                                    mime_type: None,
                                    uploaded_at_ms: record.uploaded_at_ms,
                                });
                            }
                        }
                    }
                    Err(e) => {
                        debug!("metadata lookup for {} failed: {e:#}", record.storage_id);
                        entries.push(CatalogEntry {
                            storage_id: record.storage_id,
                            display_name: record.display_name,
                            size: None,
                            mime_type: None,
                            uploaded_at_ms: record.uploaded_at_ms,
                        });
                    }
                }
            }

            if pruned > 0 {
                continue;
            }
            return CatalogPage {
                entries,
                page,
                pages: total.div_ceil(page_size),
                page_size,
                total,
            };
        }
    }

    /// Deletes from storage, then drops the local record whatever the
    /// storage outcome was. Returns the storage result.
    pub async fn delete(&self, storage_id: &str) -> Result<()> {
        let remote = self.storage.delete(storage_id).await;
        if let Err(e) = &remote {
            warn!("storage delete of {storage_id} failed: {e:#}");
        }
        self.forget(storage_id).await;
        self.invalidate_pages();
        remote
    }

    pub async fn delete_all(&self) -> BulkDeleteReport {
        let records = match self.registry.run(|r| r.uploaded_items()).await {
            Ok(records) => records,
            Err(e) => {
                warn!("failed to read uploaded items: {e:#}");
                return BulkDeleteReport::default();
            }
        };

        let mut report = BulkDeleteReport::default();
        for record in records {
            match self.delete(&record.storage_id).await {
                Ok(()) => report.deleted += 1,
                Err(_) => report.failed += 1,
            }
        }
        if let Err(e) = self.registry.run(|r| r.clear_uploaded()).await {
            warn!("failed to clear uploaded items: {e:#}");
        }
        info!(
            "bulk delete of uploaded items: {} deleted, {} failed",
            report.deleted, report.failed
        );
        report
    }

    /// Page `page` (1-based) of a Drive folder, newest first.
    pub async fn browse_drive(&self, folder_id: &str, page: usize) -> Result<DrivePage> {
        let page = page.max(1);
        let mut token = None;
        if page > 1 {
            token = self.cached_token(folder_id, page);
            if token.is_none() {
                token = self.walk_to(folder_id, page).await?;
                if token.is_none() {
                    return Ok(DrivePage {
                        items: Vec::new(),
                        page,
                        has_more: false,
                    });
                }
            }
        }

        let listed = self
            .storage
            .list(folder_id, token.as_deref(), PAGE_SIZE as u32)
            .await?;
        let has_more = listed.next_page_token.is_some();
        if let Some(next) = listed.next_page_token {
            self.remember_token(folder_id, page + 1, next);
        }
        Ok(DrivePage {
            items: listed.items,
            page,
            has_more,
        })
    }

    pub async fn delete_drive_file(&self, storage_id: &str) -> Result<()> {
        self.storage.delete(storage_id).await?;
        self.forget(storage_id).await;
        self.invalidate_pages();
        Ok(())
    }

    /// Deletes every object in the folder. Per-object failures are counted.
    pub async fn delete_all_drive(&self, folder_id: &str) -> Result<BulkDeleteReport> {
        let mut ids = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let listed = self
                .storage
                .list(folder_id, token.as_deref(), BULK_PAGE_SIZE)
                .await?;
            ids.extend(listed.items.into_iter().map(|o| o.id));
            match listed.next_page_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        let mut report = BulkDeleteReport::default();
        for id in ids {
            match self.storage.delete(&id).await {
                Ok(()) => {
                    self.forget(&id).await;
                    report.deleted += 1;
                }
                Err(e) => {
                    warn!("failed to delete Drive file {id}: {e:#}");
                    report.failed += 1;
                }
            }
        }
        self.invalidate_pages();
        info!(
            "bulk delete of Drive folder {folder_id}: {} deleted, {} failed",
            report.deleted, report.failed
        );
        Ok(report)
    }

    async fn forget(&self, storage_id: &str) {
        let id = storage_id.to_string();
        if let Err(e) = self.registry.run(move |r| r.remove_uploaded(&id)).await {
            warn!("failed to drop record {storage_id}: {e:#}");
        }
    }

    /// Fetches pages from the furthest known one until the token for `page`
    /// is known. `None` when the folder ends first.
    async fn walk_to(&self, folder_id: &str, page: usize) -> Result<Option<String>> {
        let known = self.with_tokens(|t| t.get(folder_id).map_or(0, Vec::len));
        let mut current = known + 1;
        let mut token = if known == 0 {
            None
        } else {
            self.cached_token(folder_id, current)
        };

        while current < page {
            let listed = self
                .storage
                .list(folder_id, token.as_deref(), PAGE_SIZE as u32)
                .await?;
            match listed.next_page_token {
                Some(next) => {
                    self.remember_token(folder_id, current + 1, next.clone());
                    token = Some(next);
                    current += 1;
                }
                None => return Ok(None),
            }
        }
        Ok(token)
    }

    fn cached_token(&self, folder_id: &str, page: usize) -> Option<String> {
        let index = page.checked_sub(2)?;
        self.with_tokens(|t| t.get(folder_id).and_then(|v| v.get(index).cloned()))
    }

    fn remember_token(&self, folder_id: &str, page: usize, token: String) {
        let Some(index) = page.checked_sub(2) else {
            return;
        };
        self.with_tokens(|t| {
            let tokens = t.entry(folder_id.to_string()).or_default();
            if index < tokens.len() {
                tokens[index] = token;
            } else if index == tokens.len() {
                tokens.push(token);
            }
        });
    }

    fn invalidate_pages(&self) {
        self.with_tokens(|t| t.clear());
    }

    fn with_tokens<R>(&self, f: impl FnOnce(&mut HashMap<String, Vec<String>>) -> R) -> R {
        f(&mut lock_mutex(&self.page_tokens))
    }
}
