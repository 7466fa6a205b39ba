//! User-initiated edits to context records and bookmarks.
//!
//! Every edit is a read-modify-write of one key, taken under the [`WriteLock`]
//! shared with the sync coordinator's commit step so neither side loses the
//! other's update.

use crate::model::{bookmarks_key, context_key, now_millis, Bookmark, ContextRecord, Entry};
use crate::store::{LocalStore, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Serializes local read-modify-write sequences.
pub type WriteLock = Arc<Mutex<()>>;

/// Note operations over a [`LocalStore`].
pub struct Notes {
    store: Arc<dyn LocalStore>,
    lock: WriteLock,
}

impl Notes {
    pub fn new(store: Arc<dyn LocalStore>, lock: WriteLock) -> Self {
        Self { store, lock }
    }

    /// Context record for a conversation; empty when none exists.
    pub async fn context(&self, domain: &str, chat_id: &str) -> Result<ContextRecord> {
        let key = context_key(domain, chat_id);
        Ok(match self.store.get(&key).await? {
            Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!(key = %key, "Unreadable context record, starting empty: {}", e);
                ContextRecord::empty(chat_id)
            }),
            None => ContextRecord::empty(chat_id),
        })
    }

    pub async fn bookmarks(&self, domain: &str, chat_id: &str) -> Result<Vec<Bookmark>> {
        let key = bookmarks_key(domain, chat_id);
        Ok(match self.store.get(&key).await? {
            Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!(key = %key, "Unreadable bookmark list, starting empty: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        })
    }

    async fn save_context(&self, domain: &str, chat_id: &str, record: &ContextRecord) -> Result<()> {
        let value = serde_json::to_value(record)?;
        self.store.set(&context_key(domain, chat_id), value).await
    }

    async fn save_bookmarks(&self, domain: &str, chat_id: &str, list: &[Bookmark]) -> Result<()> {
        let value = serde_json::to_value(list)?;
        self.store.set(&bookmarks_key(domain, chat_id), value).await
    }

    /// Read, modify and write back one context record under the write lock.
    async fn edit_context<T>(
        &self,
        domain: &str,
        chat_id: &str,
        edit: impl FnOnce(&mut ContextRecord) -> Option<T>,
    ) -> Result<Option<T>> {
        let _guard = self.lock.lock().await;
        let mut record = self.context(domain, chat_id).await?;
        let result = edit(&mut record);
        if result.is_some() {
            self.save_context(domain, chat_id, &record).await?;
        }
        Ok(result)
    }

    /// Add an entry unless one with the same text already exists.
    ///
    /// Returns the record as stored afterwards.
    pub async fn add_entry(&self, domain: &str, chat_id: &str, text: &str) -> Result<ContextRecord> {
        let record = self
            .edit_context(domain, chat_id, |record| {
                if record.entries.iter().any(|e| e.text == text) {
                    debug!("Skipping duplicate entry");
                    return None;
                }
                record.entries.push(Entry::new(text));
                Some(record.clone())
            })
            .await?;
        match record {
            Some(record) => Ok(record),
            None => self.context(domain, chat_id).await,
        }
    }

    /// Flip an entry's `active` flag. Returns the new value, if found.
    pub async fn toggle_entry(&self, domain: &str, chat_id: &str, id: &str) -> Result<Option<bool>> {
        self.edit_context(domain, chat_id, |record| {
            let entry = record.entries.iter_mut().find(|e| e.id == id)?;
            entry.active = !entry.active;
            entry.last_modified = Some(now_millis());
            Some(entry.active)
        })
        .await
    }

    /// Replace an entry's text. Returns whether it was found.
    pub async fn update_entry(
        &self,
        domain: &str,
        chat_id: &str,
        id: &str,
        text: &str,
    ) -> Result<bool> {
        let updated = self
            .edit_context(domain, chat_id, |record| {
                let entry = record.entries.iter_mut().find(|e| e.id == id)?;
                entry.text = text.to_string();
                entry.last_modified = Some(now_millis());
                Some(())
            })
            .await?;
        Ok(updated.is_some())
    }

    /// Remove an entry. Returns its id, to be passed as the deletion marker of
    /// the next sync.
    pub async fn delete_entry(&self, domain: &str, chat_id: &str, id: &str) -> Result<Option<String>> {
        self.edit_context(domain, chat_id, |record| {
            let before = record.entries.len();
            record.entries.retain(|e| e.id != id);
            (record.entries.len() != before).then(|| id.to_string())
        })
        .await
    }

    pub async fn update_summary(&self, domain: &str, chat_id: &str, summary: &str) -> Result<()> {
        self.edit_context(domain, chat_id, |record| {
            record.summary = summary.to_string();
            if record.chat_id.is_empty() {
                record.chat_id = chat_id.to_string();
            }
            Some(())
        })
        .await?;
        Ok(())
    }

    pub async fn add_bookmark(&self, bookmark: Bookmark) -> Result<Bookmark> {
        let _guard = self.lock.lock().await;
        let mut list = self.bookmarks(&bookmark.domain, &bookmark.chat_id).await?;
        list.push(bookmark.clone());
        self.save_bookmarks(&bookmark.domain, &bookmark.chat_id, &list)
            .await?;
        Ok(bookmark)
    }

    /// Remove a bookmark. Returns its id for use as the next deletion marker.
    pub async fn delete_bookmark(
        &self,
        domain: &str,
        chat_id: &str,
        id: &str,
    ) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        let mut list = self.bookmarks(domain, chat_id).await?;
        let before = list.len();
        list.retain(|b| b.id != id);
        if list.len() == before {
            return Ok(None);
        }
        self.save_bookmarks(domain, chat_id, &list).await?;
        Ok(Some(id.to_string()))
    }
}
