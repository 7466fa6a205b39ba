//! MergeEngine: combines a local and a remote snapshot into one.
//!
//! Rules, applied per key:
//!
//! 1. Start from the remote value, minus the entry/bookmark named by the
//!    deletion marker.
//! 2. In [`MergeMode::AdoptRemote`] stop there: the remote is authoritative.
//! 3. Otherwise overlay local values:
//!    - key missing remotely: take the local value
//!    - remote value empty: take the local value (unsynced local data is never
//!      wiped by an empty remote)
//!    - both present: union entries by id (text only for legacy entries
//!      without an id); on a match the local entry overwrites the remote
//!      one. A non-empty local summary wins.
//!
//! Per-entry conflicts are resolved local-wins without consulting
//! `lastModified`. A newer edit made on another device can be overwritten by
//! an older local copy.

use crate::model::{Bookmark, ContextRecord, Entry};
use crate::snapshot::{Snapshot, SnapshotValue};
use std::collections::btree_map::Entry as MapEntry;

/// How local data participates in a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMode {
    /// Two-way reconciliation (user-initiated and scheduled syncs).
    #[default]
    Reconcile,
    /// Remote is authoritative; local values are ignored. Used after the
    /// change detector sees a new remote fingerprint.
    AdoptRemote,
}

/// Merge `local` into `remote`.
///
/// Pure: the result depends only on the arguments. `delete_key` removes the
/// entry or bookmark with that id from both sides, so it can never reappear
/// through this merge.
pub fn merge(
    local: &Snapshot,
    remote: &Snapshot,
    delete_key: Option<&str>,
    mode: MergeMode,
) -> Snapshot {
    let mut merged = remote.clone();
    if let Some(id) = delete_key {
        for value in merged.values_mut() {
            value.remove_id(id);
        }
    }

    if mode == MergeMode::AdoptRemote {
        return merged;
    }

    for (key, local_value) in local.iter() {
        let mut local_value = local_value.clone();
        if let Some(id) = delete_key {
            local_value.remove_id(id);
        }

        match merged.entry(key.clone()) {
            MapEntry::Vacant(slot) => {
                slot.insert(local_value);
            }
            MapEntry::Occupied(mut slot) => {
                let remote_value = slot.get_mut();
                if remote_value.is_empty() {
                    *remote_value = local_value;
                    continue;
                }
                match (remote_value, local_value) {
                    (SnapshotValue::Context(remote), SnapshotValue::Context(local)) => {
                        merge_record(remote, local);
                    }
                    (SnapshotValue::Bookmarks(remote), SnapshotValue::Bookmarks(local)) => {
                        merge_bookmarks(remote, local);
                    }
                    // Shape changed between replicas; keep the local value.
                    (remote, local) => *remote = local,
                }
            }
        }
    }

    merged
}

fn merge_record(remote: &mut ContextRecord, local: ContextRecord) {
    if !local.summary.is_empty() {
        remote.summary = local.summary;
    }
    if !local.chat_id.is_empty() {
        remote.chat_id = local.chat_id;
    }
    for entry in local.entries {
        upsert_entry(&mut remote.entries, entry);
    }
}

fn upsert_entry(entries: &mut Vec<Entry>, entry: Entry) {
    // An id match anywhere in the list beats an earlier legacy text match.
    let by_id = entries
        .iter()
        .position(|existing| !entry.id.is_empty() && existing.id == entry.id);
    match by_id.or_else(|| entries.iter().position(|existing| entry.same_note(existing))) {
        Some(idx) => entries[idx] = entry,
        None => entries.push(entry),
    }
}

fn merge_bookmarks(remote: &mut Vec<Bookmark>, local: Vec<Bookmark>) {
    for bookmark in local {
        match remote.iter().position(|b| b.id == bookmark.id) {
            Some(idx) => remote[idx] = bookmark,
            None => remote.push(bookmark),
        }
    }
}
