//! Document synchronization: versions and debounced full-text `didChange`.
//!
//! A document is tracked from the moment it is opened, even while its
//! session is still starting. Edits made before the server is ready go out
//! with `didOpen`. Notifications for one URI never overlap: each takes the
//! document's turn and holds it until written.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{OwnedMutexGuard, watch};
use tokio::task::JoinHandle;

use crate::rpc::lock;
use crate::session::Session;
use crate::types::SessionState;

type Turn = Arc<tokio::sync::Mutex<()>>;

struct DocumentSyncEntry {
    session: Session,
    /// Tells this open of the URI apart from earlier ones.
    epoch: u64,
    /// Held while a notification for the URI is in flight. Shared across
    /// reopens.
    turn: Turn,
    /// `didOpen` was sent. Until then `pending_text` is the text to open with.
    opened: bool,
    /// Last version sent to the server.
    version: i32,
    /// Latest text not yet sent.
    pending_text: Option<String>,
    debounce: Option<JoinHandle<()>>,
    /// Bumped on every edit; a timer only fires for the edit that armed it.
    generation: u64,
    /// Forgets the entry when its session ends.
    watcher: Option<JoinHandle<()>>,
}

impl DocumentSyncEntry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.debounce.take() {
            timer.abort();
        }
    }
}

impl Drop for DocumentSyncEntry {
    fn drop(&mut self) {
        self.cancel_timer();
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

type Entries = HashMap<String, DocumentSyncEntry>;

/// The entry for `uri`, if it still belongs to the open identified by `epoch`.
fn current<'a>(
    entries: &'a mut Entries,
    uri: &str,
    epoch: u64,
) -> Option<&'a mut DocumentSyncEntry> {
    entries.get_mut(uri).filter(|entry| entry.epoch == epoch)
}

struct SyncInner {
    debounce: Duration,
    entries: Mutex<Entries>,
    next_epoch: AtomicU64,
}

/// Tracks open documents per URI and keeps their sessions in sync.
#[derive(Clone)]
pub struct DocumentSync {
    inner: Arc<SyncInner>,
}

impl DocumentSync {
    #[must_use]
    pub fn new(debounce: Duration) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                debounce,
                entries: Mutex::new(HashMap::new()),
                next_epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Start tracking `uri` and send `didOpen` at version 1 once the session
    /// is ready.
    ///
    /// Changes that arrive while the session starts are folded into the
    /// opening text. Returns `false` (and tracks nothing) if the session
    /// never became ready or the document was closed or reopened meanwhile.
    pub async fn open(&self, session: &Session, uri: &str, text: &str) -> bool {
        let epoch = self.inner.next_epoch.fetch_add(1, Ordering::Relaxed);
        {
            let mut entries = lock(&self.inner.entries);
            let turn = match entries.remove(uri) {
                Some(previous) => {
                    tracing::debug!(uri, "document reopened; restarting at version 1");
                    previous.turn.clone()
                }
                None => Turn::default(),
            };
            // Spawned under the lock so it cannot look for the entry too early.
            let watcher = tokio::spawn(forget_when_ended(
                Arc::downgrade(&self.inner),
                uri.to_string(),
                epoch,
                session.subscribe(),
            ));
            entries.insert(
                uri.to_string(),
                DocumentSyncEntry {
                    session: session.clone(),
                    epoch,
                    turn,
                    opened: false,
                    version: 0,
                    pending_text: Some(text.to_string()),
                    debounce: None,
                    generation: 0,
                    watcher: Some(watcher),
                },
            );
        }

        if !session.wait_ready().await {
            tracing::debug!(uri, language = %session.language(), "session not ready; dropping document");
            let removed = {
                let mut entries = lock(&self.inner.entries);
                if current(&mut entries, uri, epoch).is_some() {
                    entries.remove(uri)
                } else {
                    None
                }
            };
            drop(removed);
            return false;
        }

        let Some((_turn, _)) = self.take_turn(uri).await else {
            return false;
        };
        let text = {
            let mut entries = lock(&self.inner.entries);
            let Some(entry) = current(&mut entries, uri, epoch) else {
                tracing::debug!(uri, "document closed before its server was ready");
                return false;
            };
            entry.opened = true;
            entry.version = 1;
            entry.pending_text.take().unwrap_or_default()
        };

        session.did_open(uri, 1, &text).await;
        true
    }

    /// Record new buffer content and (re)arm the debounce timer.
    ///
    /// Must be called from within a tokio runtime. Unknown URIs are ignored.
    pub fn change(&self, uri: &str, text: String) {
        let mut entries = lock(&self.inner.entries);
        let Some(entry) = entries.get_mut(uri) else {
            tracing::trace!(uri, "change for untracked document");
            return;
        };

        entry.pending_text = Some(text);
        entry.generation += 1;
        entry.cancel_timer();
        if !entry.opened {
            // Goes out with `didOpen`.
            return;
        }
        entry.debounce = Some(tokio::spawn(self.clone().flush_after(
            uri.to_string(),
            entry.epoch,
            entry.generation,
        )));
    }

    async fn flush_after(self, uri: String, epoch: u64, generation: u64) {
        tokio::time::sleep(self.inner.debounce).await;
        let Some((_turn, turn_epoch)) = self.take_turn(&uri).await else {
            return;
        };
        if turn_epoch == epoch {
            self.send_pending(&uri, epoch, Some(generation)).await;
        }
    }

    /// Wait until no other notification for `uri` is in flight. `None` if
    /// the document is not tracked. Also returns the epoch seen on entry.
    async fn take_turn(&self, uri: &str) -> Option<(OwnedMutexGuard<()>, u64)> {
        let (turn, epoch) = {
            let entries = lock(&self.inner.entries);
            let entry = entries.get(uri)?;
            (entry.turn.clone(), entry.epoch)
        };
        Some((turn.lock_owned().await, epoch))
    }

    /// Send the pending change, if any. The caller holds the document's turn.
    ///
    /// With `armed_by` set, only the timer for that edit may send, and it
    /// detaches itself instead of aborting. The version moves only when the
    /// session is ready to receive the change.
    async fn send_pending(&self, uri: &str, epoch: u64, armed_by: Option<u64>) {
        let outgoing = {
            let mut entries = lock(&self.inner.entries);
            let Some(entry) = current(&mut entries, uri, epoch) else {
                return;
            };
            match armed_by {
                Some(generation) if generation != entry.generation => return,
                Some(_) => entry.debounce = None,
                None => entry.cancel_timer(),
            }
            if !entry.opened || !entry.session.is_ready() {
                return;
            }
            let Some(text) = entry.pending_text.take() else {
                return;
            };
            entry.version += 1;
            (entry.session.clone(), entry.version, text)
        };

        let (session, version, text) = outgoing;
        session.did_change(uri, version, &text).await;
    }

    /// Flush any pending change, then send `didSave`.
    pub async fn save(&self, uri: &str) {
        let Some((_turn, epoch)) = self.take_turn(uri).await else {
            tracing::trace!(uri, "save for untracked document");
            return;
        };
        self.send_pending(uri, epoch, None).await;

        let session = {
            let mut entries = lock(&self.inner.entries);
            current(&mut entries, uri, epoch)
                .filter(|entry| entry.opened)
                .map(|entry| entry.session.clone())
        };
        if let Some(session) = session {
            session.did_save(uri, None).await;
        }
    }

    /// Stop tracking `uri` and send `didClose` after any notification already
    /// in flight. A pending change is dropped.
    pub async fn close(&self, uri: &str) {
        let entry = lock(&self.inner.entries).remove(uri);
        let Some(entry) = entry else {
            tracing::trace!(uri, "close for untracked document");
            return;
        };
        let (session, opened, turn) = (entry.session.clone(), entry.opened, entry.turn.clone());
        drop(entry);

        let _turn = turn.lock_owned().await;
        if opened {
            session.did_close(uri).await;
        }
    }

    /// Drop every document owned by the session for `language`. Nothing is
    /// sent; the session is going away.
    pub fn forget_session(&self, language: &str) {
        lock(&self.inner.entries).retain(|uri, entry| {
            if entry.session.language() != language {
                return true;
            }
            tracing::trace!(uri = %uri, language, "forgetting document");
            false
        });
    }

    /// Last version sent for `uri`. `None` until `didOpen` went out.
    #[must_use]
    pub fn version(&self, uri: &str) -> Option<i32> {
        lock(&self.inner.entries)
            .get(uri)
            .filter(|entry| entry.opened)
            .map(|entry| entry.version)
    }

    /// Whether `uri` is tracked, including while its session starts.
    #[must_use]
    pub fn is_open(&self, uri: &str) -> bool {
        lock(&self.inner.entries).contains_key(uri)
    }
}

/// Drop the entry for `uri` once its session can no longer serve it.
async fn forget_when_ended(
    sync: Weak<SyncInner>,
    uri: String,
    epoch: u64,
    mut states: watch::Receiver<SessionState>,
) {
    // An error means the session is gone, which ends it too.
    let _ = states.wait_for(SessionState::has_ended).await;
    let Some(inner) = sync.upgrade() else {
        return;
    };
    let removed = {
        let mut entries = lock(&inner.entries);
        if current(&mut entries, &uri, epoch).is_none() {
            return;
        }
        entries.remove(&uri)
    };
    if let Some(entry) = removed {
        tracing::debug!(uri = %uri, language = %entry.session.language(), "session ended; forgetting document");
    }
}
