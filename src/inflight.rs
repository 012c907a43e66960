//! Creation attempts that haven't committed yet
//!
//! A client that retries a slow create call will send the same request again
//! while the first attempt is still running. The second request finds the
//! first one here and waits for its outcome instead of racing it.

use crate::{
    cleanup::{CleanupStack, UndoFailure},
    context::Context,
    errors::ServerError,
    lock::lock,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::sync::watch;

/// Progress of one creation attempt, as seen by waiters
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// still running
    Pending,
    /// committed under this id
    Committed(String),
    /// finished but not committed; preserved for adoption under this id
    Preserved(String),
    /// failed and rolled back
    Failed(String),
}

struct Entry {
    id: String,
    stage: String,
    outcome: watch::Sender<Outcome>,
    cleanup: Option<CleanupStack>,
    preserved_at: Option<Instant>,
}

/// Result of trying to claim a name for a new attempt
#[derive(Debug, PartialEq, Eq)]
pub enum Claim {
    /// this request owns the attempt
    Claimed,
    /// another attempt with this id holds the name
    Existing(String),
}

/// Tracks in-progress and preserved creation attempts by name
///
/// Clones share the same entries.
#[derive(Clone)]
pub struct InFlightCache {
    kind: &'static str,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InFlightCache {
    /// `kind` names the object type in errors, like "sandbox"
    pub fn new(kind: &'static str) -> Self {
        InFlightCache {
            kind,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Claim `name` for a new attempt under `id`, as an [Attempt] guard
    ///
    /// Returns the id of the attempt already holding the name otherwise.
    pub fn claim(&self, name: &str, id: &str) -> Result<Attempt, String> {
        match self.begin(name, id) {
            Claim::Claimed => Ok(Attempt {
                cache: self.clone(),
                name: name.to_string(),
                id: id.to_string(),
                cleanup: CleanupStack::new(),
                finished: false,
            }),
            Claim::Existing(existing) => Err(existing),
        }
    }

    /// Claim `name` for a new attempt under `id`
    ///
    /// If another attempt already holds the name, nothing changes and its id
    /// is returned; the caller should [get_or_wait](Self::get_or_wait) on it.
    pub fn begin(&self, name: &str, id: &str) -> Claim {
        let mut entries = lock(&self.entries);
        if let Some(existing) = entries.get(name) {
            return Claim::Existing(existing.id.clone());
        }
        let (outcome, _) = watch::channel(Outcome::Pending);
        entries.insert(
            name.to_string(),
            Entry {
                id: id.to_string(),
                stage: "requested".to_string(),
                outcome,
                cleanup: None,
                preserved_at: None,
            },
        );
        Claim::Claimed
    }

    /// Record which stage an attempt has reached
    pub fn set_stage(&self, name: &str, stage: &str) {
        if let Some(entry) = lock(&self.entries).get_mut(name) {
            entry.stage = stage.to_string();
        }
    }

    pub fn stage(&self, name: &str) -> Option<String> {
        lock(&self.entries).get(name).map(|entry| entry.stage.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        lock(&self.entries).contains_key(name)
    }

    /// Preserve a finished but uncommitted attempt so a later request can
    /// adopt it
    ///
    /// The cleanup stack is kept in case nobody ever does.
    pub fn put(&self, name: &str, id: &str, cleanup: CleanupStack) {
        let mut entries = lock(&self.entries);
        let entry = entries.entry(name.to_string()).or_insert_with(|| Entry {
            id: id.to_string(),
            stage: String::new(),
            outcome: watch::channel(Outcome::Pending).0,
            cleanup: None,
            preserved_at: None,
        });
        entry.id = id.to_string();
        entry.stage = "preserved".to_string();
        entry.cleanup = Some(cleanup);
        entry.preserved_at = Some(Instant::now());
        entry.outcome.send_replace(Outcome::Preserved(id.to_string()));
        log::info!("preserved {} {:?} ({}) for adoption", self.kind, name, id);
    }

    /// The attempt committed; wake waiters and forget it
    pub fn commit(&self, name: &str) {
        if let Some(entry) = lock(&self.entries).remove(name) {
            entry.outcome.send_replace(Outcome::Committed(entry.id.clone()));
        }
    }

    /// The attempt failed; wake waiters with the reason and forget it
    pub fn fail(&self, name: &str, reason: &str) {
        if let Some(entry) = lock(&self.entries).remove(name) {
            entry.outcome.send_replace(Outcome::Failed(reason.to_string()));
        }
    }

    /// Fail the attempt `id` still pending under `name`
    ///
    /// A later attempt or a preserved one holding the name is left alone.
    fn fail_attempt(&self, name: &str, id: &str, reason: &str) {
        let mut entries = lock(&self.entries);
        let pending = matches!(entries.get(name), Some(entry) if entry.id == id && entry.cleanup.is_none());
        if pending {
            if let Some(entry) = entries.remove(name) {
                entry.outcome.send_replace(Outcome::Failed(reason.to_string()));
            }
        }
    }

    /// Forget an entry, handing back its cleanup stack if it had one
    pub fn delete(&self, name: &str) -> Option<CleanupStack> {
        lock(&self.entries)
            .remove(name)
            .and_then(|mut entry| entry.cleanup.take())
    }

    /// Take over a preserved attempt, discarding its cleanup stack
    ///
    /// Returns the adopted id, or None if there's no preserved entry.
    pub fn adopt(&self, name: &str) -> Option<String> {
        let mut entries = lock(&self.entries);
        let preserved = matches!(entries.get(name), Some(entry) if entry.cleanup.is_some());
        if !preserved {
            return None;
        }
        let mut entry = entries.remove(name)?;
        if let Some(cleanup) = entry.cleanup.take() {
            cleanup.discard();
        }
        entry.outcome.send_replace(Outcome::Committed(entry.id.clone()));
        log::info!("adopted preserved {} {:?} ({})", self.kind, name, entry.id);
        Some(entry.id)
    }

    /// Wait for the attempt holding `name` to finish
    ///
    /// Returns `Ok(None)` if there is no attempt, the id if the attempt
    /// committed or was preserved (adopting it), or an error if it failed,
    /// the wait timed out, or `ctx` ended first.
    pub async fn get_or_wait(
        &self,
        name: &str,
        ctx: &Context,
        timeout: Duration,
    ) -> Result<Option<String>, ServerError> {
        let mut outcome = match lock(&self.entries).get(name) {
            None => return Ok(None),
            Some(entry) => entry.outcome.subscribe(),
        };
        log::debug!("waiting for in-flight {} {:?}", self.kind, name);

        let finished = async {
            loop {
                let current = outcome.borrow().clone();
                if current != Outcome::Pending {
                    return current;
                }
                if outcome.changed().await.is_err() {
                    let last = outcome.borrow().clone();
                    return match last {
                        Outcome::Pending => Outcome::Failed("attempt was abandoned".to_string()),
                        other => other,
                    };
                }
            }
        };

        let result = tokio::select! {
            result = finished => result,
            _ = tokio::time::sleep(timeout) => {
                return Err(ServerError::StillInFlight {
                    kind: self.kind,
                    name: name.to_string(),
                    stage: self.stage(name).unwrap_or_default(),
                })
            }
            _ = ctx.done() => return Err(ctx.err().unwrap_or(ServerError::Cancelled)),
        };

        match result {
            Outcome::Committed(id) => Ok(Some(id)),
            Outcome::Preserved(id) => Ok(Some(self.adopt(name).unwrap_or(id))),
            Outcome::Failed(reason) => Err(ServerError::InFlightFailed {
                kind: self.kind,
                name: name.to_string(),
                reason,
            }),
            Outcome::Pending => Ok(None),
        }
    }

    /// Remove preserved attempts nobody adopted within `max_age`
    ///
    /// Returns `(name, id, cleanup)` for each; the caller unwinds them.
    pub fn take_abandoned(&self, max_age: Duration) -> Vec<(String, String, CleanupStack)> {
        let mut entries = lock(&self.entries);
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| {
                matches!(entry.preserved_at, Some(at) if at.elapsed() >= max_age)
            })
            .map(|(name, _)| name.clone())
            .collect();
        let mut abandoned = Vec::new();
        for name in expired {
            if let Some(mut entry) = entries.remove(&name) {
                entry
                    .outcome
                    .send_replace(Outcome::Failed("abandoned before adoption".to_string()));
                if let Some(cleanup) = entry.cleanup.take() {
                    abandoned.push((name, entry.id, cleanup));
                }
            }
        }
        abandoned
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A claimed creation attempt and the undo actions it has registered
///
/// Finishing it with [commit](Self::commit), [preserve](Self::preserve) or
/// [roll_back](Self::roll_back) clears the claim. If it is dropped
/// unfinished, because the future driving the creation was dropped, its
/// cleanup stack is unwound in the background and the claim fails only once
/// that is done, so a retry never finds the name held by a dead attempt.
pub struct Attempt {
    cache: InFlightCache,
    name: String,
    id: String,
    cleanup: CleanupStack,
    finished: bool,
}

impl Attempt {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Undo actions for everything this attempt acquires
    pub fn cleanup(&mut self) -> &mut CleanupStack {
        &mut self.cleanup
    }

    /// Success: forget the undo actions and wake waiters with the id
    pub fn commit(mut self) {
        self.finished = true;
        std::mem::take(&mut self.cleanup).discard();
        self.cache.commit(&self.name);
    }

    /// Keep the finished but uncommitted attempt for a retry to adopt
    pub fn preserve(mut self) {
        self.finished = true;
        let cleanup = std::mem::take(&mut self.cleanup);
        self.cache.put(&self.name, &self.id, cleanup);
    }

    /// Unwind every undo action, then fail the claim with `reason`
    pub async fn roll_back(mut self, reason: &str) -> Vec<UndoFailure> {
        let failures = std::mem::take(&mut self.cleanup).unwind().await;
        self.finished = true;
        self.cache.fail_attempt(&self.name, &self.id, reason);
        failures
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        log::warn!(
            "{} {:?} ({}) was dropped before it finished, rolling back",
            self.cache.kind,
            self.name,
            self.id
        );
        let cleanup = std::mem::take(&mut self.cleanup);
        let cache = self.cache.clone();
        let name = std::mem::take(&mut self.name);
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    cleanup.unwind().await;
                    cache.fail_attempt(&name, &id, DROPPED);
                });
            }
            Err(_) => cache.fail_attempt(&name, &id, DROPPED),
        }
    }
}

const DROPPED: &str = "attempt was dropped before it finished";
