use crate::backend::{Backend, ChangeFeed, RawChangeEvent, Subscription};
use crate::collection::Collection;
use crate::errors::{SyncError, SyncResult};
use crate::fetch::FetchController;
use crate::merge::{self, decode_event};
use crate::models::{draft_row, parse_record, Record};
use crate::projection::{project, ListQuery, PageResponse};
use crate::scope::{Scope, ScopeState};
use crate::settings::SyncSettings;
use crate::tracker::{MutationTracker, PendingMutation};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{timeout, Duration};

type Outcome<R> = SyncResult<Option<R>>;

#[derive(Debug)]
pub struct MutationTicket<R: Record> {
    pub mutation: PendingMutation<R>,
    outcome: oneshot::Receiver<Outcome<R>>,
}

impl<R: Record> MutationTicket<R> {
    /// Waits for the backend. Creates resolve to the stored record (or `None`
    /// when it falls outside the view's scope); updates and deletes to `None`.
    /// Failures have already been rolled back when the error is returned.
    pub async fn settled(self) -> Outcome<R> {
        self.outcome.await.map_err(|_| SyncError::Detached)?
    }
}

struct ViewState<R: Record> {
    scope: Option<Scope>,
    collection: Collection<R>,
    tracker: MutationTracker<R>,
    generation: u64,
    subscription: Option<Subscription>,
    pump: Option<JoinHandle<()>>,
    writes: HashMap<String, AbortHandle>,
    change_seq: u64,
    refreshes: usize,
    // Keys changed while a refresh query is in flight, with the change_seq of their last change.
    touched: HashMap<String, u64>,
}

impl<R: Record> ViewState<R> {
    fn new(key_prefix: String) -> Self {
        Self {
            scope: None,
            collection: Collection::new(),
            tracker: MutationTracker::new(key_prefix),
            generation: 0,
            subscription: None,
            pump: None,
            writes: HashMap::new(),
            change_seq: 0,
            refreshes: 0,
            touched: HashMap::new(),
        }
    }

    fn attached_scope(&self) -> SyncResult<Scope> {
        self.scope.clone().ok_or(SyncError::Detached)
    }

    fn touch(&mut self, key: &str) {
        self.change_seq += 1;
        if self.refreshes > 0 {
            self.touched.insert(key.to_string(), self.change_seq);
        }
    }

    // Copies the live state of every key changed after `epoch` onto `fresh`.
    fn replay_onto(&self, fresh: &mut Collection<R>, epoch: u64) -> usize {
        let mut replayed = 0;
        for (key, seq) in &self.touched {
            if *seq <= epoch {
                continue;
            }
            match self.collection.get(key) {
                Some(record) => {
                    fresh.upsert(record.clone());
                }
                None => {
                    fresh.remove(key);
                }
            }
            replayed += 1;
        }
        replayed
    }

    fn abort_tasks(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        for (_, write) in self.writes.drain() {
            write.abort();
        }
    }
}

impl<R: Record> Drop for ViewState<R> {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

pub struct SyncedView<R: Record> {
    backend: Arc<dyn Backend>,
    fetcher: FetchController,
    settings: SyncSettings,
    state: Arc<Mutex<ViewState<R>>>,
    revisions: Arc<watch::Sender<u64>>,
}

impl<R: Record> Clone for SyncedView<R> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            fetcher: self.fetcher.clone(),
            settings: self.settings.clone(),
            state: self.state.clone(),
            revisions: self.revisions.clone(),
        }
    }
}

// What background tasks hold. Once every SyncedView is gone the state drops,
// which aborts them and releases the subscription.
struct ViewHandle<R: Record> {
    state: Weak<Mutex<ViewState<R>>>,
    revisions: Arc<watch::Sender<u64>>,
}

impl<R: Record> ViewHandle<R> {
    fn bump(&self) {
        self.revisions.send_modify(|revision| *revision += 1);
    }

    async fn settle(&self, generation: u64, key: &str, result: Outcome<R>) -> Outcome<R> {
        let Some(shared) = self.state.upgrade() else {
            return result;
        };
        let mut state = shared.lock().await;
        if state.generation != generation {
            return result;
        }
        state.writes.remove(key);

        let scope = state.scope.clone();
        let outcome = match result {
            Ok(authoritative) => {
                let visible =
                    authoritative.filter(|record| scope.as_ref().is_some_and(|scope| scope.admits(record)));
                let ViewState { collection, tracker, .. } = &mut *state;
                tracker.complete_success(key, visible.clone(), collection);
                if let Some(record) = &visible {
                    state.touch(record.key());
                }
                Ok(visible)
            }
            Err(error) => {
                tracing::warn!(table = R::TABLE.as_str(), key = %key, error = %error, "optimistic write failed");
                let ViewState { collection, tracker, .. } = &mut *state;
                tracker.complete_failure(key, collection);
                Err(error)
            }
        };
        state.touch(key);
        drop(state);

        self.bump();
        outcome
    }

    async fn run_pump(self, generation: u64, mut events: mpsc::Receiver<RawChangeEvent>) {
        while let Some(raw) = events.recv().await {
            let Some(shared) = self.state.upgrade() else {
                return;
            };
            let mut state = shared.lock().await;
            if state.generation != generation {
                return;
            }
            let Some(scope) = state.scope.clone() else {
                return;
            };

            let event = match decode_event::<R>(raw) {
                Ok(event) => event,
                Err(error) => {
                    tracing::warn!(table = R::TABLE.as_str(), error = %error, "dropping malformed change event");
                    continue;
                }
            };
            state.tracker.observe_event(event.key());
            state.touch(event.key());
            let collection = std::mem::take(&mut state.collection);
            state.collection = merge::apply(event, collection, &scope);
            drop(state);

            self.bump();
        }
        tracing::debug!(table = R::TABLE.as_str(), generation, "change feed closed");
    }
}

impl<R: Record> SyncedView<R> {
    pub fn new(backend: Arc<dyn Backend>, settings: SyncSettings) -> SyncResult<Self> {
        settings.validate()?;
        let fetcher = FetchController::new(backend.clone(), settings.fetch_timeout_ms);
        let (revisions, _) = watch::channel(0u64);
        Ok(Self {
            backend,
            fetcher,
            state: Arc::new(Mutex::new(ViewState::new(settings.provisional_key_prefix.clone()))),
            settings,
            revisions: Arc::new(revisions),
        })
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn watch_revisions(&self) -> watch::Receiver<u64> {
        self.revisions.subscribe()
    }

    fn handle(&self) -> ViewHandle<R> {
        ViewHandle {
            state: Arc::downgrade(&self.state),
            revisions: self.revisions.clone(),
        }
    }

    fn bump(&self) {
        self.revisions.send_modify(|revision| *revision += 1);
    }

    pub async fn is_attached(&self) -> bool {
        self.state.lock().await.scope.is_some()
    }

    pub async fn scope(&self) -> Option<Scope> {
        self.state.lock().await.scope.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.tracker.len()
    }

    pub async fn pending(&self, key: &str) -> Option<PendingMutation<R>> {
        self.state.lock().await.tracker.get(key).cloned()
    }

    pub async fn attach(&self, scope: impl Into<ScopeState>) -> SyncResult<()> {
        let scope_state = scope.into();
        let scope = scope_state.resolved()?.clone();
        self.detach().await;

        // Subscribe before loading; events raised during the load wait in the feed.
        let feed = match timeout(
            Duration::from_millis(self.settings.fetch_timeout_ms),
            self.backend.subscribe(R::TABLE, self.settings.event_buffer),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(SyncError::timed_out(
                    format!("subscribe {}", R::TABLE.as_str()),
                    self.settings.fetch_timeout_ms,
                ))
            }
        };

        let collection = match self.fetcher.load::<R>(&scope_state).await {
            Ok(collection) => collection,
            Err(error) => {
                feed.subscription.release();
                return Err(error);
            }
        };

        let ChangeFeed { subscription, events } = feed;
        let mut state = self.state.lock().await;
        state.generation += 1;
        let generation = state.generation;
        state.scope = Some(scope);
        state.collection = collection;
        state.subscription = Some(subscription);
        state.pump = Some(tokio::spawn(self.handle().run_pump(generation, events)));
        let loaded = state.collection.len();
        drop(state);

        self.bump();
        tracing::info!(table = R::TABLE.as_str(), generation, records = loaded, "view attached");
        Ok(())
    }

    pub async fn detach(&self) {
        let mut state = self.state.lock().await;
        if state.scope.is_none() && state.pump.is_none() && state.subscription.is_none() {
            return;
        }

        state.generation += 1;
        state.scope = None;
        state.abort_tasks();
        if let Some(subscription) = state.subscription.take() {
            subscription.release();
        }
        state.tracker.clear();
        state.collection = Collection::new();
        state.refreshes = 0;
        state.touched.clear();
        let generation = state.generation;
        drop(state);

        self.bump();
        tracing::info!(table = R::TABLE.as_str(), generation, "view detached");
    }

    pub async fn refresh(&self) -> SyncResult<()> {
        let (scope, generation, epoch) = {
            let mut state = self.state.lock().await;
            let scope = state.attached_scope()?;
            state.refreshes += 1;
            (scope, state.generation, state.change_seq)
        };

        let loaded = self.fetcher.load::<R>(&ScopeState::Resolved(scope.clone())).await;

        let mut state = self.state.lock().await;
        if state.generation != generation {
            return Err(SyncError::Detached);
        }
        state.refreshes -= 1;
        let replayed = match loaded {
            Ok(mut fresh) => {
                // Keys touched while the query ran keep their live state over the snapshot.
                let replayed = state.replay_onto(&mut fresh, epoch);
                state.tracker.overlay(&mut fresh, &scope);
                state.collection = fresh;
                Ok(replayed)
            }
            Err(error) => Err(error),
        };
        if state.refreshes == 0 {
            state.touched.clear();
        }
        drop(state);

        let replayed = replayed?;
        self.bump();
        tracing::debug!(table = R::TABLE.as_str(), replayed, "view refreshed");
        Ok(())
    }

    pub async fn get_collection(&self) -> Vec<R> {
        self.state.lock().await.collection.snapshot()
    }

    pub async fn get(&self, key: &str) -> Option<R> {
        self.state.lock().await.collection.get(key).cloned()
    }

    pub async fn page(&self, query: &ListQuery) -> PageResponse<R> {
        project(self.get_collection().await, query, self.settings.default_page_size)
    }

    pub async fn create_optimistic(&self, draft: R) -> SyncResult<MutationTicket<R>> {
        let row = draft_row(&draft)?;
        let mut state = self.state.lock().await;
        let scope = state.attached_scope()?;

        let mutation = {
            let ViewState { collection, tracker, .. } = &mut *state;
            tracker.begin_create(draft, collection, &scope)
        };

        let backend = self.backend.clone();
        let outcome = self.issue_write(&mut state, mutation.key.clone(), async move {
            let stored = backend.insert(R::TABLE, row).await?;
            parse_record::<R>(&stored).map(Some)
        });
        drop(state);

        self.bump();
        Ok(MutationTicket { mutation, outcome })
    }

    pub async fn update_optimistic(&self, key: &str, patch: Value) -> SyncResult<MutationTicket<R>> {
        let mut state = self.state.lock().await;
        let scope = state.attached_scope()?;

        let mutation = {
            let ViewState { collection, tracker, .. } = &mut *state;
            tracker.begin_update(key, patch, collection, &scope)?
        };

        let backend = self.backend.clone();
        let write_key = key.to_string();
        let patch = mutation.patch.clone().unwrap_or(Value::Null);
        let outcome = self.issue_write(&mut state, key.to_string(), async move {
            backend.update(R::TABLE, &write_key, patch).await.map(|_| None)
        });
        drop(state);

        self.bump();
        Ok(MutationTicket { mutation, outcome })
    }

    pub async fn delete_optimistic(&self, key: &str) -> SyncResult<MutationTicket<R>> {
        let mut state = self.state.lock().await;
        state.attached_scope()?;

        let mutation = {
            let ViewState { collection, tracker, .. } = &mut *state;
            tracker.begin_delete(key, collection)?
        };

        let backend = self.backend.clone();
        let write_key = key.to_string();
        let outcome = self.issue_write(&mut state, key.to_string(), async move {
            backend.delete(R::TABLE, &write_key).await.map(|_| None)
        });
        drop(state);

        self.bump();
        Ok(MutationTicket { mutation, outcome })
    }

    // Spawned while the caller holds the state lock, so the task cannot
    // settle before its abort handle is registered.
    fn issue_write<F>(&self, state: &mut ViewState<R>, key: String, write: F) -> oneshot::Receiver<Outcome<R>>
    where
        F: Future<Output = Outcome<R>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let handle = self.handle();
        let generation = state.generation;
        let timeout_ms = self.settings.write_timeout_ms;
        let task_key = key.clone();

        let task = tokio::spawn(async move {
            let result = match timeout(Duration::from_millis(timeout_ms), write).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::timed_out(
                    format!("write {} '{}'", R::TABLE.as_str(), task_key),
                    timeout_ms,
                )),
            };
            let outcome = handle.settle(generation, &task_key, result).await;
            let _ = sender.send(outcome);
        });
        state.writes.insert(key, task.abort_handle());
        receiver
    }
}
