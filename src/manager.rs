use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use fieldx_plus::fx_plus;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::error;

use crate::aggregator::Aggregator;
use crate::cache::AddOutcome;
use crate::cache::CacheState;
use crate::cache::EntityCache;
use crate::config::ManagerConfig;
use crate::descriptor;
use crate::descriptor::Completion;
use crate::descriptor::RequestDescriptor;
use crate::descriptor::Target;
use crate::dispatcher::Dispatcher;
use crate::error::ConfigError;
use crate::error::FetchError;
use crate::error::TransportError;
use crate::router;
use crate::traits::NoopObserver;
use crate::traits::Observer;
use crate::traits::Transport;
use crate::types::Entity;
use crate::types::EntityMap;
use crate::types::ProgressSender;
use crate::types::ProgressSink;
use crate::types::QueueDiscipline;
use crate::types::ResponseBody;
use crate::types::ResponseType;
use crate::types::Selector;
use crate::types::TransportRequest;
use crate::types::TransportResponse;
use crate::waiting::WaitingRegistry;

type Started = Vec<(u64, TransportRequest, ProgressSink)>;

/// Result of [`EntityManager::read`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// Reads by key are answered with the entities found.
    Entities(EntityMap),
    /// Query reads bypass the cache and return the response as is.
    Response(ResponseBody),
}

impl ReadOutcome {
    pub fn into_entities(self) -> Option<EntityMap> {
        match self {
            Self::Entities(entities) => Some(entities),
            Self::Response(_) => None,
        }
    }

    pub fn into_response(self) -> Option<ResponseBody> {
        match self {
            Self::Response(body) => Some(body),
            Self::Entities(_) => None,
        }
    }
}

// Everything that has to be mutated in one go when a request is scheduled or completed.
#[derive(Debug, Default)]
struct ManagerState {
    aggregator:       Aggregator,
    dispatcher:       Dispatcher,
    waiting:          WaitingRegistry,
    // Bumped on every timer restart so that a timer which lost the race for the state lock doesn't flush early.
    timer_generation: u64,
}

// What the observer has to be told once the state lock is released.
#[derive(Debug, Default)]
struct Notices {
    debug:    Vec<String>,
    warnings: Vec<String>,
    errors:   Vec<FetchError>,
}

enum Demand {
    Ready(EntityMap),
    Waiting(oneshot::Receiver<Result<EntityMap, FetchError>>),
}

fn default_observer() -> Arc<dyn Observer> {
    Arc::new(NoopObserver)
}

/// CRUD façade over a remote entity store, with a read-batching cache in front of reads by key.
///
/// A read by key never results in more than one fetch of the same key: keys already present are answered from the
/// cache, keys with a fetch in flight are waited for, and the rest are collected for the duration of the aggregation
/// window and then requested in bunches of at most [`bunch_size`](ManagerConfig::bunch_size) keys. No more than
/// [`concurrency`](ManagerConfig::concurrency) transport calls are in flight at any moment; the rest sit in the
/// request queue.
///
/// Reads by query and all writes go to the request queue directly and are answered with the response body.
///
/// ```ignore
/// let manager = EntityManager::new(transport, ManagerConfig::new("/api/scenes"))?;
/// let scene = manager.read_one("s-1").await?;
/// let walls = manager.read_where(query, None).await?;
/// ```
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`EntityManager`].", "", "Prefer [`EntityManager::new()`] which validates the configuration."),
        method_doc("Implement builder pattern for [`EntityManager`]."),
    )
)]
pub struct EntityManager<T>
where
    T: Transport,
{
    #[fieldx(vis(pub(crate)), builder(vis(pub), required, into), get(clone))]
    transport: Arc<T>,

    #[fieldx(lock, private, get, set, builder(vis(pub), required))]
    config: ManagerConfig,

    /// Pluggable logger, notified in addition to `tracing`.
    #[fieldx(lock, vis(pub), get, set, builder(vis(pub)), default(default_observer()))]
    observer: Arc<dyn Observer>,

    /// The per-manager cache. Entities are cached per resource path; another manager has its own.
    #[fieldx(lazy, lock, clearer(private), vis(pub), get(clone), builder(off))]
    cache: Arc<EntityCache>,

    #[fieldx(private, lazy, lock, get_mut, builder(off))]
    state: ManagerState,

    #[fieldx(private, clearer, lock, get, set, builder(off))]
    aggregation_timer: tokio::task::JoinHandle<()>,
}

impl<T> EntityManager<T>
where
    T: Transport,
{
    /// Create a manager after validating the configuration.
    pub fn new(transport: Arc<T>, config: ManagerConfig) -> Result<Arc<Self>, ConfigError> {
        config.check()?;
        Self::builder()
            .transport(transport)
            .config(config)
            .build()
            .map_err(|err| ConfigError::Builder {
                what:    "entity manager",
                message: err.to_string(),
            })
    }

    fn build_cache(&self) -> Arc<EntityCache> {
        Arc::new(EntityCache::new(self.config().base_path.clone()))
    }

    fn build_state(&self) -> ManagerState {
        ManagerState {
            aggregator: Aggregator::new(),
            dispatcher: Dispatcher::new(),
            waiting: WaitingRegistry::new(),
            timer_generation: 0,
        }
    }

    /// A copy of the current configuration.
    pub fn configuration(&self) -> ManagerConfig {
        self.config().clone()
    }

    // Changes are validated on a copy; an invalid change leaves the configuration untouched.
    fn reconfigure(&self, change: impl FnOnce(&mut ManagerConfig)) -> Result<(), ConfigError> {
        let mut config = self.configuration();
        change(&mut config);
        config.check()?;
        self.set_config(config);
        Ok(())
    }

    /// The cache belongs to the base path. Moving to another path starts over with an empty cache, which is only
    /// allowed while nothing is buffered, queued, in flight or waiting.
    pub fn set_base_path(&self, base_path: impl Into<String>) -> Result<(), ConfigError> {
        let base_path = base_path.into();
        let state = self.state_mut();

        if self.config().base_path == base_path {
            return Ok(());
        }
        if !(state.dispatcher.is_idle() && state.aggregator.is_empty() && state.waiting.is_empty()) {
            return Err(ConfigError::Busy("change base path"));
        }

        self.reconfigure(|c| c.base_path = base_path)?;
        if let Some(old) = self.clear_cache() {
            debug!(cache = old.name(), entities = old.len(), "cache dropped with the old base path");
        }
        Ok(())
    }

    pub fn set_response_type(&self, response_type: ResponseType) -> Result<(), ConfigError> {
        self.reconfigure(|c| c.response_type = response_type)
    }

    pub fn set_bunch_size(&self, bunch_size: usize) -> Result<(), ConfigError> {
        self.reconfigure(|c| c.bunch_size = bunch_size)
    }

    /// Takes effect with the next key submitted for aggregation.
    pub fn set_aggregation_window(&self, window: Duration) -> Result<(), ConfigError> {
        self.reconfigure(|c| c.aggregation_window_ms = window.as_millis() as u64)
    }

    /// Raising the bound immediately starts queued requests that now fit.
    pub fn set_concurrency(&self, concurrency: usize) -> Result<(), ConfigError> {
        self.reconfigure(|c| c.concurrency = concurrency)?;
        self.pump();
        Ok(())
    }

    pub fn set_queue_discipline(&self, discipline: QueueDiscipline) -> Result<(), ConfigError> {
        self.reconfigure(|c| c.queue_discipline = discipline)
    }

    /// Requests waiting for a free slot.
    pub fn queued_requests(&self) -> usize {
        self.state_mut().dispatcher.queued()
    }

    /// Requests with a transport call in flight.
    pub fn in_flight_requests(&self) -> usize {
        self.state_mut().dispatcher.in_flight()
    }

    /// Reads by key waiting for their keys to be fetched.
    pub fn waiting_demands(&self) -> usize {
        self.state_mut().waiting.len()
    }

    /// Keys collected in the current aggregation window.
    pub fn buffered_keys(&self) -> usize {
        self.state_mut().aggregator.len()
    }

    /// Read entities by key or by query.
    pub async fn read(&self, selector: impl Into<Selector>) -> Result<ReadOutcome, FetchError> {
        self.read_with_progress(selector, None).await
    }

    pub async fn read_with_progress(
        &self,
        selector: impl Into<Selector>,
        progress: Option<ProgressSender>,
    ) -> Result<ReadOutcome, FetchError> {
        let base_path = self.config().base_path.clone();
        Ok(match selector.into() {
            Selector::One(id) => ReadOutcome::Entities(self.read_keys(vec![id], progress).await?),
            Selector::Many(ids) => ReadOutcome::Entities(self.read_keys(ids, progress).await?),
            Selector::Where(query) => ReadOutcome::Response(
                self.submit(descriptor::read_query(&base_path, Some(query), None), progress)
                    .await?,
            ),
            Selector::All => {
                ReadOutcome::Response(self.submit(descriptor::read_query(&base_path, None, None), progress).await?)
            }
        })
    }

    /// `None` if the store doesn't know the id.
    pub async fn read_one(&self, id: impl Into<String>) -> Result<Option<Entity>, FetchError> {
        let id = id.into();
        let mut entities = self.read_keys(vec![id.clone()], None).await?;
        Ok(entities.remove(&id))
    }

    /// Ids unknown to the store are missing from the result.
    pub async fn read_many<I, S>(&self, ids: I) -> Result<EntityMap, FetchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys = Selector::ids(ids)?.keys();
        self.read_keys(keys, None).await
    }

    /// An empty query reads everything.
    pub async fn read_where(
        &self,
        query: Map<String, Value>,
        projection: Option<Value>,
    ) -> Result<ResponseBody, FetchError> {
        let target = descriptor::read_query(&self.config().base_path, Some(query), projection);
        self.submit(target, None).await
    }

    pub async fn read_all(&self, projection: Option<Value>) -> Result<ResponseBody, FetchError> {
        let target = descriptor::read_query(&self.config().base_path, None, projection);
        self.submit(target, None).await
    }

    /// A JSON object creates one entity, an array of them creates many.
    pub async fn create(&self, data: Value) -> Result<ResponseBody, FetchError> {
        self.create_with_progress(data, None).await
    }

    pub async fn create_with_progress(
        &self,
        data: Value,
        progress: Option<ProgressSender>,
    ) -> Result<ResponseBody, FetchError> {
        let target = descriptor::create(&self.config().base_path, data)?;
        self.submit(target, progress).await
    }

    pub async fn update(&self, selector: impl Into<Selector>, update: Value) -> Result<ResponseBody, FetchError> {
        self.update_with_progress(selector, update, None).await
    }

    pub async fn update_with_progress(
        &self,
        selector: impl Into<Selector>,
        update: Value,
        progress: Option<ProgressSender>,
    ) -> Result<ResponseBody, FetchError> {
        let target = descriptor::update(&self.config().base_path, selector.into(), update);
        self.submit(target, progress).await
    }

    pub async fn delete(&self, selector: impl Into<Selector>) -> Result<ResponseBody, FetchError> {
        self.delete_with_progress(selector, None).await
    }

    pub async fn delete_with_progress(
        &self,
        selector: impl Into<Selector>,
        progress: Option<ProgressSender>,
    ) -> Result<ResponseBody, FetchError> {
        let target = descriptor::delete(&self.config().base_path, selector.into());
        self.submit(target, progress).await
    }

    /// Don't wait for the aggregation window to expire; turn the buffered keys into requests right now.
    pub fn flush(&self) {
        self.flush_aggregated(None);
    }

    async fn read_keys(&self, keys: Vec<String>, progress: Option<ProgressSender>) -> Result<EntityMap, FetchError> {
        match self.demand(keys, progress) {
            Demand::Ready(entities) => Ok(entities),
            Demand::Waiting(rx) => rx.await.unwrap_or(Err(FetchError::Gone)),
        }
    }

    fn demand(&self, keys: Vec<String>, progress: Option<ProgressSender>) -> Demand {
        let mut results = EntityMap::new();
        let mut under_request = HashSet::new();
        let mut to_request = Vec::new();

        let mut state = self.state_mut();
        let cache = self.cache();
        for key in keys {
            if results.contains_key(&key) || under_request.contains(&key) {
                continue;
            }
            match cache.get(&key) {
                CacheState::Present(entity) => {
                    results.insert(key, entity);
                }
                CacheState::Pending => {
                    under_request.insert(key);
                }
                CacheState::Absent => {
                    cache.mark_pending(&key);
                    under_request.insert(key.clone());
                    to_request.push(key);
                }
            }
        }

        if under_request.is_empty() {
            debug!(cache = cache.name(), entities = results.len(), "read answered from cache");
            return Demand::Ready(results);
        }

        let (tx, rx) = oneshot::channel();
        state.waiting.register(results, under_request, tx, progress);

        if !to_request.is_empty() {
            state.aggregator.push(to_request);
            self.restart_timer(&mut state);
        }

        Demand::Waiting(rx)
    }

    fn restart_timer(&self, state: &mut ManagerState) {
        state.timer_generation += 1;
        let generation = state.timer_generation;
        let window = self.config().aggregation_window();

        if let Some(timer) = self.clear_aggregation_timer() {
            timer.abort();
        }

        if let Some(myself) = self.myself() {
            self.set_aggregation_timer(tokio::spawn(async move {
                tokio::time::sleep(window).await;
                myself.flush_aggregated(Some(generation));
            }));
        }
    }

    // With a generation, this is a timer firing; it only counts if no restart happened in the meantime.
    fn flush_aggregated(&self, generation: Option<u64>) {
        let mut notices = Notices::default();

        let started = {
            let mut state = self.state_mut();

            match generation {
                Some(generation) if generation != state.timer_generation => return,
                Some(_) => {
                    self.clear_aggregation_timer();
                }
                None => {
                    if let Some(timer) = self.clear_aggregation_timer() {
                        timer.abort();
                    }
                }
            }

            let config = self.configuration();
            let key_count = state.aggregator.len();
            let bunches = state.aggregator.drain_bunches(config.bunch_size);

            if !bunches.is_empty() {
                notices.debug.push(format!(
                    "{}: {key_count} keys flushed into {} bunches",
                    config.base_path,
                    bunches.len()
                ));
            }

            for keys in bunches {
                let id = state.dispatcher.next_id();
                let progress = ProgressSink::with_subscribers(state.waiting.progress_for(&keys));
                let target = descriptor::read_many(&config.base_path, &keys);
                debug!(id, keys = keys.len(), "bunch created");
                state.dispatcher.enqueue(RequestDescriptor::new(
                    id,
                    target,
                    ResponseType::Json,
                    progress,
                    Completion::Bunch { keys },
                ));
            }

            let (started, warnings) = self.advance(&mut state, &self.cache());
            notices.warnings = warnings;
            started
        };

        self.start(started);
        self.notify(notices);
    }

    async fn submit(&self, target: Target, progress: Option<ProgressSender>) -> Result<ResponseBody, FetchError> {
        let (tx, rx) = oneshot::channel();
        let mut notices = Notices::default();

        let started = {
            let mut state = self.state_mut();
            let id = state.dispatcher.next_id();
            state.dispatcher.enqueue(RequestDescriptor::new(
                id,
                target,
                self.config().response_type,
                ProgressSink::from(progress),
                Completion::Reply(tx),
            ));
            let (started, warnings) = self.advance(&mut state, &self.cache());
            notices.warnings = warnings;
            started
        };

        self.start(started);
        self.notify(notices);
        rx.await.unwrap_or(Err(FetchError::Gone))
    }

    fn promote_all(dispatcher: &mut Dispatcher, config: &ManagerConfig) -> Started {
        std::iter::from_fn(|| dispatcher.promote(config.concurrency, config.queue_discipline)).collect()
    }

    // Fill free slots of the process queue, then settle the waiting demands against the work that is left. Promotion
    // throws away retracted requests, so whether anything is left is only known after it.
    fn advance(&self, state: &mut ManagerState, cache: &EntityCache) -> (Started, Vec<String>) {
        let config = self.configuration();
        let started = Self::promote_all(&mut state.dispatcher, &config);
        let idle = state.dispatcher.is_idle() && state.aggregator.is_empty();
        (started, state.waiting.reconcile(cache, idle))
    }

    fn pump(&self) {
        let (started, warnings) = {
            let mut state = self.state_mut();
            self.advance(&mut state, &self.cache())
        };
        self.start(started);
        self.notify(Notices {
            warnings,
            ..Default::default()
        });
    }

    fn start(&self, started: Started) {
        if started.is_empty() {
            return;
        }
        let Some(myself) = self.myself()
        else {
            return;
        };

        for (id, request, progress) in started {
            let myself = myself.clone();
            tokio::spawn(async move {
                let outcome = myself.transport().send(request, progress).await;
                myself.complete(id, outcome);
            });
        }
    }

    fn complete(&self, id: u64, outcome: Result<TransportResponse, TransportError>) {
        let mut notices = Notices::default();

        let started = {
            let mut state = self.state_mut();
            let cache = self.cache();

            if let Some(descriptor) = state.dispatcher.finish(id) {
                let verb = descriptor.kind.verb();
                let routed = router::route(verb, &descriptor.url, descriptor.response_type, outcome);

                match descriptor.completion {
                    Completion::Bunch { keys } => {
                        match routed.and_then(|body| router::decode_entities(verb, &descriptor.url, body)) {
                            Ok(mut entities) => {
                                let mut missing = 0;
                                for key in &keys {
                                    match entities.remove(key) {
                                        Some(entity) => {
                                            if cache.add(key, Some(entity)) == AddOutcome::Rejected {
                                                notices.warnings.push(format!(
                                                    "{}: entity {key} is already resolved, keeping the first value",
                                                    cache.name()
                                                ));
                                            }
                                        }
                                        None => {
                                            cache.release(key);
                                            missing += 1;
                                        }
                                    }
                                }
                                debug!(id, keys = keys.len(), missing, "bunch completed");
                            }
                            Err(err) => {
                                error!(id, keys = keys.len(), "bunch failed: {err}");
                                for key in &keys {
                                    cache.release(key);
                                }
                                state.waiting.fail(&keys, &err);
                                notices.errors.push(err);
                            }
                        }
                    }
                    Completion::Reply(reply) => {
                        if let Err(err) = &routed {
                            error!(id, kind = %descriptor.kind, "request failed: {err}");
                            notices.errors.push(err.clone());
                        }
                        if reply.send(routed).is_err() {
                            debug!(id, "requester is gone, response dropped");
                        }
                    }
                }
            }

            let (started, warnings) = self.advance(&mut state, &cache);
            notices.warnings.extend(warnings);
            started
        };

        self.start(started);
        self.notify(notices);
    }

    fn notify(&self, notices: Notices) {
        let observer = self.observer().clone();
        for message in &notices.debug {
            observer.on_debug(message);
        }
        for warning in &notices.warnings {
            observer.on_warning(warning);
        }
        for err in &notices.errors {
            observer.on_error(err);
        }
    }
}
