use std::collections::HashSet;

use tokio::sync::oneshot;
use tracing::debug;
use tracing::warn;

use crate::cache::CacheState;
use crate::cache::EntityCache;
use crate::error::FetchError;
use crate::types::EntityMap;
use crate::types::ProgressSender;

pub(crate) type EntityReply = oneshot::Sender<Result<EntityMap, FetchError>>;

// A read by key that couldn't be answered from the cache right away.
#[derive(Debug)]
pub(crate) struct WaitingDemand {
    id:            u64,
    results:       EntityMap,
    under_request: HashSet<String>,
    reply:         EntityReply,
    progress:      Option<ProgressSender>,
}

impl WaitingDemand {
    fn waits_for_any(&self, keys: &HashSet<&str>) -> bool {
        self.under_request.iter().any(|k| keys.contains(k.as_str()))
    }

    fn resolve(self, result: Result<EntityMap, FetchError>) {
        if self.reply.send(result).is_err() {
            debug!(demand = self.id, "demand retracted while being resolved");
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct WaitingRegistry {
    next_id: u64,
    // Registration order is kept so that demands are resolved in the order they were made.
    demands: Vec<WaitingDemand>,
}

impl WaitingRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &mut self,
        results: EntityMap,
        under_request: HashSet<String>,
        reply: EntityReply,
        progress: Option<ProgressSender>,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        debug!(
            demand = id,
            known = results.len(),
            under_request = under_request.len(),
            "demand registered"
        );
        self.demands.push(WaitingDemand {
            id,
            results,
            under_request,
            reply,
            progress,
        });
        id
    }

    /// Move resolved keys into demand results and complete demands that have nothing left to wait for. With `idle`
    /// set nothing can resolve the outstanding keys anymore: the remaining demands are completed with what they have.
    ///
    /// Returns a warning for every demand completed this way.
    pub(crate) fn reconcile(&mut self, cache: &EntityCache, idle: bool) -> Vec<String> {
        let mut warnings = Vec::new();

        for mut demand in std::mem::take(&mut self.demands) {
            if demand.reply.is_closed() {
                debug!(demand = demand.id, "demand retracted");
                continue;
            }

            let results = &mut demand.results;
            demand.under_request.retain(|key| match cache.get(key) {
                CacheState::Present(entity) => {
                    results.insert(key.clone(), entity);
                    false
                }
                CacheState::Pending | CacheState::Absent => true,
            });

            if demand.under_request.is_empty() {
                debug!(demand = demand.id, entities = demand.results.len(), "demand resolved");
                let results = std::mem::take(&mut demand.results);
                demand.resolve(Ok(results));
            }
            else if idle {
                let mut missing = demand.under_request.iter().map(String::as_str).collect::<Vec<_>>();
                missing.sort_unstable();
                let message = format!(
                    "no request left to resolve demand {}; completing with {} of {} entities, missing: {}",
                    demand.id,
                    demand.results.len(),
                    demand.results.len() + missing.len(),
                    missing.join(", ")
                );
                warn!(demand = demand.id, missing = missing.len(), "{message}");
                warnings.push(message);
                let results = std::mem::take(&mut demand.results);
                demand.resolve(Ok(results));
            }
            else {
                self.demands.push(demand);
            }
        }

        warnings
    }

    /// Deliver an error to every demand waiting for one of the keys. Returns the number of demands that failed.
    pub(crate) fn fail(&mut self, keys: &[String], error: &FetchError) -> usize {
        let keys = keys.iter().map(String::as_str).collect::<HashSet<_>>();
        let (failed, kept) = std::mem::take(&mut self.demands)
            .into_iter()
            .partition::<Vec<_>, _>(|d| d.waits_for_any(&keys));
        self.demands = kept;

        let count = failed.len();
        for demand in failed {
            debug!(demand = demand.id, "demand failed");
            demand.resolve(Err(error.clone()));
        }
        count
    }

    /// Progress subscribers of demands waiting for any of the keys.
    pub(crate) fn progress_for(&self, keys: &[String]) -> Vec<ProgressSender> {
        let keys = keys.iter().map(String::as_str).collect::<HashSet<_>>();
        self.demands
            .iter()
            .filter(|d| d.waits_for_any(&keys))
            .filter_map(|d| d.progress.clone())
            .collect()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.demands.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.demands.len()
    }
}
