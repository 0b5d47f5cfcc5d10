use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use fieldx_plus::fx_plus;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::error;

use crate::config::CoalescerConfig;
use crate::error::ConfigError;
use crate::error::FetchError;
use crate::error::TransportError;
use crate::router;
use crate::traits::Transport;
use crate::types::ProgressSender;
use crate::types::ProgressSink;
use crate::types::ResponseBody;
use crate::types::TransportRequest;
use crate::types::TransportResponse;

type CallReply = oneshot::Sender<Result<ResponseBody, FetchError>>;

#[derive(Debug)]
struct PendingCall {
    request:  TransportRequest,
    replies:  Vec<CallReply>,
    progress: ProgressSink,
}

impl PendingCall {
    // Response type is not part of the identity of a call.
    fn is_same(&self, request: &TransportRequest) -> bool {
        self.request.verb == request.verb && self.request.url == request.url && self.request.body == request.body
    }

    fn is_retracted(&self) -> bool {
        self.replies.iter().all(|r| r.is_closed())
    }
}

#[derive(Debug, Default)]
struct CoalescerState {
    next_id:   u64,
    queue:     VecDeque<(u64, PendingCall)>,
    in_flight: HashMap<u64, PendingCall>,
}

impl CoalescerState {
    fn find_mut(&mut self, request: &TransportRequest) -> Option<(u64, &mut PendingCall)> {
        if let Some((id, call)) = self.in_flight.iter_mut().find(|(_, c)| c.is_same(request)) {
            return Some((*id, call));
        }
        self.queue
            .iter_mut()
            .find(|(_, c)| c.is_same(request))
            .map(|(id, call)| (*id, call))
    }
}

/// Raw transport access with duplicate suppression.
///
/// A request identical by verb, url and body to one that is queued or in flight is never sent again; its caller gets
/// the response of the earlier request. Queued requests are sent in batches: only when the number of calls in flight
/// drops to the low water mark, and then up to the high water mark.
///
/// Nothing is cached: once a call completes, an identical request results in a new call.
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`Coalescer`].", "", "See [`Coalescer::builder()`] method."),
        method_doc("Implement builder pattern for [`Coalescer`]."),
    )
)]
pub struct Coalescer<T>
where
    T: Transport,
{
    #[fieldx(vis(pub(crate)), builder(vis(pub), required, into), get(clone))]
    transport: Arc<T>,

    #[fieldx(vis(pub), get(copy), builder(vis(pub)), default(CoalescerConfig::default()))]
    config: CoalescerConfig,

    #[fieldx(private, lazy, lock, get_mut, builder(off))]
    state: CoalescerState,
}

impl<T> Coalescer<T>
where
    T: Transport,
{
    pub fn new(transport: Arc<T>, config: CoalescerConfig) -> Result<Arc<Self>, ConfigError> {
        config.check()?;
        Self::builder()
            .transport(transport)
            .config(config)
            .build()
            .map_err(|err| ConfigError::Builder {
                what:    "coalescer",
                message: err.to_string(),
            })
    }

    fn build_state(&self) -> CoalescerState {
        CoalescerState::default()
    }

    pub async fn request(&self, request: TransportRequest) -> Result<ResponseBody, FetchError> {
        self.request_with_progress(request, None).await
    }

    pub async fn request_with_progress(
        &self,
        request: TransportRequest,
        progress: Option<ProgressSender>,
    ) -> Result<ResponseBody, FetchError> {
        let (tx, rx) = oneshot::channel();

        let started = {
            let mut state = self.state_mut();

            if let Some((id, call)) = state.find_mut(&request) {
                debug!(id, url = %request.url, "joined an identical request");
                call.replies.push(tx);
                if let Some(progress) = progress {
                    call.progress.subscribe(progress);
                }
                Vec::new()
            }
            else {
                state.next_id += 1;
                let id = state.next_id;
                debug!(id, verb = %request.verb, url = %request.url, "request queued");
                state.queue.push_back((
                    id,
                    PendingCall {
                        request,
                        replies: vec![tx],
                        progress: ProgressSink::from(progress),
                    },
                ));
                self.refill(&mut state)
            }
        };

        self.start(started);
        rx.await.unwrap_or(Err(FetchError::Gone))
    }

    /// Requests waiting to be sent.
    pub fn queued(&self) -> usize {
        self.state_mut().queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.state_mut().in_flight.len()
    }

    fn refill(&self, state: &mut CoalescerState) -> Vec<(u64, TransportRequest, ProgressSink)> {
        let config = self.config();
        let mut started = Vec::new();

        if state.in_flight.len() > config.low_water_mark {
            return started;
        }

        while state.in_flight.len() < config.high_water_mark {
            let Some((id, call)) = state.queue.pop_front()
            else {
                break;
            };
            if call.is_retracted() {
                debug!(id, "request retracted before it was sent");
                continue;
            }
            started.push((id, call.request.clone(), call.progress.clone()));
            state.in_flight.insert(id, call);
        }

        if !started.is_empty() {
            debug!(started = started.len(), in_flight = state.in_flight.len(), "queue drained");
        }

        started
    }

    fn start(&self, started: Vec<(u64, TransportRequest, ProgressSink)>) {
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
        let started = {
            let mut state = self.state_mut();

            if let Some(call) = state.in_flight.remove(&id) {
                let request = &call.request;
                let routed = router::route(request.verb, &request.url, request.response_type, outcome);
                if let Err(err) = &routed {
                    error!(id, "request failed: {err}");
                }
                debug!(id, callers = call.replies.len(), "request completed");
                for reply in call.replies {
                    if reply.send(routed.clone()).is_err() {
                        debug!(id, "requester is gone, response dropped");
                    }
                }
            }

            self.refill(&mut state)
        };

        self.start(started);
    }
}
