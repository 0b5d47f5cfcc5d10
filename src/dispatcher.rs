use std::collections::HashMap;
use std::collections::VecDeque;

use tracing::debug;

use crate::descriptor::RequestDescriptor;
use crate::types::ProgressSink;
use crate::types::QueueDiscipline;
use crate::types::TransportRequest;

// Request queue plus process queue. A descriptor is in exactly one of them from the moment it is enqueued until its
// transport call completes.
#[derive(Debug, Default)]
pub(crate) struct Dispatcher {
    next_id:   u64,
    queue:     VecDeque<RequestDescriptor>,
    in_flight: HashMap<u64, RequestDescriptor>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn enqueue(&mut self, descriptor: RequestDescriptor) {
        debug!(id = descriptor.id, kind = %descriptor.kind, url = %descriptor.url, "request queued");
        self.queue.push_back(descriptor);
    }

    /// Move the next queued descriptor into the process queue if there is a free slot. Returns what has to be handed
    /// over to the transport.
    pub(crate) fn promote(
        &mut self,
        concurrency: usize,
        discipline: QueueDiscipline,
    ) -> Option<(u64, TransportRequest, ProgressSink)> {
        if self.in_flight.len() >= concurrency {
            return None;
        }

        let descriptor = loop {
            let descriptor = match discipline {
                QueueDiscipline::Fifo => self.queue.pop_front(),
                QueueDiscipline::Lifo => self.queue.pop_back(),
            }?;
            if !descriptor.is_retracted() {
                break descriptor;
            }
            debug!(id = descriptor.id, "request retracted before it was sent");
        };

        let id = descriptor.id;
        let request = descriptor.transport_request();
        let progress = descriptor.progress.clone();
        debug!(
            id,
            waited_ms = descriptor.created_at.elapsed().as_millis() as u64,
            in_flight = self.in_flight.len() + 1,
            "request promoted"
        );
        self.in_flight.insert(id, descriptor);

        Some((id, request, progress))
    }

    /// Take a completed descriptor out of the process queue.
    pub(crate) fn finish(&mut self, id: u64) -> Option<RequestDescriptor> {
        self.in_flight.remove(&id)
    }

    #[inline]
    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Nothing queued and nothing in flight.
    #[inline]
    pub(crate) fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }
}
