use crate::net::support::Fault;
use std::cell::RefCell;

const TOPIC_COUNT: usize = 4;

/// Named lifecycle topics published alongside the delegate callbacks.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Topic {
    Connect,
    Disconnect,
    DisconnectWithError,
    Error,
}

impl Topic {
    #[inline]
    fn indexer(self) -> usize {
        match self {
            Topic::Connect => 0,
            Topic::Disconnect => 1,
            Topic::DisconnectWithError => 2,
            Topic::Error => 3,
        }
    }
}

/// Lifecycle event with the connection as subject and an optional fault
/// payload on the error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Connected {
        connection: String,
        host: String,
    },
    Disconnected {
        connection: String,
        host: String,
    },
    WillDisconnect {
        connection: String,
        host: String,
        fault: Fault,
    },
    Failed {
        connection: String,
        host: String,
        fault: Fault,
    },
}

impl BusEvent {
    #[inline]
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::Connected { .. } => Topic::Connect,
            BusEvent::Disconnected { .. } => Topic::Disconnect,
            BusEvent::WillDisconnect { .. } => Topic::DisconnectWithError,
            BusEvent::Failed { .. } => Topic::Error,
        }
    }
}

/// A message bus based on a directly indexable set of topic queues.
/// Consumers pull: events accumulate per topic until read off or cleared.
pub struct Bus {
    topics: [Vec<BusEvent>; TOPIC_COUNT],
}

impl Bus {
    #[inline]
    pub fn new() -> Bus {
        Bus {
            topics: [Vec::new(), Vec::new(), Vec::new(), Vec::new()],
        }
    }

    /// Publish the supplied event on its topic queue.
    #[inline]
    pub fn publish(&mut self, event: BusEvent) {
        self.topics[event.topic().indexer()].push(event);
    }

    /// Read the events accumulated for a particular topic.
    #[inline]
    pub fn read(&self, topic: Topic) -> &[BusEvent] {
        &self.topics[topic.indexer()]
    }

    /// Drains all the events accumulated for a particular topic.
    #[inline]
    pub fn drain(&mut self, topic: Topic) -> Vec<BusEvent> {
        self.topics[topic.indexer()].drain(..).collect()
    }

    /// Clear out all the events from this bus.
    #[inline]
    pub fn clear(&mut self) {
        for topic in self.topics.iter_mut() {
            topic.clear();
        }
    }
}

thread_local! {
    static BUS: RefCell<Bus> = RefCell::new(Bus::new());
}

/// Publishes on the process-wide bus owned by the current loop.
#[inline]
pub fn publish(event: BusEvent) {
    BUS.with(|bus| bus.borrow_mut().publish(event));
}

/// Runs the supplied closure against the process-wide bus.
#[inline]
pub fn with<R, F: FnOnce(&mut Bus) -> R>(operation: F) -> R {
    BUS.with(|bus| operation(&mut bus.borrow_mut()))
}
