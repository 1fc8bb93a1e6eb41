use metrics::counter;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod consumers;
pub mod outbox;

/// Static broker binding for one deletion event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub exchange: &'static str,
    pub queue: &'static str,
    pub routing_key: &'static str,
}

pub const CUSTOMER_DELETED_BINDING: Binding = Binding {
    exchange: "CUSTOMER",
    queue: "QUEUE_DELETE_CUSTOMER",
    routing_key: "QUEUE_DELETE_CUSTOMER.CUSTOMER",
};

pub const ACCOUNT_DELETED_BINDING: Binding = Binding {
    exchange: "ACCOUNT",
    queue: "QUEUE_DELETE_ACCOUNT",
    routing_key: "QUEUE_DELETE_ACCOUNT.ACCOUNT",
};

pub const BINDINGS: [Binding; 2] = [CUSTOMER_DELETED_BINDING, ACCOUNT_DELETED_BINDING];

pub fn binding_for_queue(queue: &str) -> Option<Binding> {
    BINDINGS.into_iter().find(|b| b.queue == queue)
}

/// A deletion notification that travels through the outbox and the broker.
pub trait DeletionEvent: Serialize + DeserializeOwned + Send + Sync {
    const BINDING: Binding;
    const EVENT_TYPE: &'static str;
    const AGGREGATE_TYPE: &'static str;

    fn aggregate_id(&self) -> Uuid;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerDeleted {
    pub customer_id: Uuid,
}

impl DeletionEvent for CustomerDeleted {
    const BINDING: Binding = CUSTOMER_DELETED_BINDING;
    const EVENT_TYPE: &'static str = "CustomerDeleted";
    const AGGREGATE_TYPE: &'static str = "customer";

    fn aggregate_id(&self) -> Uuid {
        self.customer_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDeleted {
    pub account_id: Uuid,
}

impl DeletionEvent for AccountDeleted {
    const BINDING: Binding = ACCOUNT_DELETED_BINDING;
    const EVENT_TYPE: &'static str = "AccountDeleted";
    const AGGREGATE_TYPE: &'static str = "account";

    fn aggregate_id(&self) -> Uuid {
        self.account_id
    }
}

/// In-process lifecycle notifications. These are informational only;
/// the deletion cascade runs through the outbox and the message queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CustomerCreated(Uuid),
    CustomerUpdated(Uuid),
    CustomerDeleted(Uuid),
    AccountCreated(Uuid),
    AccountUpdated(Uuid),
    AccountDeleted(Uuid),
    CardCreated(Uuid),
    CardUpdated(Uuid),
    CardDeleted(Uuid),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::CustomerCreated(_) => "customer_created",
            Event::CustomerUpdated(_) => "customer_updated",
            Event::CustomerDeleted(_) => "customer_deleted",
            Event::AccountCreated(_) => "account_created",
            Event::AccountUpdated(_) => "account_updated",
            Event::AccountDeleted(_) => "account_deleted",
            Event::CardCreated(_) => "card_created",
            Event::CardUpdated(_) => "card_updated",
            Event::CardDeleted(_) => "card_deleted",
        }
    }

    pub fn entity_id(&self) -> Uuid {
        match self {
            Event::CustomerCreated(id)
            | Event::CustomerUpdated(id)
            | Event::CustomerDeleted(id)
            | Event::AccountCreated(id)
            | Event::AccountUpdated(id)
            | Event::AccountDeleted(id)
            | Event::CardCreated(id)
            | Event::CardUpdated(id)
            | Event::CardDeleted(id) => *id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Fire-and-forget variant used by services; a full or closed channel
    /// is logged and never fails the caller.
    pub fn notify(&self, event: Event) {
        if let Err(e) = self.sender.try_send(event) {
            warn!("Dropped lifecycle event: {}", e);
            counter!("dtbank_events.dropped", 1);
        }
    }
}

pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        debug!(event = event.name(), id = %event.entity_id(), "lifecycle event");
        counter!("dtbank_events.processed", 1, "event" => event.name());
    }

    warn!("Event processing loop has ended");
}
