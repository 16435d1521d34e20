use crate::core::types::ItemResultEvent;
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out of `inline/itemResult` events to whoever is listening.
///
/// Delivery is best-effort: a missing or lagging subscriber never fails the
/// report that produced the event.
#[derive(Debug, Clone)]
pub struct ItemResultNotifier {
    tx: broadcast::Sender<ItemResultEvent>,
}

impl Default for ItemResultNotifier {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl ItemResultNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ItemResultEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ItemResultEvent) {
        let session_id = event.session_id.clone();
        let index = event.index;
        match self.tx.send(event) {
            Ok(n) => debug!(
                "notify: itemResult {}#{} delivered to {} subscriber(s)",
                session_id, index, n
            ),
            Err(_) => debug!(
                "notify: itemResult {}#{} has no subscriber",
                session_id, index
            ),
        }
    }
}
