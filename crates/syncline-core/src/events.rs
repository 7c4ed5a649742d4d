use syncline_api::MetaData;
use tokio::sync::broadcast;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectEventKind {
    Updated,
    Deleted,
}

/// Published when a received object becomes visible to applications, or when
/// its deletion must be surfaced. Webhook dispatch and pollers hang off this.
#[derive(Clone, Debug)]
pub struct ObjectEvent {
    pub kind: ObjectEventKind,
    pub meta: MetaData,
}

pub type EventReceiver = broadcast::Receiver<ObjectEvent>;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ObjectEvent>,
}

impl EventBus {
    pub fn new(size: usize) -> Self {
        let (tx, _) = broadcast::channel(size);
        Self { tx }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ObjectEvent) {
        let _ = self.tx.send(event);
    }
}
