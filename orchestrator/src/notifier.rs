use std::sync::Mutex;

use common::BlockNum;
use tokio::sync::mpsc;

/// A store module's snapshot became available up to a block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreReady {
    pub module: String,
    pub up_to_block: BlockNum,
}

/// Fan-out of store-availability events. Squashables publish; the scheduler
/// and the progress reporter subscribe. The squasher only ever sees the
/// narrow `notify` surface, which keeps it decoupled from the scheduler it
/// ultimately unblocks.
#[derive(Debug, Default)]
pub struct Notifier {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<StoreReady>>>,
}

impl Notifier {
    pub fn new() -> Notifier {
        Default::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreReady> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Best-effort delivery: subscribers that went away are dropped, live
    /// ones are guaranteed to observe the event on their next receive.
    pub fn notify(&self, module: &str, up_to_block: BlockNum) {
        let event = StoreReady {
            module: module.to_string(),
            up_to_block,
        };
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
