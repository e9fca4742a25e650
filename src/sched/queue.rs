use crossbeam_channel::{unbounded, Receiver, Sender};

/// Thread-safe FIFO with a blocking pop and a non-blocking try-pop, backed
/// by an unbounded channel whose two ends live side by side.
pub struct ReadyQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> ReadyQueue<T> {
    pub fn new() -> ReadyQueue<T> {
        let (tx, rx) = unbounded();
        ReadyQueue { tx, rx }
    }

    pub fn push(&self, item: T) {
        // cannot fail: we hold the receiver for as long as we hold the sender
        let _ = self.tx.send(item);
    }

    /// Blocks until an item is available.
    pub fn pop(&self) -> T {
        self.rx.recv().expect("ready queue disconnected")
    }

    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
