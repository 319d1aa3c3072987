use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Fan-out registry of unbounded channels.
///
/// Every subscriber sees every published item in publish order. Senders
/// whose receiver was dropped are pruned on the next publish.
pub struct Subscribers<T> {
    inner: Arc<Mutex<Vec<mpsc::UnboundedSender<T>>>>,
}

impl<T> Clone for Subscribers<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> Subscribers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        self.subscribe_with(None)
    }

    /// Subscribe with `initial` queued ahead of anything published later.
    pub fn subscribe_with(&self, initial: Option<T>) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(item) = initial {
            let _ = tx.send(item);
        }
        subscribers.push(tx);
        rx
    }

    pub fn publish(&self, item: T) {
        let mut subscribers = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(item.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
