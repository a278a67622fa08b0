use std::sync::Mutex;
use tokio::sync::oneshot::{self, error::TryRecvError};

/// FIFO of operations on one node, at most one running at a time
#[derive(Default)]
pub struct OpQueue {
    // completion signal of the most recently queued operation
    tail: Mutex<Option<oneshot::Receiver<()>>>,
}

/// Place in an [OpQueue]; the next operation starts when this is dropped
pub struct Turn {
    previous: Option<oneshot::Receiver<()>>,
    _done: oneshot::Sender<()>,
}

impl OpQueue {
    /// Join the end of the queue
    ///
    /// This happens synchronously, so the order of `enqueue` calls is the
    /// order operations will run in.
    pub fn enqueue(&self) -> Turn {
        let (done, next) = oneshot::channel();
        let previous = self
            .tail
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(next);
        Turn {
            previous,
            _done: done,
        }
    }
}

impl OpQueue {
    /// Whether every queued operation has finished
    pub fn is_idle(&self) -> bool {
        let mut tail = self
            .tail
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let finished = match tail.as_mut() {
            None => true,
            Some(last) => !matches!(last.try_recv(), Err(TryRecvError::Empty)),
        };
        if finished {
            // a finished receiver must not be awaited again
            *tail = None;
        }
        finished
    }
}

impl Turn {
    /// Wait for every earlier operation to finish
    pub async fn wait(&mut self) {
        if let Some(previous) = self.previous.take() {
            // an error only means the previous operation is gone
            let _ = previous.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::runtime::Runtime;

    #[test]
    fn idle_once_every_turn_is_done() {
        Runtime::new().unwrap().block_on(async {
            let queue = OpQueue::default();
            assert!(queue.is_idle());
            let first = queue.enqueue();
            let mut second = queue.enqueue();
            assert!(!queue.is_idle());
            drop(first);
            second.wait().await;
            assert!(!queue.is_idle());
            drop(second);
            assert!(queue.is_idle());
            let mut third = queue.enqueue();
            third.wait().await;
        });
    }
}
