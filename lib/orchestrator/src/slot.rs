use epoch_prover_types::ProvingError;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Memoized result that any number of callers can await.
pub type SharedResult<T> = Shared<BoxFuture<'static, Result<T, ProvingError>>>;

/// Value that is filled exactly once and awaited by any number of readers.
pub(crate) struct Slot<T: Clone> {
    sender: Mutex<Option<oneshot::Sender<Result<T, ProvingError>>>>,
    value: SharedResult<T>,
}

impl<T: Clone + Send + Sync + 'static> Slot<T> {
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        let value = receiver
            .map(|received| {
                received.unwrap_or_else(|_| Err(ProvingError::fatal("slot dropped unresolved")))
            })
            .boxed()
            .shared();
        Self {
            sender: Mutex::new(Some(sender)),
            value,
        }
    }

    /// Resolves the slot. Returns `false` if it was already resolved.
    pub fn fill(&self, value: Result<T, ProvingError>) -> bool {
        let Some(sender) = self.sender.lock().unwrap().take() else {
            return false;
        };
        // Readers hold clones of the shared receiver, so nobody listening is not an error.
        let _ = sender.send(value);
        true
    }

    pub fn wait(&self) -> SharedResult<T> {
        self.value.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn slot_is_single_assignment() {
        let slot = Slot::<u32>::new();
        let reader = slot.wait();
        assert!(slot.fill(Ok(7)));
        assert!(!slot.fill(Ok(8)));
        assert!(!slot.fill(Err(ProvingError::Cancelled)));
        assert_eq!(reader.await, Ok(7));
        assert_eq!(slot.wait().await, Ok(7));
    }

    #[tokio::test]
    async fn rejection_reaches_every_reader() {
        let slot = Slot::<u32>::new();
        let readers = [slot.wait(), slot.wait()];
        slot.fill(Err(ProvingError::transient("gone")));
        for reader in readers {
            assert_matches!(reader.await, Err(ProvingError::Transient(_)));
        }
    }
}
