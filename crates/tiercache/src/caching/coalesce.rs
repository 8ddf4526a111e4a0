use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::channel::oneshot;
use parking_lot::Mutex;

use super::{CacheEntry, CacheError};

type Operations<T> = Mutex<HashMap<String, Operation<T>>>;

/// Tracks the in-flight operations of one kind, at most one per key.
///
/// Callers asking for a key that already has a pending operation are attached to it instead of
/// starting their own. Once an operation completes it removes itself, so the next caller starts
/// fresh.
pub struct Registry<T> {
    name: &'static str,
    operations: Arc<Operations<T>>,
}

impl<T> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("name", &self.name)
            .field("pending", &self.operations.lock().len())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Registry<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            operations: Default::default(),
        }
    }

    /// Returns the pending operation for `key`, creating one if there is none.
    ///
    /// The returned flag is `true` if the operation was just created, in which case the caller is
    /// responsible for completing it.
    pub fn register(&self, key: &str) -> (Operation<T>, bool) {
        self.register_inner(key, false)
    }

    /// Like [`register`](Self::register), but also counts the caller as a dependent.
    ///
    /// A joined operation is canceled once its last dependent calls
    /// [`release`](Operation::release).
    pub fn join(&self, key: &str) -> (Operation<T>, bool) {
        self.register_inner(key, true)
    }

    fn register_inner(&self, key: &str, dependent: bool) -> (Operation<T>, bool) {
        let mut operations = self.operations.lock();

        if let Some(operation) = operations.get(key) {
            if !operation.is_completed() {
                if dependent {
                    operation.retain();
                }
                metric!(counter("caches.coalesced") += 1, "registry" => self.name);
                return (operation.clone(), false);
            }
        }

        let operation = Operation::new(key, Arc::downgrade(&self.operations));
        if dependent {
            operation.retain();
        }
        operations.insert(key.to_owned(), operation.clone());
        (operation, true)
    }

    /// Returns the pending operation for `key`, if any.
    pub fn get(&self, key: &str) -> Option<Operation<T>> {
        self.operations
            .lock()
            .get(key)
            .filter(|operation| !operation.is_completed())
            .cloned()
    }

    /// The number of pending operations.
    pub fn len(&self) -> usize {
        self.operations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Something running on behalf of an [`Operation`] that is stopped when it is canceled.
pub trait SubOperation: Send + Sync {
    fn cancel(&self);
}

impl SubOperation for tokio::task::AbortHandle {
    fn cancel(&self) {
        self.abort();
    }
}

/// A dependency on an operation of another registry.
struct Dependency<U>(Operation<U>);

impl<U: Clone + Send + 'static> SubOperation for Dependency<U> {
    fn cancel(&self) {
        self.0.release();
    }
}

struct State<T> {
    result: Option<CacheEntry<T>>,
    listeners: Vec<oneshot::Sender<CacheEntry<T>>>,
    canceled: bool,
    sub_operations: Vec<Box<dyn SubOperation>>,
}

struct OperationInner<T> {
    key: String,
    state: Mutex<State<T>>,
    dependents: AtomicUsize,
    registry: Weak<Operations<T>>,
}

/// A pending asynchronous operation, shared by every caller waiting for its result.
///
/// The result is set exactly once through [`complete`](Self::complete), later calls have no
/// effect. Every [`Completion`] obtained through [`subscribe`](Self::subscribe) resolves with a
/// clone of that result.
pub struct Operation<T> {
    inner: Arc<OperationInner<T>>,
}

impl<T> Clone for Operation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Operation")
            .field("key", &self.inner.key)
            .field("completed", &state.result.is_some())
            .field("canceled", &state.canceled)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Operation<T> {
    fn new(key: &str, registry: Weak<Operations<T>>) -> Self {
        Self {
            inner: Arc::new(OperationInner {
                key: key.to_owned(),
                state: Mutex::new(State {
                    result: None,
                    listeners: Vec::new(),
                    canceled: false,
                    sub_operations: Vec::new(),
                }),
                dependents: AtomicUsize::new(0),
                registry,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn is_completed(&self) -> bool {
        self.inner.state.lock().result.is_some()
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.state.lock().canceled
    }

    /// Returns a future resolving to the result of this operation.
    ///
    /// If the operation already completed, the future resolves with that result.
    pub fn subscribe(&self) -> Completion<T> {
        let (sender, receiver) = oneshot::channel();
        let mut state = self.inner.state.lock();
        match &state.result {
            Some(result) => {
                let _ = sender.send(result.clone());
            }
            None => state.listeners.push(sender),
        }
        Completion { receiver }
    }

    /// Sets the result and resolves every listener.
    ///
    /// Returns `false` if the operation had already completed, in which case nothing changes.
    pub fn complete(&self, result: CacheEntry<T>) -> bool {
        let listeners = {
            let mut state = self.inner.state.lock();
            if state.result.is_some() {
                return false;
            }
            state.result = Some(result.clone());
            state.sub_operations.clear();
            std::mem::take(&mut state.listeners)
        };

        self.unregister();

        for listener in listeners {
            let _ = listener.send(result.clone());
        }
        true
    }

    /// Cancels the operation.
    ///
    /// Stops all attached sub-operations and completes with [`CacheError::Canceled`]. Has no
    /// effect on a completed operation.
    pub fn cancel(&self) {
        let sub_operations = {
            let mut state = self.inner.state.lock();
            if state.result.is_some() {
                return;
            }
            state.canceled = true;
            std::mem::take(&mut state.sub_operations)
        };

        tracing::trace!("Canceling operation `{}`", self.inner.key);
        self.complete(Err(CacheError::Canceled));
        for sub_operation in sub_operations {
            sub_operation.cancel();
        }
    }

    /// Attaches a sub-operation that is canceled along with this operation.
    ///
    /// If this operation was already canceled, `sub_operation` is canceled right away.
    pub fn attach(&self, sub_operation: impl SubOperation + 'static) {
        let mut state = self.inner.state.lock();
        if state.result.is_none() {
            state.sub_operations.push(Box::new(sub_operation));
            return;
        }
        let canceled = state.canceled;
        drop(state);
        if canceled {
            sub_operation.cancel();
        }
    }

    /// Makes this operation a dependent of `other`, which must have been obtained through
    /// [`Registry::join`].
    ///
    /// Canceling this operation releases `other`.
    pub fn depend_on<U: Clone + Send + 'static>(&self, other: &Operation<U>) {
        self.attach(Dependency(other.clone()));
    }

    fn retain(&self) {
        self.inner.dependents.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one dependent, canceling the operation if it was the last one.
    pub fn release(&self) {
        if self.inner.dependents.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        if let Some(registry) = self.inner.registry.upgrade() {
            let mut operations = registry.lock();
            // somebody joined in the meantime
            if self.inner.dependents.load(Ordering::Acquire) != 0 {
                return;
            }
            // nobody may join an operation that is about to be canceled
            if self.is_registered(&operations) {
                operations.remove(&self.inner.key);
            }
        }

        self.cancel();
    }

    fn unregister(&self) {
        if let Some(registry) = self.inner.registry.upgrade() {
            let mut operations = registry.lock();
            if self.is_registered(&operations) {
                operations.remove(&self.inner.key);
            }
        }
    }

    fn is_registered(&self, operations: &HashMap<String, Operation<T>>) -> bool {
        operations
            .get(&self.inner.key)
            .is_some_and(|operation| Arc::ptr_eq(&operation.inner, &self.inner))
    }
}

/// Resolves to the result of an [`Operation`].
///
/// Resolves to [`CacheError::Canceled`] if the operation is dropped without ever completing.
#[must_use = "futures do nothing unless polled"]
pub struct Completion<T> {
    receiver: oneshot::Receiver<CacheEntry<T>>,
}

impl<T> Completion<T> {
    /// A completion that resolves to `result` right away.
    pub fn ready(result: CacheEntry<T>) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(result);
        Self { receiver }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

impl<T> Future for Completion<T> {
    type Output = CacheEntry<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(CacheError::Canceled)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_coalesces_until_completed() {
        let registry = Registry::<u32>::new("test");

        let (first, is_new) = registry.register("a");
        assert!(is_new);
        let (second, is_new) = registry.register("a");
        assert!(!is_new);
        assert_eq!(registry.len(), 1);

        let a = first.subscribe();
        let b = second.subscribe();

        assert!(second.complete(Ok(1)));
        assert_eq!(a.await, Ok(1));
        assert_eq!(b.await, Ok(1));
        assert!(registry.is_empty());

        // a subsequent lookup starts fresh
        let (third, is_new) = registry.register("a");
        assert!(is_new);
        assert!(!third.is_completed());
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let registry = Registry::<u32>::new("test");
        let (operation, _) = registry.register("a");

        assert!(operation.complete(Ok(1)));
        assert!(!operation.complete(Ok(2)));
        assert!(!operation.complete(Err(CacheError::NotFound)));

        // late subscribers still get the first result
        assert_eq!(operation.subscribe().await, Ok(1));
    }

    #[tokio::test]
    async fn test_stale_complete_keeps_new_operation() {
        let registry = Registry::<u32>::new("test");
        let (old, _) = registry.register("a");
        old.complete(Ok(1));

        let (new, is_new) = registry.register("a");
        assert!(is_new);
        old.complete(Ok(2));
        old.cancel();

        assert_eq!(registry.len(), 1);
        assert!(!new.is_completed());
        assert!(registry.get("a").is_some());
    }

    #[tokio::test]
    async fn test_cancel_aborts_task() {
        let registry = Registry::<u32>::new("test");
        let (operation, _) = registry.register("a");
        let completion = operation.subscribe();

        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        operation.attach(task.abort_handle());

        operation.cancel();
        assert!(operation.is_canceled());
        assert_eq!(completion.await, Err(CacheError::Canceled));
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(registry.is_empty());

        // canceling a completed operation does nothing
        let (operation, _) = registry.register("b");
        operation.complete(Ok(1));
        operation.cancel();
        assert!(!operation.is_canceled());
        assert_eq!(operation.subscribe().await, Ok(1));
    }

    #[tokio::test]
    async fn test_attach_after_cancel() {
        let registry = Registry::<u32>::new("test");
        let (operation, _) = registry.register("a");
        operation.cancel();

        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        operation.attach(task.abort_handle());
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_dependency_canceled_with_last_dependent() {
        let lookups = Registry::<u32>::new("lookups");
        let fetches = Registry::<u32>::new("fetches");

        let (first, _) = lookups.register("a#x");
        let (second, _) = lookups.register("a#y");

        let (fetch, is_new) = fetches.join("a");
        assert!(is_new);
        first.depend_on(&fetch);
        let (joined, is_new) = fetches.join("a");
        assert!(!is_new);
        second.depend_on(&joined);

        first.cancel();
        assert!(!fetch.is_completed());
        assert_eq!(fetches.len(), 1);

        second.cancel();
        assert!(fetch.is_canceled());
        assert_eq!(fetch.subscribe().await, Err(CacheError::Canceled));
        assert!(fetches.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_operation() {
        let registry = Registry::<u32>::new("test");
        let completion = {
            let (operation, _) = registry.register("a");
            operation.subscribe()
        };
        // the registry still holds the operation
        assert_eq!(registry.len(), 1);
        drop(registry);
        assert_eq!(completion.await, Err(CacheError::Canceled));
    }
}
