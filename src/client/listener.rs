//! Callback contract for asynchronous invocations.
//!
//! Exactly one of `success`/`fail` is delivered, then `complete`. A panic in a
//! listener is caught and logged; it never reaches the runtime.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::rpc::{RpcResponse, TransportError, TransportResult};

/// Receives the outcome of one invocation.
pub trait ResponseListener: Send + Sync + 'static {
    fn success(&self, response: RpcResponse);

    fn fail(&self, error: TransportError);

    /// Called once after `success` or `fail`.
    fn complete(&self) {}
}

const PENDING: u8 = 0;
const DELIVERED: u8 = 1;
const CANCELLED: u8 = 2;

/// One-shot delivery of an outcome to a listener.
pub(crate) struct Delivery {
    state: Arc<AtomicU8>,
    listener: Arc<dyn ResponseListener>,
}

impl Delivery {
    pub(crate) fn new(listener: Arc<dyn ResponseListener>) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(PENDING)),
            listener,
        }
    }

    pub(crate) fn state(&self) -> Arc<AtomicU8> {
        Arc::clone(&self.state)
    }

    /// Deliver `outcome` unless something was already delivered or the
    /// invocation was cancelled.
    pub(crate) fn deliver(self, outcome: TransportResult<RpcResponse>) -> bool {
        if self
            .state
            .compare_exchange(PENDING, DELIVERED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let listener = &self.listener;
        let delivered = catch_unwind(AssertUnwindSafe(|| match outcome {
            Ok(response) => listener.success(response),
            Err(error) => listener.fail(error),
        }));
        if delivered.is_err() {
            tracing::error!("Response listener panicked in success/fail");
        }
        if catch_unwind(AssertUnwindSafe(|| listener.complete())).is_err() {
            tracing::error!("Response listener panicked in complete");
        }
        true
    }
}

/// Handle to an in-flight asynchronous invocation.
///
/// Dropping the handle leaves the invocation running.
#[derive(Debug)]
pub struct InvocationHandle {
    state: Arc<AtomicU8>,
    task: JoinHandle<()>,
}

impl InvocationHandle {
    pub(crate) fn new(state: Arc<AtomicU8>, task: JoinHandle<()>) -> Self {
        Self { state, task }
    }

    /// Stop the invocation and suppress its callbacks.
    ///
    /// Returns false when the outcome was already delivered. The connection
    /// in use, if any, is discarded rather than pooled.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            self.task.abort();
        }
        cancelled
    }

    pub fn is_delivered(&self) -> bool {
        self.state.load(Ordering::Acquire) == DELIVERED
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the invocation task to end (delivered, cancelled or panicked).
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every callback in order.
    #[derive(Default)]
    pub(crate) struct Recorder {
        pub(crate) events: Mutex<Vec<String>>,
    }

    impl ResponseListener for Recorder {
        fn success(&self, response: RpcResponse) {
            self.events.lock().unwrap().push(format!("success:{}", response.value));
        }

        fn fail(&self, error: TransportError) {
            self.events.lock().unwrap().push(format!("fail:{}", error.kind()));
        }

        fn complete(&self) {
            self.events.lock().unwrap().push("complete".into());
        }
    }

    struct Panicky;

    impl ResponseListener for Panicky {
        fn success(&self, _: RpcResponse) {
            panic!("listener bug");
        }

        fn fail(&self, _: TransportError) {}

        fn complete(&self) {
            panic!("listener bug in complete");
        }
    }

    #[test]
    fn delivers_once_then_complete() {
        let recorder = Arc::new(Recorder::default());
        let delivery = Delivery::new(recorder.clone());
        let state = delivery.state();

        assert!(delivery.deliver(Err(TransportError::Cancelled)));
        assert_eq!(state.load(Ordering::SeqCst), DELIVERED);
        assert_eq!(*recorder.events.lock().unwrap(), vec!["fail:cancelled", "complete"]);
    }

    #[test]
    fn cancelled_delivery_is_suppressed() {
        let recorder = Arc::new(Recorder::default());
        let delivery = Delivery::new(recorder.clone());
        delivery.state().store(CANCELLED, Ordering::SeqCst);

        assert!(!delivery.deliver(Ok(RpcResponse::empty())));
        assert!(recorder.events.lock().unwrap().is_empty());
    }

    #[test]
    fn listener_panic_is_contained() {
        let delivery = Delivery::new(Arc::new(Panicky));
        assert!(delivery.deliver(Ok(RpcResponse::empty())));
    }

    #[tokio::test]
    async fn cancel_after_delivery_reports_false() {
        let recorder = Arc::new(Recorder::default());
        let delivery = Delivery::new(recorder.clone());
        let state = delivery.state();
        let task = tokio::spawn(async move {
            delivery.deliver(Ok(RpcResponse::empty()));
        });
        let handle = InvocationHandle::new(state, task);
        while !handle.is_delivered() {
            tokio::task::yield_now().await;
        }
        assert!(!handle.cancel());
        handle.join().await;
        assert_eq!(recorder.events.lock().unwrap().len(), 2);
    }
}
