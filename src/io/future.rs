// ============================================================================
// Grid Future
// ============================================================================
//
// Single-assignment result cell with an ordered continuation list. The first
// completion (value or failure) wins; later completions are dropped.
// Continuations run exactly once, in registration order, outside the state
// lock, including when they are registered after completion already
// happened.
//
// ============================================================================

use crate::core::{GridError, Result};
use log::debug;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

type Listener<T> = Box<dyn FnOnce(&Result<T>) + Send>;

enum FutureState<T> {
    Pending {
        listeners: Vec<Listener<T>>,
        wakers: Vec<Waker>,
    },
    Done(Arc<Result<T>>),
}

/// Completable future handle. Clones share the same cell, so one side can
/// hold it for completion while another awaits it.
pub struct GridFuture<T> {
    state: Arc<Mutex<FutureState<T>>>,
}

impl<T> Clone for GridFuture<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Send + 'static> Default for GridFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> GridFuture<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FutureState::Pending {
                listeners: Vec::new(),
                wakers: Vec::new(),
            })),
        }
    }

    /// A future that is already completed with a value.
    pub fn completed(value: T) -> Self {
        let fut = Self::new();
        fut.complete(value);
        fut
    }

    /// A future that is already completed with a failure.
    pub fn failed(error: GridError) -> Self {
        let fut = Self::new();
        fut.fail(error);
        fut
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.state.lock(), FutureState::Done(_))
    }

    pub fn complete(&self, value: T) -> bool {
        self.try_complete(Ok(value))
    }

    pub fn fail(&self, error: GridError) -> bool {
        self.try_complete(Err(error))
    }

    /// Completes the cell if it is still pending. Returns false when the
    /// result arrived too late to matter. Listeners and wakers are drained
    /// under the lock but invoked after it is released, so a continuation
    /// may freely touch the future it was registered on.
    pub fn try_complete(&self, result: Result<T>) -> bool {
        let (result, listeners, wakers) = {
            let mut state = self.state.lock();
            match &mut *state {
                FutureState::Done(_) => {
                    debug!("future already completed, dropping late result");
                    return false;
                }
                FutureState::Pending { listeners, wakers } => {
                    let listeners = std::mem::take(listeners);
                    let wakers = std::mem::take(wakers);
                    let result = Arc::new(result);
                    *state = FutureState::Done(Arc::clone(&result));
                    (result, listeners, wakers)
                }
            }
        };
        for listener in listeners {
            listener(&result);
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Registers a continuation. Runs immediately (on the calling task) when
    /// the future is already done.
    pub fn listen<F>(&self, f: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        let result = {
            let mut state = self.state.lock();
            match &mut *state {
                FutureState::Pending { listeners, .. } => {
                    listeners.push(Box::new(f));
                    return;
                }
                FutureState::Done(result) => Arc::clone(result),
            }
        };
        f(&result);
    }
}

impl<T: Clone + Send + 'static> GridFuture<T> {
    /// Non-blocking peek at the result.
    pub fn result(&self) -> Option<Result<T>> {
        match &*self.state.lock() {
            FutureState::Done(result) => Some((**result).clone()),
            FutureState::Pending { .. } => None,
        }
    }

    /// Derives a dependent future by running `f` on the upstream value.
    ///
    /// An upstream failure passes through to the dependent future unchanged
    /// and `f` never runs. A panic inside `f` completes the dependent future
    /// with `ContinuationFailed` so downstream consumers observe the failure
    /// instead of waiting forever.
    pub fn chain<U, F>(&self, f: F) -> GridFuture<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        let next = GridFuture::new();
        let downstream = next.clone();
        self.listen(move |upstream| match upstream {
            Ok(value) => {
                let value = value.clone();
                match catch_unwind(AssertUnwindSafe(move || f(value))) {
                    Ok(out) => {
                        downstream.try_complete(out);
                    }
                    Err(panic) => {
                        downstream.fail(GridError::ContinuationFailed(panic_text(panic)));
                    }
                }
            }
            Err(err) => {
                downstream.fail(err.clone());
            }
        });
        next
    }
}

impl<T: Clone + Send + 'static> std::future::Future for GridFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock();
        match &mut *state {
            FutureState::Done(result) => Poll::Ready((**result).clone()),
            FutureState::Pending { wakers, .. } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

fn panic_text(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "continuation panicked".to_string()
    }
}
