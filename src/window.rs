// ABOUTME: Outbound flow-control credit counter with blocking consumers
// ABOUTME: Producers call increment/set_error, consumers block in decrement until credit exists

use crate::error::{Error, Result};
use std::sync::{Mutex, PoisonError};
use tokio::sync::Notify;

#[derive(Debug)]
struct Inner {
    credit: u32,
    error: Option<Error>,
}

/// A non-negative credit counter.
///
/// `decrement` blocks while the counter is zero; `increment` wakes every
/// waiter so each can take a share. Once an error is latched all current
/// and future waiters fail with it.
#[derive(Debug)]
pub(crate) struct Window {
    inner: Mutex<Inner>,
    grown: Notify,
}

impl Window {
    pub fn new(initial: u32) -> Window {
        Window {
            inner: Mutex::new(Inner {
                credit: initial,
                error: None,
            }),
            grown: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panicking task must not poison user-facing calls.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `n` bytes of credit and wake all waiters.
    pub fn increment(&self, n: u32) {
        let mut inner = self.lock();
        inner.credit = inner.credit.saturating_add(n);
        drop(inner);
        self.grown.notify_waiters();
    }

    /// Take up to `wanted` bytes of credit, blocking while none exists.
    pub async fn decrement(&self, wanted: usize) -> Result<usize> {
        if wanted == 0 {
            return Ok(0);
        }
        loop {
            let notified = self.grown.notified();
            {
                let mut inner = self.lock();
                if let Some(err) = &inner.error {
                    return Err(err.clone());
                }
                if inner.credit > 0 {
                    let granted = (inner.credit as usize).min(wanted);
                    inner.credit -= granted as u32;
                    return Ok(granted);
                }
            }
            notified.await;
        }
    }

    /// Latch `err` and wake all waiters. The first error wins.
    pub fn set_error(&self, err: Error) {
        let mut inner = self.lock();
        if inner.error.is_none() {
            inner.error = Some(err);
        }
        drop(inner);
        self.grown.notify_waiters();
    }
}
