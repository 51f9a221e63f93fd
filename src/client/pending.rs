//! Pending call lifecycle.
//!
//! A pending call is split in two halves:
//!
//! - [`PendingSlot`], shared between the correlation registry and the
//!   caller. It owns the sending side of the output channel, the `closed`
//!   flag, and the guard serializing [`deliver`](PendingSlot::deliver)
//!   against [`dispose`](PendingSlot::dispose).
//! - [`PendingCall`], the caller-owned handle holding the receiving side.
//!
//! ```text
//!           deliver(payload)                    dispose()
//!   Open ─────────────────────▶ Fulfilled   Open ─────────▶ Disposed
//! ```
//!
//! Both terminal states have `closed == true` and the sender dropped; they
//! differ only in whether a value was pushed first. The output channel has
//! capacity 1 and receives at most one value, so `deliver` never blocks
//! while holding the guard.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time;

use super::registry::{lock_ignore_poison, CorrelationRegistry};
use crate::{log_debug, CorrelationId, Result, RpcError};

/// Result of routing a payload into a pending slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliverOutcome {
    /// The payload was pushed and the slot is now fulfilled.
    Delivered,
    /// The slot was already fulfilled or disposed; the payload was dropped.
    Closed,
}

struct SlotState {
    closed: bool,
    output: Option<mpsc::Sender<Bytes>>,
}

pub(crate) struct PendingSlot {
    // ---
    state: Mutex<SlotState>,
}

impl PendingSlot {
    // ---

    /// Create an open slot and the receiver its payload will arrive on.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        // ---
        let (tx, rx) = mpsc::channel(1);
        let slot = Arc::new(Self {
            state: Mutex::new(SlotState {
                closed: false,
                output: Some(tx),
            }),
        });
        (slot, rx)
    }

    /// Push `payload` if the slot is still open, then close it.
    pub fn deliver(&self, payload: Bytes) -> DeliverOutcome {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if state.closed {
            return DeliverOutcome::Closed;
        }
        state.closed = true;

        if let Some(output) = state.output.take() {
            // Capacity 1, first and only send: this can only fail if the
            // receiver is gone, in which case nobody is listening anyway.
            let _ = output.try_send(payload);
        }

        DeliverOutcome::Delivered
    }

    /// Close the slot without a value. Returns `true` if this call performed
    /// the transition, `false` if the slot was already closed.
    pub fn dispose(&self) -> bool {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if state.closed {
            return false;
        }
        state.closed = true;
        state.output = None;
        true
    }

    pub fn is_closed(&self) -> bool {
        lock_ignore_poison(&self.state).closed
    }
}

/// Cloneable disposal handle for a pending call.
///
/// Lets a party other than the reader (a timer task, a supervisor) abandon
/// the call while the reader is blocked in [`PendingCall::recv`]; the reader
/// then wakes with `None`.
#[derive(Clone)]
pub struct Disposer {
    // ---
    id: CorrelationId,
    slot: Arc<PendingSlot>,
    registry: Weak<CorrelationRegistry>,
}

impl Disposer {
    /// Dispose the call and drop its registry entry. Idempotent.
    pub fn dispose(&self) {
        // ---
        if self.slot.dispose() {
            log_debug!("pending call {} disposed", self.id);
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
    }
}

/// Handle to one in-flight remote call.
///
/// Returned by [`RpcClient::call`](crate::RpcClient::call). The reply, if
/// any, is read with [`recv`](Self::recv); at most one value is ever
/// produced, after which the handle reports end-of-stream.
///
/// `recv` waits without bound. Use [`recv_timeout`](Self::recv_timeout), or
/// race `recv` against a timer and call [`dispose`](Self::dispose), to cap
/// the wait. Dropping the handle disposes the call.
pub struct PendingCall {
    // ---
    output: mpsc::Receiver<Bytes>,
    disposer: Disposer,
}

impl PendingCall {
    // ---

    pub(crate) fn new(
        id: CorrelationId,
        slot: Arc<PendingSlot>,
        output: mpsc::Receiver<Bytes>,
        registry: &Arc<CorrelationRegistry>,
    ) -> Self {
        // ---
        Self {
            output,
            disposer: Disposer {
                id,
                slot,
                registry: Arc::downgrade(registry),
            },
        }
    }

    /// Correlation id this call was published with.
    pub fn id(&self) -> &CorrelationId {
        &self.disposer.id
    }

    /// Wait for the reply.
    ///
    /// Returns `Some(payload)` once, then `None`. Returns `None` immediately
    /// if the call was disposed before a reply arrived.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.output.recv().await
    }

    /// Take the reply if it has already arrived, without waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.output.try_recv().ok()
    }

    /// Wait for the reply for at most `timeout`.
    ///
    /// On expiry the call is disposed and [`RpcError::Timeout`] returned. A
    /// call disposed elsewhere before any reply yields [`RpcError::Disposed`].
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Bytes> {
        // ---
        match time::timeout(timeout, self.output.recv()).await {
            Ok(Some(payload)) => Ok(payload),
            Ok(None) => Err(RpcError::Disposed),
            Err(_) => {
                self.dispose();
                // A reply may have been pushed between the timer firing and
                // the slot closing.
                match self.output.try_recv() {
                    Ok(payload) => Ok(payload),
                    Err(_) => Err(RpcError::Timeout),
                }
            }
        }
    }

    /// Abandon the call. Idempotent; safe to race with reply delivery.
    pub fn dispose(&self) {
        self.disposer.dispose();
    }

    /// A cloneable handle that can dispose this call from elsewhere.
    pub fn disposer(&self) -> Disposer {
        self.disposer.clone()
    }

    /// Whether the call has been fulfilled or disposed.
    ///
    /// A fulfilled call may still hold an unread reply.
    pub fn is_closed(&self) -> bool {
        self.disposer.slot.is_closed()
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.disposer.dispose();
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
