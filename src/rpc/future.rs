use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::error::{Result, SpreaderError};
use crate::protocol::DispatchResult;

/// Calls of one client still waiting for their reply, by correlation token.
#[derive(Debug, Clone, Default)]
pub(crate) struct PendingCalls {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<DispatchResult>>>>,
}

impl PendingCalls {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<DispatchResult>>> {
        // The map stays consistent even if a holder panicked.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn register(&self, token: &str) -> oneshot::Receiver<DispatchResult> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(token.to_string(), tx);
        rx
    }

    pub(crate) fn take(&self, token: &str) -> Option<oneshot::Sender<DispatchResult>> {
        self.lock().remove(token)
    }

    pub(crate) fn remove(&self, token: &str) {
        self.lock().remove(token);
    }

    /// Drop every registration; waiting futures see the call as closed.
    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

enum State {
    Pending(oneshot::Receiver<DispatchResult>),
    Resolved(DispatchResult),
    /// The reply can no longer arrive.
    Closed,
}

/// Handle to one outstanding call.
///
/// Resolves at most once, when the reply carrying its correlation token
/// arrives. Dropping an unresolved future withdraws its registration, so a
/// late reply is ignored.
pub struct RpcFuture {
    token: String,
    reply_to: String,
    state: State,
    pending: PendingCalls,
}

impl RpcFuture {
    pub(crate) fn new(
        token: String,
        reply_to: String,
        rx: oneshot::Receiver<DispatchResult>,
        pending: PendingCalls,
    ) -> Self {
        Self {
            token,
            reply_to,
            state: State::Pending(rx),
            pending,
        }
    }

    /// Correlation token of this call.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Queue the reply is expected on.
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// Check for the reply without waiting.
    pub fn poll(&mut self) -> Option<&DispatchResult> {
        if let State::Pending(rx) = &mut self.state {
            match rx.try_recv() {
                Ok(result) => self.state = State::Resolved(result),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Closed) => self.state = State::Closed,
            }
        }
        self.result()
    }

    pub fn is_ready(&mut self) -> bool {
        self.poll().is_some()
    }

    /// The result, if it has already been observed by `poll` or `wait`.
    pub fn result(&self) -> Option<&DispatchResult> {
        match &self.state {
            State::Resolved(result) => Some(result),
            _ => None,
        }
    }

    /// Wait for the reply. Fails if the client's reply stream closed first.
    pub async fn wait(&mut self) -> Result<&DispatchResult> {
        if let State::Pending(rx) = &mut self.state {
            self.state = match rx.await {
                Ok(result) => State::Resolved(result),
                Err(_) => State::Closed,
            };
        }
        match &self.state {
            State::Resolved(result) => Ok(result),
            _ => Err(SpreaderError::ConnectionClosed),
        }
    }

    /// Wait for the reply and take ownership of it.
    pub async fn into_result(mut self) -> Result<DispatchResult> {
        self.wait().await?;
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Resolved(result) => Ok(result),
            _ => Err(SpreaderError::ConnectionClosed),
        }
    }
}

impl std::fmt::Debug for RpcFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            State::Pending(_) => "pending",
            State::Resolved(_) => "resolved",
            State::Closed => "closed",
        };
        f.debug_struct("RpcFuture")
            .field("token", &self.token)
            .field("reply_to", &self.reply_to)
            .field("state", &state)
            .finish()
    }
}

impl Drop for RpcFuture {
    fn drop(&mut self) {
        if matches!(self.state, State::Pending(_)) {
            self.pending.remove(&self.token);
        }
    }
}
