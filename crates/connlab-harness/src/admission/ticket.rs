use super::{Grant, Shared};
use connlab_core::error::HarnessError;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// One admitted connection's claim on its group. Dropping it releases the
/// slot, handing it to the next waiter if there is one.
pub struct AdmissionSlot<C> {
    shared: Arc<Shared<C>>,
    group: String,
    close_token: CancellationToken,
    released: bool,
}

impl<C> AdmissionSlot<C> {
    pub(crate) fn granted(shared: Arc<Shared<C>>, group: &str, close_token: CancellationToken) -> Self {
        Self {
            shared,
            group: group.to_string(),
            close_token,
            released: false,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Cancelled when the group is closed while this slot is held.
    pub fn close_token(&self) -> &CancellationToken {
        &self.close_token
    }

    /// Gives up the guard without releasing; the caller takes over the slot.
    pub(crate) fn into_group(mut self) -> String {
        self.released = true;
        std::mem::take(&mut self.group)
    }
}

impl<C> Drop for AdmissionSlot<C> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.release(&self.group);
        }
    }
}

impl<C> std::fmt::Debug for AdmissionSlot<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionSlot")
            .field("group", &self.group)
            .field("released", &self.released)
            .finish()
    }
}

/// A queued request for a slot.
///
/// Dropping the ticket withdraws it; a grant that raced with the drop is
/// released again so the slot is never lost.
pub struct Ticket<C> {
    shared: Arc<Shared<C>>,
    group: String,
    id: u64,
    rx: Option<oneshot::Receiver<Result<Grant<C>, HarnessError>>>,
}

impl<C> Ticket<C> {
    pub(crate) fn new(
        shared: Arc<Shared<C>>,
        group: &str,
        id: u64,
        rx: oneshot::Receiver<Result<Grant<C>, HarnessError>>,
    ) -> Self {
        Self {
            shared,
            group: group.to_string(),
            id,
            rx: Some(rx),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Waits for a slot. Yields the pooled connection when one was handed
    /// over instead of a fresh slot.
    pub async fn wait(mut self) -> Result<(Option<C>, AdmissionSlot<C>), HarnessError> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(HarnessError::Canceled);
        };
        let outcome = rx.await;
        self.rx = None;
        let grant = match outcome {
            Ok(Ok(grant)) => grant,
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(HarnessError::Canceled),
        };
        let token = self.shared.close_token(&self.group);
        let slot = AdmissionSlot::granted(Arc::clone(&self.shared), &self.group, token);
        match grant {
            Grant::Fresh => Ok((None, slot)),
            Grant::Reused(connection) => Ok((Some(connection), slot)),
        }
    }
}

impl<C> Drop for Ticket<C> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        if self.shared.withdraw(&self.group, self.id) {
            tracing::debug!("admission: waiter {} withdrew from {}", self.id, self.group);
            return;
        }
        rx.close();
        if let Ok(Ok(grant)) = rx.try_recv() {
            tracing::debug!(
                "admission: waiter {} dropped with a grant, releasing it",
                self.id
            );
            drop(grant);
            self.shared.release(&self.group);
        }
    }
}
