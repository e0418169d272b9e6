// Copyright (c) 2025 - Cowboy AI, Inc.
//! Cooperative cancellation for an apply pass

use tokio::sync::watch;

/// Requests cancellation; cheap to clone and hand to another task
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    sender: watch::Sender<bool>,
}

/// Observes cancellation inside the scheduler
#[derive(Debug, Clone)]
pub struct CancellationToken {
    receiver: watch::Receiver<bool>,
}

impl CancellationHandle {
    pub fn new() -> (Self, CancellationToken) {
        let (sender, receiver) = watch::channel(false);
        (Self { sender }, CancellationToken { receiver })
    }

    /// Nodes not yet started are skipped; in-flight nodes finish
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

impl CancellationToken {
    /// A token that is never cancelled
    pub fn never() -> Self {
        let (handle, token) = CancellationHandle::new();
        // Dropping the sender leaves the value at `false` forever
        drop(handle);
        token
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once cancellation is requested; pends forever otherwise
    pub async fn cancelled(&mut self) {
        let closed = self.receiver.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}
