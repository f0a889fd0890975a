//! Cooperative shutdown signal shared by the background loops.

use tokio::sync::watch;

/// Owner side: signal once, observed by every subscriber.
pub struct ShutdownController {
    sender: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            receiver: self.sender.subscribe(),
        }
    }

    /// Flip the signal. Loops finish their current batch and exit.
    pub fn signal(&self) {
        let _ = self.sender.send(true);
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscriber side, cheap to clone into each task.
#[derive(Clone)]
pub struct Shutdown {
    receiver: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve when shutdown is signalled (or the controller is gone).
    pub async fn recv(&mut self) {
        while !*self.receiver.borrow() {
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_reaches_all_subscribers() {
        let controller = ShutdownController::new();
        let mut first = controller.subscribe();
        let mut second = controller.subscribe();

        assert!(!first.is_shutdown());
        controller.signal();

        first.recv().await;
        second.recv().await;
        assert!(first.is_shutdown());
        assert!(second.is_shutdown());
    }

    #[tokio::test]
    async fn dropped_controller_releases_waiters() {
        let controller = ShutdownController::new();
        let mut shutdown = controller.subscribe();
        drop(controller);
        // Must not hang.
        shutdown.recv().await;
    }
}
