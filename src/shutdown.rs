//! Graceful-shutdown plumbing for the processor task.

use tokio::sync::broadcast;

/// Proof that a task stopped because it was asked to.
#[derive(Debug)]
pub struct CleanExit(());

impl CleanExit {
    pub(crate) fn new() -> Self {
        Self(())
    }
}

pub struct ShutdownSignal {
    tx: broadcast::Sender<()>,
    rx: broadcast::Receiver<()>,
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    pub fn new() -> (ShutdownSender, ShutdownSignal) {
        let (tx, rx) = broadcast::channel(1);
        (ShutdownSender(tx.clone()), ShutdownSignal { tx, rx })
    }

    pub async fn recv(&mut self) -> CleanExit {
        let _ = self.rx.recv().await;
        CleanExit(())
    }
}

pub struct ShutdownSender(broadcast::Sender<()>);

impl ShutdownSender {
    pub fn send_signal(self) {
        let _ = self.0.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_reaches_every_clone() {
        let (sender, mut first) = ShutdownSignal::new();
        let mut second = first.clone();
        sender.send_signal();
        first.recv().await;
        second.recv().await;
    }
}
