use tokio::sync::watch;

/// Triggers process-wide shutdown of all server loops. Dropping the trigger releases all waiting
///  loops as well.
pub struct ShutdownTrigger {
    sender: watch::Sender<bool>,
}
impl ShutdownTrigger {
    pub fn new() -> ShutdownTrigger {
        let (sender, _) = watch::channel(false);
        ShutdownTrigger { sender }
    }

    pub fn signal(&self) -> Shutdown {
        Shutdown {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }
}
impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// The 'running' flag as seen from a single loop. Loops `select!` on [Shutdown::wait] next to
///  their socket operations so that a blocking read never delays shutdown.
#[derive(Clone)]
pub struct Shutdown {
    receiver: watch::Receiver<bool>,
}
impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// completes once shutdown was triggered (or the trigger was dropped)
    pub async fn wait(&mut self) {
        let _ = self.receiver.wait_for(|&triggered| triggered).await;
    }
}
