use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// Sending half of the process-wide stop signal.
pub struct ShutdownTrigger {
    sender: watch::Sender<bool>,
}

/// Cloneable listener that every background task checks between iterations.
#[derive(Clone)]
pub struct Shutdown {
    receiver: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownTrigger { sender }, Shutdown { receiver })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// The current flag, then every change after it.
    pub fn changes(&self) -> WatchStream<bool> {
        WatchStream::new(self.receiver.clone())
    }

    /// Resolves once shutdown is triggered or the trigger is gone.
    pub async fn wait(&mut self) {
        let _ = self.receiver.wait_for(|stopped| *stopped).await;
    }
}
