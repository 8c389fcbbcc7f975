use std::sync::OnceLock;
use tokio::sync::Notify;

/// One-shot ready signal carrying a value.
///
/// The first [`Latch::release`] stores the value and wakes every waiter; later releases
/// are no-ops and return `false`.
#[derive(Debug)]
pub(crate) struct Latch<T> {
    value: OnceLock<T>,
    notify: Notify,
}

impl<T: Clone> Latch<T> {
    pub fn new() -> Latch<T> {
        Latch {
            value: OnceLock::new(),
            notify: Notify::new(),
        }
    }

    pub fn release(&self, value: T) -> bool {
        match self.value.set(value) {
            Ok(()) => {
                self.notify.notify_waiters();
                true
            }
            Err(_) => false,
        }
    }

    pub fn get(&self) -> Option<T> {
        self.value.get().cloned()
    }

    pub async fn wait(&self) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(value) = self.value.get() {
                return value.clone();
            }
            notified.await;
        }
    }
}
