//! Background delivery of trade notifications.

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::warn;

use crate::ports::notify_port::{NotifyPort, TradeNotification};

/// Hands notifications to a worker thread so a slow or failing notifier
/// never blocks the caller. Dropping the dispatcher drains the queue.
pub struct NotificationDispatcher {
    sender: Option<Sender<TradeNotification>>,
    worker: Option<JoinHandle<()>>,
}

impl NotificationDispatcher {
    pub fn spawn(port: Arc<dyn NotifyPort>) -> Self {
        let (sender, receiver) = mpsc::channel::<TradeNotification>();
        let worker = thread::spawn(move || {
            for notification in receiver {
                if let Err(reason) = port.notify(&notification) {
                    warn!(
                        instrument = notification.instrument(),
                        %reason,
                        "notification delivery failed"
                    );
                }
            }
        });
        NotificationDispatcher {
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    /// A dispatcher that drops everything.
    pub fn disabled() -> Self {
        NotificationDispatcher {
            sender: None,
            worker: None,
        }
    }

    pub fn send(&self, notification: TradeNotification) {
        if let Some(sender) = &self.sender {
            if sender.send(notification).is_err() {
                warn!("notification worker has stopped");
            }
        }
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("notification worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    impl NotifyPort for Recorder {
        fn notify(&self, notification: &TradeNotification) -> Result<(), String> {
            self.seen
                .lock()
                .unwrap()
                .push(notification.instrument().to_string());
            if self.fail {
                Err("smtp down".into())
            } else {
                Ok(())
            }
        }
    }

    fn entered(instrument: &str) -> TradeNotification {
        TradeNotification::Entered {
            id: 1,
            instrument: instrument.into(),
            quantity: 10,
            price: 100.0,
            at: NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
        }
    }

    #[test]
    fn delivers_in_order_and_drains_on_drop() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail: false,
        });
        let dispatcher = NotificationDispatcher::spawn(recorder.clone());
        dispatcher.send(entered("A"));
        dispatcher.send(entered("B"));
        drop(dispatcher);
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["A", "B"]);
    }

    #[test]
    fn failures_do_not_stop_delivery() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail: true,
        });
        let dispatcher = NotificationDispatcher::spawn(recorder.clone());
        dispatcher.send(entered("A"));
        dispatcher.send(entered("B"));
        drop(dispatcher);
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn disabled_dispatcher_is_silent() {
        let dispatcher = NotificationDispatcher::disabled();
        dispatcher.send(entered("A"));
    }
}
