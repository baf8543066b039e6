//! Notification sink that writes each trade event to the log as JSON.

use crate::ports::notify_port::{NotifyPort, TradeNotification};
use tracing::info;

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn render(notification: &TradeNotification) -> Result<String, String> {
        serde_json::to_string(notification).map_err(|e| e.to_string())
    }
}

impl NotifyPort for LogNotifier {
    fn notify(&self, notification: &TradeNotification) -> Result<(), String> {
        let payload = Self::render(notification)?;
        info!(instrument = notification.instrument(), %payload, "trade notification");
        Ok(())
    }
}
