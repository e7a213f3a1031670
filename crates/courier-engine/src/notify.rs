use tracing::debug;

use courier_types::models::{ChatSummary, Message, UserSummary};

/// Sink for "new message" notifications aimed at recipients who are offline
/// or looking elsewhere. The engine guarantees the tuple is handed over at
/// send time; whether delivery succeeds is the sink's problem.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: &Message, sender: &UserSummary, chat: &ChatSummary);
}

/// Default sink: just logs. Swapped for a real push pipeline in deployment.
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, message: &Message, sender: &UserSummary, chat: &ChatSummary) {
        debug!(
            "notify: message {} from {} in chat {}",
            message.id, sender.username, chat.id
        );
    }
}
