use crate::users::UserRecord;
use async_trait::async_trait;
use teloxide::{prelude::*, RequestError};
use tracing::{info, instrument, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, chat_id: ChatId, text: &str) -> Result<(), RequestError>;
}

#[async_trait]
impl Notifier for Bot {
    async fn notify(&self, chat_id: ChatId, text: &str) -> Result<(), RequestError> {
        self.send_message(chat_id, text).await?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub success_count: usize,
    pub fail_count: usize,
}

impl BroadcastReport {
    pub fn summary(&self) -> String {
        format!(
            "Broadcast completed!\n✅ Successfully sent: {}\n❌ Failed: {}",
            self.success_count, self.fail_count
        )
    }
}

/// Sends `text` to every user; a failed recipient is counted and skipped.
#[instrument(skip(notifier, users, text), fields(recipients = users.len()))]
pub async fn broadcast<N>(notifier: &N, users: &[UserRecord], text: &str) -> BroadcastReport
where
    N: Notifier + ?Sized,
{
    let mut report = BroadcastReport::default();
    for user in users {
        match notifier.notify(ChatId(user.id), text).await {
            Ok(()) => report.success_count += 1,
            Err(err) => {
                warn!(event = "broadcast_send_failed", user_id = user.id, error = %err);
                report.fail_count += 1;
            }
        }
    }
    info!(
        event = "broadcast_finished",
        success = report.success_count,
        failed = report.fail_count
    );
    report
}
