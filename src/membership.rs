use crate::error::MembershipCheckError;
use async_trait::async_trait;
use teloxide::{
    prelude::*,
    types::{ChatMemberStatus, InlineKeyboardButton, InlineKeyboardMarkup, Recipient, UserId},
};
use tracing::warn;

pub const JOINED_CALLBACK: &str = "joined";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberStatus {
    Member,
    Admin,
    Owner,
    None,
}

impl MemberStatus {
    pub fn is_joined(self) -> bool {
        !matches!(self, MemberStatus::None)
    }
}

impl From<ChatMemberStatus> for MemberStatus {
    fn from(status: ChatMemberStatus) -> Self {
        match status {
            ChatMemberStatus::Owner => MemberStatus::Owner,
            ChatMemberStatus::Administrator => MemberStatus::Admin,
            ChatMemberStatus::Member => MemberStatus::Member,
            _ => MemberStatus::None,
        }
    }
}

#[async_trait]
pub trait MembershipLookup: Send + Sync {
    async fn member_status(&self, channel: &str, user: UserId) -> Result<MemberStatus, MembershipCheckError>;
}

#[async_trait]
impl MembershipLookup for Bot {
    async fn member_status(&self, channel: &str, user: UserId) -> Result<MemberStatus, MembershipCheckError> {
        let member = self
            .get_chat_member(Recipient::ChannelUsername(format!("@{channel}")), user)
            .await
            .map_err(|source| MembershipCheckError::Lookup {
                channel: channel.to_string(),
                source,
            })?;
        Ok(member.status().into())
    }
}

/// True only when the user is in every channel. Lookup failures count as
/// "not joined".
pub async fn has_joined_all<L>(lookup: &L, channels: &[String], user: UserId) -> bool
where
    L: MembershipLookup + ?Sized,
{
    for channel in channels {
        match lookup.member_status(channel, user).await {
            Ok(status) if status.is_joined() => {}
            Ok(_) => return false,
            Err(err) => {
                warn!(event = "membership_check_failed", user_id = user.0, error = %err);
                return false;
            }
        }
    }
    true
}

pub fn join_keyboard(channels: &[String]) -> InlineKeyboardMarkup {
    let mut rows: Vec<Vec<InlineKeyboardButton>> = Vec::new();
    for channel in channels {
        match reqwest::Url::parse(&format!("https://t.me/{channel}")) {
            Ok(url) => rows.push(vec![InlineKeyboardButton::url(format!("Join @{channel}"), url)]),
            Err(err) => warn!(event = "bad_channel_handle", channel = %channel, error = %err),
        }
    }
    rows.push(vec![InlineKeyboardButton::callback("Joined ✅", JOINED_CALLBACK)]);
    InlineKeyboardMarkup::new(rows)
}
