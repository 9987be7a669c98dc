use crate::{
    broadcast::broadcast,
    config::Config,
    delivery::{deliver, StatusTicker},
    error::{AppError, InvalidSelection},
    membership::{has_joined_all, join_keyboard, JOINED_CALLBACK},
    progress::{render_progress, ProgressState},
    quality::{group_formats, QualityLadder},
    tasks::{
        build_selection_callback, is_selection_callback, OfferedFormat, PendingSelection, Selection,
        SelectionRegistry, TaskGuard, TaskId,
    },
    users::{UserRecord, UserStore},
    yt_dlp::{DownloadRequest, Downloader, MediaProvider, YtDlpClient},
};
use std::sync::Arc;
use teloxide::{
    dispatching::DpHandlerDescription,
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, MaybeInaccessibleMessage, MessageId},
    utils::command::BotCommands,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

const DOWNLOADING_TEXT: &str = "⬇️ Downloading video...";
const UPLOAD_FAILED_TEXT: &str = "❌ Failed to upload video. Please try again later.";

#[derive(Clone)]
pub struct AppServices {
    config: Arc<Config>,
    selections: SelectionRegistry,
    users: UserStore,
    media: Arc<dyn MediaProvider>,
    downloader: Arc<dyn Downloader>,
    shutdown: CancellationToken,
}

impl AppServices {
    pub fn new(config: Arc<Config>, shutdown: CancellationToken) -> Self {
        let yt_dlp = Arc::new(YtDlpClient::from_config(&config));
        Self {
            selections: SelectionRegistry::new(config.selection_ttl),
            users: UserStore::new(config.user_data_file.clone()),
            media: yt_dlp.clone(),
            downloader: yt_dlp,
            shutdown,
            config,
        }
    }
}

#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "lowercase", description = "These commands are supported:")]
pub enum Command {
    #[command(description = "register and show the channels to join")]
    Start,
    #[command(description = "show this help")]
    Help,
    #[command(description = "send a message to every user (admins only)")]
    Broadcast(String),
}

/// Plain text that is not a command.
#[derive(Clone, Debug)]
pub struct IncomingText(String);

pub fn build_handler() -> Handler<'static, DependencyMap, Result<(), AppError>, DpHandlerDescription> {
    dptree::entry()
        .branch(
            Update::filter_message()
                .branch(dptree::entry().filter_command::<Command>().endpoint(handle_command))
                .branch(dptree::filter_map(extract_text).endpoint(handle_link)),
        )
        .branch(Update::filter_callback_query().endpoint(handle_callback))
}

fn extract_text(msg: Message) -> Option<IncomingText> {
    let text = msg.text()?.trim();
    if text.is_empty() || text.starts_with('/') {
        None
    } else {
        Some(IncomingText(text.to_string()))
    }
}

async fn handle_command(bot: Bot, services: AppServices, msg: Message, cmd: Command) -> Result<(), AppError> {
    match cmd {
        Command::Start => handle_start(&bot, &services, &msg).await,
        Command::Help => {
            bot.send_message(msg.chat.id, Command::descriptions().to_string())
                .await?;
            Ok(())
        }
        Command::Broadcast(text) => handle_broadcast(&bot, &services, &msg, text.trim()).await,
    }
}

#[instrument(skip_all, fields(chat_id = msg.chat.id.0))]
async fn handle_start(bot: &Bot, services: &AppServices, msg: &Message) -> Result<(), AppError> {
    let Some(user) = msg.from.as_ref() else {
        warn!(event = "start_without_user");
        return Ok(());
    };
    info!(event = "start_command", user_id = user.id.0);

    match i64::try_from(user.id.0) {
        Ok(id) => {
            let record = UserRecord::new(id, user.username.clone(), user.first_name.clone());
            if let Err(err) = services.users.track(record).await {
                error!(event = "track_user_failed", user_id = user.id.0, error = %err);
            }
        }
        Err(_) => warn!(event = "user_id_out_of_range", user_id = user.id.0),
    }

    let channels = &services.config.required_channels;
    let mut request = bot.send_message(msg.chat.id, welcome_text(&user.first_name, !channels.is_empty()));
    if !channels.is_empty() {
        request = request.reply_markup(join_keyboard(channels));
    }
    request.await?;
    Ok(())
}

fn welcome_text(first_name: &str, gated: bool) -> String {
    let mut text = format!("👋 Hello {first_name}, welcome to the YouTube video download bot 🫶\n\n");
    if gated {
        text.push_str("⏩ Join the channels below first, then you can download any video 📷");
    } else {
        text.push_str("⏩ Send me any YouTube link and pick a quality 📷");
    }
    text
}

#[instrument(skip_all, fields(chat_id = msg.chat.id.0))]
async fn handle_broadcast(bot: &Bot, services: &AppServices, msg: &Message, text: &str) -> Result<(), AppError> {
    let is_admin = msg
        .from
        .as_ref()
        .is_some_and(|user| services.config.is_admin(user.id));
    if !is_admin {
        bot.send_message(msg.chat.id, "You are not authorized to use this command.")
            .await?;
        return Ok(());
    }
    if text.is_empty() {
        bot.send_message(
            msg.chat.id,
            "Please provide a message to broadcast.\nUsage: /broadcast <message>",
        )
        .await?;
        return Ok(());
    }

    let users = match services.users.load().await {
        Ok(list) => list.users,
        Err(err) => {
            error!(event = "broadcast_load_users_failed", error = %err);
            bot.send_message(msg.chat.id, "Error during broadcast: the user list could not be read.")
                .await?;
            return Ok(());
        }
    };
    let report = broadcast(bot, &users, text).await;
    bot.send_message(msg.chat.id, report.summary()).await?;
    Ok(())
}

#[instrument(skip_all, fields(chat_id = msg.chat.id.0))]
async fn handle_link(bot: Bot, services: AppServices, msg: Message, text: IncomingText) -> Result<(), AppError> {
    let chat_id = msg.chat.id;
    let Some(url) = find_youtube_url(&text.0) else {
        bot.send_message(chat_id, "Please provide a valid YouTube link")
            .await?;
        return Ok(());
    };
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };

    let channels = &services.config.required_channels;
    if !has_joined_all(&bot, channels, user.id).await {
        bot.send_message(chat_id, "❌ Join the required channels first")
            .reply_markup(join_keyboard(channels))
            .await?;
        return Ok(());
    }

    let status = bot
        .send_message(chat_id, "⌛ Fetching video information...")
        .await?;

    let info = match services.media.fetch_formats(&url).await {
        Ok(info) => info,
        Err(err) => {
            error!(event = "extraction_failed", user_id = user.id.0, url = %url, error = %err);
            edit_status(&bot, chat_id, status.id, err.user_message()).await;
            return Ok(());
        }
    };

    let ladder = group_formats(&info.formats);
    if ladder.is_empty() {
        info!(event = "no_quality_options", url = %url, format_count = info.formats.len());
        edit_status(
            &bot,
            chat_id,
            status.id,
            "Sorry, no available quality options found for this video.\nPlease try another link.",
        )
        .await;
        return Ok(());
    }

    let options = ladder
        .descending()
        .map(|c| {
            (
                c.bucket,
                OfferedFormat {
                    format_id: c.format.format_id.clone(),
                    has_audio: c.format.has_audio,
                },
            )
        })
        .collect();
    let task_id = services.selections.register(PendingSelection {
        chat_id,
        url: url.clone(),
        title: info.title.clone(),
        options,
    });
    debug!(
        event = "selection_registered",
        task_id = %task_id,
        pending = services.selections.len(),
        buckets = ladder.len()
    );

    bot.edit_message_text(chat_id, status.id, selection_prompt(info.title.as_deref()))
        .reply_markup(quality_keyboard(&task_id, &ladder))
        .await?;
    Ok(())
}

fn selection_prompt(title: Option<&str>) -> String {
    format!(
        "Title: {}\n\nSelect video quality:\n(Available quality: 144p to 1080p)\n⚠️ = File size larger than 1000MB",
        title.unwrap_or("Unknown")
    )
}

pub fn quality_keyboard(task_id: &TaskId, ladder: &QualityLadder) -> InlineKeyboardMarkup {
    let rows: Vec<Vec<InlineKeyboardButton>> = ladder
        .descending()
        .map(|c| {
            vec![InlineKeyboardButton::callback(
                c.description.clone(),
                build_selection_callback(task_id, c.bucket),
            )]
        })
        .collect();
    InlineKeyboardMarkup::new(rows)
}

async fn handle_callback(bot: Bot, services: AppServices, q: CallbackQuery) -> Result<(), AppError> {
    let data = q.data.clone().unwrap_or_default();
    let Some((chat_id, message_id)) = q.message.as_ref().map(message_location) else {
        bot.answer_callback_query(q.id.clone()).await?;
        return Ok(());
    };

    if data == JOINED_CALLBACK {
        bot.answer_callback_query(q.id.clone()).await?;
        let text = if has_joined_all(&bot, &services.config.required_channels, q.from.id).await {
            info!(event = "join_confirmed", user_id = q.from.id.0);
            "✅ Thank you for joining! You can now send YouTube links to download videos."
        } else {
            "❌ Please join all required channels first!"
        };
        bot.send_message(chat_id, text).await?;
        return Ok(());
    }

    if !is_selection_callback(&data) {
        debug!(event = "unknown_callback", data = %data);
        bot.answer_callback_query(q.id.clone()).await?;
        return Ok(());
    }

    let selection = match services.selections.resolve(&data, chat_id) {
        Ok(selection) => selection,
        Err(err) => {
            info!(event = "invalid_selection", user_id = q.from.id.0, reason = %err);
            bot.answer_callback_query(q.id.clone())
                .text(err.user_message())
                .await?;
            if err != InvalidSelection::AlreadyStarted {
                edit_status(&bot, chat_id, message_id, err.user_message()).await;
            }
            return Ok(());
        }
    };
    let guard = services.selections.guard(selection.task_id.clone());

    bot.answer_callback_query(q.id.clone()).await?;
    bot.edit_message_text(chat_id, message_id, DOWNLOADING_TEXT)
        .await?;

    let user_id = q.from.id.0;
    tokio::spawn(
        async move {
            run_download_task(bot, services, selection, guard, chat_id, message_id).await;
        }
        .instrument(tracing::info_span!("download_task", user_id)),
    );
    Ok(())
}

fn message_location(message: &MaybeInaccessibleMessage) -> (ChatId, MessageId) {
    match message {
        MaybeInaccessibleMessage::Inaccessible(m) => (m.chat.id, m.message_id),
        MaybeInaccessibleMessage::Regular(m) => (m.chat.id, m.id),
    }
}

#[instrument(skip_all, fields(url = %selection.url, bucket = selection.bucket, format_id = %selection.format.format_id))]
async fn run_download_task(
    bot: Bot,
    services: AppServices,
    selection: Selection,
    _guard: TaskGuard,
    chat_id: ChatId,
    message_id: MessageId,
) {

    let progress = ProgressState::new();
    let ticker = {
        let progress = progress.clone();
        let title = selection.title.clone();
        StatusTicker::spawn(
            bot.clone(),
            chat_id,
            message_id,
            Some(DOWNLOADING_TEXT.to_string()),
            move || render_progress(title.as_deref(), progress.latest()),
        )
    };

    let result = services
        .downloader
        .download(DownloadRequest {
            url: selection.url.clone(),
            format_id: selection.format.format_id.clone(),
            has_audio: selection.format.has_audio,
            progress,
            cancel: services.shutdown.child_token(),
        })
        .await;
    ticker.stop().await;

    let file = match result {
        Ok(file) => file,
        Err(err) => {
            error!(event = "download_failed", chat_id = chat_id.0, error = %err);
            edit_status(&bot, chat_id, message_id, err.user_message()).await;
            return;
        }
    };

    match deliver(&bot, chat_id, message_id, file, selection.title.as_deref()).await {
        Ok(()) => {
            if let Err(err) = bot.delete_message(chat_id, message_id).await {
                debug!(event = "status_delete_failed", error = %err);
            }
        }
        Err(err) => {
            error!(event = "upload_failed", chat_id = chat_id.0, error = %err);
            edit_status(&bot, chat_id, message_id, UPLOAD_FAILED_TEXT).await;
        }
    }
}

/// Rewrites the status message, falling back to a new message when the edit fails.
async fn edit_status(bot: &Bot, chat_id: ChatId, message_id: MessageId, text: &str) {
    if bot.edit_message_text(chat_id, message_id, text).await.is_err() {
        if let Err(err) = bot.send_message(chat_id, text).await {
            warn!(event = "status_send_failed", error = %err);
        }
    }
}

pub fn find_youtube_url(text: &str) -> Option<String> {
    text.split_whitespace()
        .find_map(parse_youtube_url)
        .map(|url| url.to_string())
}

/// Parses a YouTube link, assuming https when the scheme is left out.
fn parse_youtube_url(candidate: &str) -> Option<reqwest::Url> {
    let url = if candidate.contains("://") {
        reqwest::Url::parse(candidate).ok()?
    } else {
        reqwest::Url::parse(&format!("https://{candidate}")).ok()?
    };
    is_youtube_host(&url).then_some(url)
}

fn is_youtube_host(url: &reqwest::Url) -> bool {
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    let host = ["www.", "m.", "music."]
        .iter()
        .find_map(|prefix| host.strip_prefix(prefix))
        .unwrap_or(host.as_str());
    matches!(host, "youtube.com" | "youtu.be" | "youtube-nocookie.com")
}
