use crate::error::ConfigError;
use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};
use teloxide::types::UserId;

/// Upload ceiling of a self-hosted Bot API server.
const LOCAL_API_MAX_DOWNLOAD_MB: u64 = 2000;
/// Upload ceiling of the public Bot API.
const PUBLIC_API_MAX_DOWNLOAD_MB: u64 = 50;
const DEFAULT_MAX_DOWNLOAD_SECS: u64 = 30 * 60;
const DEFAULT_SELECTION_TTL_SECS: u64 = 60 * 60;

/// Settings fixed for the lifetime of the process.
///
/// Built once in `main` and shared by reference; nothing reads the
/// environment after startup.
#[derive(Clone)]
pub struct Config {
    pub bot_token: String,
    pub bot_api_url: Option<reqwest::Url>,
    pub required_channels: Vec<String>,
    pub admin_ids: Vec<UserId>,
    pub download_dir: PathBuf,
    pub user_data_file: PathBuf,
    pub pid_file: PathBuf,
    pub max_download_bytes: u64,
    pub max_download_duration: Duration,
    pub selection_ttl: Duration,
    pub yt_dlp: YtDlpSettings,
}

#[derive(Clone, Debug)]
pub struct YtDlpSettings {
    pub binary: String,
    pub player_client: Option<String>,
    pub force_ipv4: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bot_token = get("TELEGRAM_BOT_TOKEN")
            .or_else(|| get("TELOXIDE_TOKEN"))
            .ok_or(ConfigError::MissingToken)?;

        let bot_api_url = match get("BOT_API_URL") {
            Some(raw) => Some(reqwest::Url::parse(&raw).map_err(|_| ConfigError::ApiUrl(raw))?),
            None => None,
        };

        let required_channels = get("REQUIRED_CHANNELS")
            .map(|raw| parse_channels(&raw))
            .unwrap_or_default();

        let admin_ids = match get("ADMIN_IDS") {
            Some(raw) => parse_list::<u64>("ADMIN_IDS", &raw)?
                .into_iter()
                .map(UserId)
                .collect(),
            None => Vec::new(),
        };

        let default_max_mb = if bot_api_url.is_some() {
            LOCAL_API_MAX_DOWNLOAD_MB
        } else {
            PUBLIC_API_MAX_DOWNLOAD_MB
        };
        let max_download_mb = parse_or("MAX_DOWNLOAD_MB", get("MAX_DOWNLOAD_MB"), default_max_mb)?;
        let max_download_secs =
            parse_or("MAX_DOWNLOAD_SECS", get("MAX_DOWNLOAD_SECS"), DEFAULT_MAX_DOWNLOAD_SECS)?;
        let selection_ttl_secs =
            parse_or("SELECTION_TTL_SECS", get("SELECTION_TTL_SECS"), DEFAULT_SELECTION_TTL_SECS)?;

        let force_ipv4 = matches!(
            get("YTDLP_FORCE_IPV4").as_deref(),
            Some("1") | Some("true") | Some("TRUE") | Some("yes")
        );

        Ok(Self {
            bot_token,
            bot_api_url,
            required_channels,
            admin_ids,
            download_dir: get("DOWNLOAD_DIR").unwrap_or_else(|| "downloads".into()).into(),
            user_data_file: get("USER_DATA_FILE")
                .unwrap_or_else(|| "user_data.json".into())
                .into(),
            pid_file: get("PID_FILE").unwrap_or_else(|| "bot.pid".into()).into(),
            max_download_bytes: max_download_mb.saturating_mul(1024 * 1024),
            max_download_duration: Duration::from_secs(max_download_secs),
            selection_ttl: Duration::from_secs(selection_ttl_secs),
            yt_dlp: YtDlpSettings {
                binary: get("YTDLP_BIN").unwrap_or_else(|| "yt-dlp".into()),
                player_client: get("YTDLP_PLAYER_CLIENT"),
                force_ipv4,
            },
        })
    }

    pub fn is_admin(&self, user: UserId) -> bool {
        self.admin_ids.contains(&user)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bot_token", &"<redacted>")
            .field("bot_api_url", &self.bot_api_url.as_ref().map(|u| u.as_str()))
            .field("required_channels", &self.required_channels)
            .field("admin_ids", &self.admin_ids)
            .field("download_dir", &self.download_dir)
            .field("user_data_file", &self.user_data_file)
            .field("pid_file", &self.pid_file)
            .field("max_download_bytes", &self.max_download_bytes)
            .field("max_download_duration", &self.max_download_duration)
            .field("selection_ttl", &self.selection_ttl)
            .field("yt_dlp", &self.yt_dlp)
            .finish()
    }
}

fn parse_channels(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|c| c.trim().trim_start_matches('@'))
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_list<T: FromStr>(key: &'static str, raw: &str) -> Result<Vec<T>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse().map_err(|_| ConfigError::Invalid {
                key,
                value: v.to_string(),
            })
        })
        .collect()
}

fn parse_or<T: FromStr>(key: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        Some(v) => v.parse().map_err(|_| ConfigError::Invalid { key, value: v }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_token_is_set() {
        let config = config_from(&[("TELEGRAM_BOT_TOKEN", "123:abc")]).unwrap();
        assert_eq!(config.bot_token, "123:abc");
        assert!(config.required_channels.is_empty());
        assert!(config.admin_ids.is_empty());
        assert_eq!(config.download_dir, PathBuf::from("downloads"));
        assert_eq!(config.pid_file, PathBuf::from("bot.pid"));
        assert_eq!(config.max_download_bytes, 50 * 1024 * 1024);
        assert_eq!(config.max_download_duration, Duration::from_secs(1800));
        assert_eq!(config.yt_dlp.binary, "yt-dlp");
        assert!(!config.yt_dlp.force_ipv4);
    }

    #[test]
    fn local_api_server_raises_default_size_cap() {
        let config = config_from(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("BOT_API_URL", "http://localhost:8081"),
        ])
        .unwrap();
        assert!(config.bot_api_url.is_some());
        assert_eq!(config.max_download_bytes, 2000 * 1024 * 1024);

        let config = config_from(&[("TELEGRAM_BOT_TOKEN", "t"), ("MAX_DOWNLOAD_MB", "120")]).unwrap();
        assert_eq!(config.max_download_bytes, 120 * 1024 * 1024);
    }

    #[test]
    fn missing_token_is_an_error() {
        assert!(matches!(config_from(&[]), Err(ConfigError::MissingToken)));
        assert!(matches!(
            config_from(&[("TELEGRAM_BOT_TOKEN", "   ")]),
            Err(ConfigError::MissingToken)
        ));
    }

    #[test]
    fn parses_channels_and_admins() {
        let config = config_from(&[
            ("TELOXIDE_TOKEN", "t"),
            ("REQUIRED_CHANNELS", "@first, second ,,"),
            ("ADMIN_IDS", "7847143133, 42"),
        ])
        .unwrap();
        assert_eq!(config.required_channels, vec!["first", "second"]);
        assert_eq!(config.admin_ids, vec![UserId(7847143133), UserId(42)]);
        assert!(config.is_admin(UserId(42)));
        assert!(!config.is_admin(UserId(43)));
    }

    #[test]
    fn rejects_non_numeric_limits() {
        let err = config_from(&[("TELEGRAM_BOT_TOKEN", "t"), ("MAX_DOWNLOAD_MB", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MAX_DOWNLOAD_MB", .. }));
        let err = config_from(&[("TELEGRAM_BOT_TOKEN", "t"), ("ADMIN_IDS", "1,x")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "ADMIN_IDS", .. }));
    }

    #[test]
    fn debug_output_redacts_token() {
        let config = config_from(&[("TELEGRAM_BOT_TOKEN", "super-secret")]).unwrap();
        assert!(!format!("{config:?}").contains("super-secret"));
    }
}
