use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{bail, Result};

/// Where the Google authorized-user credentials come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GoogleToken {
    Inline(String),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub telegram_api_base: String,
    pub hydrax_api_key: String,
    pub hydrax_api_base: String,
    pub google_token: GoogleToken,
    pub drive_folder_id: String,
    pub whitelisted_users: HashSet<i64>,
    pub data_dir: PathBuf,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut missing = Vec::new();
        let bot_token = get("BOT_TOKEN").unwrap_or_else(|| {
            missing.push("BOT_TOKEN");
            String::new()
        });
        let hydrax_api_key = get("HYDRAX_API_KEY").unwrap_or_else(|| {
            missing.push("HYDRAX_API_KEY");
            String::new()
        });
        if !missing.is_empty() {
            bail!("missing required environment variables: {}", missing.join(", "));
        }

        let google_token = match get("TOKEN_JSON_DATA") {
            Some(data) => GoogleToken::Inline(data),
            None => GoogleToken::File(PathBuf::from(
                get("TOKEN_JSON_PATH").unwrap_or_else(|| "token.json".to_string()),
            )),
        };

        let whitelisted_users = parse_whitelist(&get("WHITELISTED_USERS").unwrap_or_default());

        let port = match get("PORT") {
            Some(raw) => match raw.trim().parse() {
                Ok(port) => port,
                Err(_) => bail!("PORT is not a valid port number: {raw}"),
            },
            None => 8000,
        };

        Ok(Self {
            bot_token,
            telegram_api_base: get("TELEGRAM_API_BASE")
                .unwrap_or_else(|| "https://api.telegram.org".to_string()),
            hydrax_api_key,
            hydrax_api_base: get("HYDRAX_API_BASE")
                .unwrap_or_else(|| "https://api.hydrax.net".to_string()),
            google_token,
            drive_folder_id: get("DRIVE_FOLDER_ID").unwrap_or_else(|| "root".to_string()),
            whitelisted_users,
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "data".to_string())),
            port,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("vidrelay.sqlite3")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    /// An empty whitelist admits everyone.
    pub fn is_whitelisted(&self, user_id: i64) -> bool {
        self.whitelisted_users.is_empty() || self.whitelisted_users.contains(&user_id)
    }
}

/// Parses `"ID1, ID2,ID3"`. Entries that are not plain digits are dropped.
pub fn parse_whitelist(raw: &str) -> HashSet<i64> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
        .filter_map(|s| s.parse().ok())
        .collect()
}
