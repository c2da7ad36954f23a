//! Конфигурация бота и панели (TOML).

use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct Config {
    bot_token: Option<String>,
    bot_token_file: Option<PathBuf>,
    #[serde(default)]
    pub admin_ids: Vec<i64>,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    pub panel: PanelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PanelConfig {
    /// Базовый URL панели вместе с web base path, например
    /// `https://panel.example.com:2053/secret/`.
    pub base_url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Панели часто живут на самоподписанных сертификатах.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_online_ttl_secs")]
    pub online_ttl_secs: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/xui-admin/bot.db")
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_online_ttl_secs() -> u64 {
    10
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Не удалось прочитать конфиг {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Не удалось разобрать конфиг: {}", e))?;

        if config.admin_ids.is_empty() {
            tracing::warn!("Список admin_ids пуст — админ-команды будут недоступны");
        }
        if config.panel.base_url.trim().is_empty() {
            return Err(anyhow::anyhow!("В конфиге не задан panel.base_url"));
        }
        Ok(config)
    }

    pub fn bot_token(&self) -> Result<String, anyhow::Error> {
        if let Some(token) = &self.bot_token
            && !token.trim().is_empty()
        {
            return Ok(token.trim().to_string());
        }
        if let Some(path) = &self.bot_token_file {
            let token = std::fs::read_to_string(path).map_err(|e| {
                anyhow::anyhow!("Не удалось прочитать bot_token_file {}: {}", path.display(), e)
            })?;
            let token = token.trim();
            if !token.is_empty() {
                return Ok(token.to_string());
            }
        }
        Err(anyhow::anyhow!(
            "В конфиге не задан bot_token или bot_token_file"
        ))
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_ids.contains(&user_id)
    }
}
