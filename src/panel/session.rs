//! Авторизованная HTTP-сессия панели.
//!
//! Один reqwest-клиент с cookie-store на процесс; логин ленивый, при
//! 401-эквиваленте запрос перелогинивается ровно один раз и повторяется.
//! Сетевые сбои здесь не ретраятся — политика повторов лежит на вызывающем.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::Mutex;

use super::PanelError;
use super::types::{ApiEnvelope, ObjPayload};
use crate::config::PanelConfig;

/// Транспорт запросов к API панели. Отдельный шов, чтобы обход, резолв и
/// мутации тестировались без сети, тем же приёмом, что `OnlineSource`
/// у онлайн-кэша.
#[async_trait]
pub trait PanelApi: Send + Sync {
    async fn get(&self, path: &str) -> Result<ApiEnvelope, PanelError>;
    async fn post(&self, path: &str, body: Option<&Value>) -> Result<ApiEnvelope, PanelError>;
}

#[async_trait]
impl PanelApi for PanelSession {
    async fn get(&self, path: &str) -> Result<ApiEnvelope, PanelError> {
        PanelSession::get(self, path).await
    }

    async fn post(&self, path: &str, body: Option<&Value>) -> Result<ApiEnvelope, PanelError> {
        PanelSession::post(self, path, body).await
    }
}

pub struct PanelSession {
    http: Client,
    base: Url,
    username: String,
    password: String,
    // сериализует повторные логины, чтобы пачка одновременных 401
    // не устроила шторм POST /login
    login_guard: Mutex<()>,
}

impl PanelSession {
    pub fn new(cfg: &PanelConfig) -> Result<Self, anyhow::Error> {
        let mut base_url = cfg.base_url.trim().to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        let base = Url::parse(&base_url)
            .map_err(|e| anyhow::anyhow!("Некорректный base_url панели {}: {}", base_url, e))?;

        let http = Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .danger_accept_invalid_certs(cfg.accept_invalid_certs)
            .build()
            .map_err(|e| anyhow::anyhow!("Не удалось собрать HTTP-клиент: {}", e))?;

        Ok(Self {
            http,
            base,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            login_guard: Mutex::new(()),
        })
    }

    /// Явный логин; используется при старте для ранней диагностики
    /// и внутри ретрая по 401.
    pub async fn ensure_authenticated(&self) -> Result<(), PanelError> {
        let _guard = self.login_guard.lock().await;
        let url = self.endpoint("login")?;
        let body = json!({ "username": self.username, "password": self.password });
        let resp = self.http.post(url).json(&body).send().await?;
        if is_auth_failure(resp.status()) {
            return Err(PanelError::Unauthorized);
        }
        let envelope = parse_envelope(resp).await?;
        if !envelope.success {
            tracing::warn!(msg = %envelope.msg, "Панель отклонила логин");
            return Err(PanelError::Unauthorized);
        }
        tracing::info!("Авторизация в панели выполнена");
        Ok(())
    }

    /// Запрос с однократным прозрачным перелогином на 401-эквивалент.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<ApiEnvelope, PanelError> {
        match self.request_once(method.clone(), path, body).await {
            Err(PanelError::Unauthorized) => {
                tracing::warn!(path, "Сессия панели истекла, выполняю повторный логин");
                self.ensure_authenticated().await?;
                self.request_once(method, path, body).await
            }
            other => other,
        }
    }

    pub async fn get(&self, path: &str) -> Result<ApiEnvelope, PanelError> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: Option<&Value>) -> Result<ApiEnvelope, PanelError> {
        self.request(Method::POST, path, body).await
    }

    /// Сводка состояния сервера панели (cpu, память, аптайм) как есть.
    pub async fn server_status(&self) -> Result<serde_json::Map<String, Value>, PanelError> {
        match self.post("server/status", None).await?.into_payload()? {
            ObjPayload::Object(map) => Ok(map),
            _ => Err(PanelError::InvalidResponse(
                "server/status вернул не объект".to_string(),
            )),
        }
    }

    /// Скачивает файл БД панели. Ответ — сырые байты, не JSON-конверт.
    pub async fn download_db(&self) -> Result<Vec<u8>, PanelError> {
        let resp = match self.raw_get_once("server/getDb").await {
            Err(PanelError::Unauthorized) => {
                self.ensure_authenticated().await?;
                self.raw_get_once("server/getDb").await?
            }
            other => other?,
        };
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(PanelError::InvalidResponse(
                "пустой файл резервной копии".to_string(),
            ));
        }
        Ok(bytes.to_vec())
    }

    async fn request_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<ApiEnvelope, PanelError> {
        let url = self.endpoint(path)?;
        let mut req = self.http.request(method, url);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        if is_auth_failure(resp.status()) {
            return Err(PanelError::Unauthorized);
        }
        parse_envelope(resp).await
    }

    async fn raw_get_once(&self, path: &str) -> Result<reqwest::Response, PanelError> {
        let resp = self.http.get(self.endpoint(path)?).send().await?;
        if is_auth_failure(resp.status()) {
            return Err(PanelError::Unauthorized);
        }
        Ok(resp)
    }

    fn endpoint(&self, path: &str) -> Result<Url, PanelError> {
        self.base.join(path).map_err(|e| {
            PanelError::InvalidResponse(format!("некорректный путь запроса {}: {}", path, e))
        })
    }
}

fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

async fn parse_envelope(resp: reqwest::Response) -> Result<ApiEnvelope, PanelError> {
    let status = resp.status();
    let text = resp.text().await?;
    if text.trim().is_empty() {
        return Err(PanelError::InvalidResponse(format!(
            "пустое тело ответа (HTTP {})",
            status
        )));
    }
    serde_json::from_str(&text).map_err(|error| {
        PanelError::InvalidResponse(format!("ответ не является JSON (HTTP {}): {}", status, error))
    })
}
