//! Клиент панели x-ui: сессия, обход inbound'ов, резолв клиентов,
//! мутации и кэш онлайн-листинга.

pub mod mutate;
pub mod online;
pub mod resolve;
pub mod scanner;
pub mod session;
pub mod status;
pub mod types;

use thiserror::Error;

/// Ошибки взаимодействия с панелью.
///
/// «Клиент не найден» ошибкой не считается — резолвер возвращает `Ok(None)`,
/// чтобы слой отображения мог отличить «нет такого» от «панель недоступна».
#[derive(Debug, Error)]
pub enum PanelError {
    /// Авторизация не прошла даже после повторного логина.
    #[error("панель не приняла авторизацию")]
    Unauthorized,
    /// Таймаут или обрыв соединения. На этом уровне не ретраится.
    #[error("сетевая ошибка панели: {0}")]
    NetworkFailure(#[from] reqwest::Error),
    /// Пустое тело, не-JSON или неожиданная структура ответа.
    #[error("некорректный ответ панели: {0}")]
    InvalidResponse(String),
    /// Панель ответила success=false.
    #[error("панель отклонила запрос: {0}")]
    RemoteRejected(String),
}
