use super::format::render_snapshot;
use super::state::BotState;
use crate::link::{self, ClientIdentifier};
use crate::panel::resolve::{ClientResolver, ResolvedClient};
use crate::panel::status;
use anyhow::anyhow;
use image::{DynamicImage, ImageFormat, Luma};
use qrcode::QrCode;
use std::io::Cursor;
use teloxide::prelude::*;
use teloxide::types::InputFile;

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Исход поиска статуса. «Не найдено» и «панель недоступна» — разные
/// состояния с разными подсказками пользователю; «неверная ссылка»
/// отсеивается ещё на извлечении идентификатора.
pub enum StatusLookup {
    NotFound,
    PanelUnavailable(String),
    Found(Box<ResolvedClient>),
}

/// Общий путь «идентификатор → клиент» для пользовательских и админских
/// обработчиков.
pub async fn lookup_status(
    state: &BotState,
    ident: &ClientIdentifier,
    known_inbound: Option<i64>,
) -> StatusLookup {
    let resolver = ClientResolver::new(state.session.as_ref(), &state.online);
    match resolver.resolve(ident, known_inbound).await {
        Ok(Some(resolved)) => StatusLookup::Found(Box::new(resolved)),
        Ok(None) => StatusLookup::NotFound,
        Err(error) => {
            tracing::error!(ident = %ident, error = %error, "Резолв клиента не удался");
            StatusLookup::PanelUnavailable(error.to_string())
        }
    }
}

/// Обрабатывает присланную ссылку: извлечение → резолв → ответ.
/// Удачный резолв запоминается как привязка чата к клиенту.
pub async fn handle_link_text(
    bot: &Bot,
    msg: &Message,
    state: &BotState,
    text: &str,
) -> HandlerResult {
    let Some(ident) = link::extract(text) else {
        bot.send_message(
            msg.chat.id,
            "Не удалось распознать ссылку. Пришлите ссылку вида vless://... целиком.",
        )
        .await?;
        return Ok(());
    };

    match lookup_status(state, &ident, None).await {
        StatusLookup::Found(resolved) => {
            let snapshot = status::build(&resolved);
            if let Some(user_id) = super::state::sender_user_id(msg) {
                let bound = state
                    .db
                    .bind_client(user_id, resolved.email(), resolved.uuid())
                    .await?;
                if bound {
                    tracing::info!(
                        user_id,
                        email = ?resolved.email(),
                        "Чат привязан к клиенту панели"
                    );
                }
            }
            bot.send_message(msg.chat.id, render_snapshot(&snapshot))
                .await?;
            send_link_qr(bot, msg.chat.id, text).await;
        }
        StatusLookup::NotFound => {
            bot.send_message(
                msg.chat.id,
                "Клиент по этой ссылке не найден на панели. Проверьте ссылку или обратитесь к администратору.",
            )
            .await?;
        }
        StatusLookup::PanelUnavailable(_) => {
            bot.send_message(
                msg.chat.id,
                "Панель сейчас недоступна, попробуйте позже.",
            )
            .await?;
        }
    }
    Ok(())
}

/// Статус по сохранённой привязке (кнопка «Мой статус»).
pub async fn send_bound_status(
    bot: &Bot,
    chat_id: ChatId,
    tg_user_id: i64,
    state: &BotState,
) -> HandlerResult {
    let binding = state.db.get_user(tg_user_id).await?;
    let ident = binding.as_ref().and_then(|user| {
        user.client_uuid
            .clone()
            .map(ClientIdentifier::Uuid)
            .or_else(|| user.client_email.clone().map(ClientIdentifier::Email))
    });
    let Some(ident) = ident else {
        bot.send_message(
            chat_id,
            "Ссылка ещё не привязана. Пришлите свою ссылку подключения (vless://...) одним сообщением.",
        )
        .reply_markup(crate::bot::keyboards::user_menu())
        .await?;
        return Ok(());
    };

    match lookup_status(state, &ident, None).await {
        StatusLookup::Found(resolved) => {
            let snapshot = status::build(&resolved);
            bot.send_message(chat_id, render_snapshot(&snapshot)).await?;
        }
        StatusLookup::NotFound => {
            bot.send_message(
                chat_id,
                "Привязанный клиент больше не найден на панели. Пришлите актуальную ссылку.",
            )
            .await?;
        }
        StatusLookup::PanelUnavailable(_) => {
            bot.send_message(chat_id, "Панель сейчас недоступна, попробуйте позже.")
                .await?;
        }
    }
    Ok(())
}

/// Карточка клиента для админа: снапшот + inline-кнопки мутаций.
/// Кнопки требуют известного inbound'а, при необходимости он
/// дорезолвливается полным обходом.
pub async fn send_admin_client_card(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    ident: &ClientIdentifier,
) -> HandlerResult {
    match lookup_status(state, ident, None).await {
        StatusLookup::Found(mut resolved) => {
            if resolved.inbound_id.is_none() || resolved.client.is_none() {
                let resolver = ClientResolver::new(state.session.as_ref(), &state.online);
                match resolver.backfill_inbound(ident).await {
                    Ok(Some((inbound_id, client))) => {
                        resolved.inbound_id = Some(inbound_id);
                        resolved.client = Some(client);
                    }
                    Ok(None) => {}
                    Err(error) => {
                        tracing::warn!(ident = %ident, error = %error, "Не удалось дорезолвить inbound");
                    }
                }
            }
            let snapshot = status::build(&resolved);
            let mut request = bot.send_message(chat_id, render_snapshot(&snapshot));
            if let (Some(inbound_id), Some(client)) =
                (resolved.inbound_id, resolved.client.as_ref())
            {
                request = request.reply_markup(crate::bot::keyboards::client_card_keyboard(
                    inbound_id,
                    &client.id,
                    &client.email,
                    client.enable,
                ));
            }
            request.await?;
        }
        StatusLookup::NotFound => {
            bot.send_message(chat_id, format!("Клиент {} не найден.", ident))
                .await?;
        }
        StatusLookup::PanelUnavailable(reason) => {
            bot.send_message(chat_id, format!("Панель недоступна: {}", reason))
                .await?;
        }
    }
    Ok(())
}

/// callback-данные вида `prefix<inbound_id>:<хвост>`.
pub fn parse_callback_client(data: &str, prefix: &str) -> Result<(i64, String), anyhow::Error> {
    let payload = data
        .strip_prefix(prefix)
        .ok_or_else(|| anyhow!("Некорректный callback payload"))?;
    let (inbound, tail) = payload
        .split_once(':')
        .ok_or_else(|| anyhow!("В callback нет разделителя"))?;
    let inbound_id = inbound
        .parse::<i64>()
        .map_err(|_| anyhow!("Некорректный inbound_id"))?;
    if tail.is_empty() {
        return Err(anyhow!("Пустой идентификатор в callback"));
    }
    Ok((inbound_id, tail.to_string()))
}

/// `cen:<inbound>:<uuid>:<0|1>`.
pub fn parse_callback_toggle(data: &str) -> Result<(i64, String, bool), anyhow::Error> {
    let (inbound_id, tail) = parse_callback_client(data, "cen:")?;
    let (uuid, flag) = tail
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("В callback нет флага"))?;
    let enable = match flag {
        "1" => true,
        "0" => false,
        _ => return Err(anyhow!("Некорректный флаг enable")),
    };
    Ok((inbound_id, uuid.to_string(), enable))
}

pub fn callback_message_target(q: &CallbackQuery) -> Option<(ChatId, teloxide::types::MessageId)> {
    q.message.as_ref().map(|msg| (msg.chat().id, msg.id()))
}

pub fn callback_prefix_filter(
    prefix: &'static str,
) -> impl Fn(CallbackQuery) -> Option<CallbackQuery> {
    move |q: CallbackQuery| {
        if q.data
            .as_deref()
            .is_some_and(|payload| payload.starts_with(prefix))
        {
            Some(q)
        } else {
            None
        }
    }
}

pub async fn require_admin_callback(
    bot: &Bot,
    q: &CallbackQuery,
    state: &BotState,
) -> Result<Option<i64>, anyhow::Error> {
    let admin_id = q.from.id.0 as i64;
    if !state.config.is_admin(admin_id) {
        bot.answer_callback_query(q.id.clone())
            .text("Недостаточно прав")
            .show_alert(true)
            .await?;
        return Ok(None);
    }
    Ok(Some(admin_id))
}

pub async fn mark_awaiting_broadcast(state: &BotState, admin_id: i64) {
    state.awaiting_broadcast.lock().await.insert(admin_id);
}

pub async fn take_awaiting_broadcast(state: &BotState, admin_id: i64) -> bool {
    state.awaiting_broadcast.lock().await.remove(&admin_id)
}

/// Рассылка текста всем известным чатам. Ошибки отдельных чатов
/// (заблокировали бота и т.п.) не прерывают рассылку.
pub async fn broadcast_text(bot: &Bot, state: &BotState, text: &str) -> Result<(usize, usize), anyhow::Error> {
    let chat_ids = state.db.list_chat_ids().await?;
    let mut sent = 0usize;
    let mut failed = 0usize;
    for chat_id in chat_ids {
        match bot.send_message(ChatId(chat_id), text).await {
            Ok(_) => sent += 1,
            Err(error) => {
                failed += 1;
                tracing::warn!(chat_id, error = %error, "Не удалось доставить рассылку");
            }
        }
    }
    tracing::info!(sent, failed, "Рассылка завершена");
    Ok((sent, failed))
}

/// Забирает бэкап БД панели и отправляет файлом в чат.
pub async fn send_panel_backup(bot: &Bot, chat_id: ChatId, state: &BotState) -> HandlerResult {
    match state.session.download_db().await {
        Ok(bytes) => {
            let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
            bot.send_document(
                chat_id,
                InputFile::memory(bytes).file_name(format!("x-ui-backup-{}.db", stamp)),
            )
            .await?;
        }
        Err(error) => {
            tracing::error!(error = %error, "Не удалось скачать бэкап панели");
            bot.send_message(chat_id, format!("Бэкап не удался: {}", error))
                .await?;
        }
    }
    Ok(())
}

pub fn build_qr_png_bytes(payload: &str) -> Result<Vec<u8>, anyhow::Error> {
    let qr = QrCode::new(payload.as_bytes())?;
    let image = qr
        .render::<Luma<u8>>()
        .quiet_zone(true)
        .min_dimensions(512, 512)
        .build();
    let mut bytes = Vec::new();
    {
        let mut cursor = Cursor::new(&mut bytes);
        DynamicImage::ImageLuma8(image).write_to(&mut cursor, ImageFormat::Png)?;
    }
    Ok(bytes)
}

// QR — приятное дополнение; его сбой не должен ломать ответ со статусом
async fn send_link_qr(bot: &Bot, chat_id: ChatId, link_text: &str) {
    let qr_png = match build_qr_png_bytes(link_text.trim()) {
        Ok(bytes) => bytes,
        Err(error) => {
            tracing::warn!(error = %error, "Не удалось построить QR по ссылке");
            return;
        }
    };
    if let Err(error) = bot
        .send_photo(
            chat_id,
            InputFile::memory(qr_png).file_name("connection-qr.png"),
        )
        .caption("QR вашей ссылки подключения")
        .await
    {
        tracing::warn!(error = %error, "Не удалось отправить QR");
    }
}

pub fn user_id_or_reply(msg: &Message) -> Result<i64, anyhow::Error> {
    super::state::sender_user_id(msg)
        .ok_or_else(|| anyhow!("Не удалось определить пользователя отправителя"))
}
