use super::shared::{
    HandlerResult, callback_message_target, callback_prefix_filter, parse_callback_client,
    parse_callback_toggle, require_admin_callback,
};
use super::state::BotState;
use crate::panel::mutate::ClientUpdate;
use teloxide::dptree;
use teloxide::prelude::*;

pub fn handler()
-> teloxide::dispatching::UpdateHandler<Box<dyn std::error::Error + Send + Sync + 'static>> {
    Update::filter_callback_query()
        .branch(dptree::filter_map(callback_prefix_filter("crst:")).endpoint(callback_reset_traffic))
        .branch(dptree::filter_map(callback_prefix_filter("cen:")).endpoint(callback_toggle_enable))
        .branch(dptree::filter_map(callback_prefix_filter("cdel:")).endpoint(callback_delete_client))
        .branch(dptree::filter_map(callback_prefix_filter("srv:")).endpoint(callback_server_refresh))
}

async fn callback_reset_traffic(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let Some(admin_id) = require_admin_callback(&bot, &q, &state).await? else {
        return Ok(());
    };

    let data = q.data.as_deref().unwrap_or("");
    let (inbound_id, email) = parse_callback_client(data, "crst:")?;
    tracing::info!(admin_id, inbound_id, email = %email, "Reset traffic callback received");

    let ident = crate::link::ClientIdentifier::Email(email.clone());
    let result = state
        .mutator
        .reset_traffic(&ident, Some(inbound_id), Some(&email))
        .await;

    let answer = match result {
        Ok(true) => "Счётчики сброшены".to_string(),
        Ok(false) => "Панель отклонила сброс".to_string(),
        Err(error) => {
            tracing::error!(inbound_id, email = %email, error = %error, "Сброс трафика не удался");
            format!("Ошибка: {}", error)
        }
    };
    bot.answer_callback_query(q.id.clone()).text(answer).await?;
    Ok(())
}

async fn callback_toggle_enable(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let Some(admin_id) = require_admin_callback(&bot, &q, &state).await? else {
        return Ok(());
    };

    let data = q.data.as_deref().unwrap_or("");
    let (inbound_id, uuid, enable) = parse_callback_toggle(data)?;
    tracing::info!(admin_id, inbound_id, uuid = %uuid, enable, "Toggle enable callback received");

    let update = ClientUpdate {
        enable: Some(enable),
        ..ClientUpdate::default()
    };
    let result = state.mutator.update_client(&uuid, update).await;

    let answer = match result {
        Ok(true) if enable => "Клиент включен".to_string(),
        Ok(true) => "Клиент выключен".to_string(),
        Ok(false) => "Клиент не найден или панель отказала".to_string(),
        Err(error) => {
            tracing::error!(inbound_id, uuid = %uuid, error = %error, "Переключение не удалось");
            format!("Ошибка: {}", error)
        }
    };
    bot.answer_callback_query(q.id.clone()).text(answer).await?;
    Ok(())
}

async fn callback_delete_client(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let Some(admin_id) = require_admin_callback(&bot, &q, &state).await? else {
        return Ok(());
    };

    let data = q.data.as_deref().unwrap_or("");
    let (inbound_id, uuid) = parse_callback_client(data, "cdel:")?;
    tracing::info!(admin_id, inbound_id, uuid = %uuid, "Delete client callback received");

    match state.mutator.delete_client(&uuid, inbound_id).await {
        Ok(deleted) => {
            let answer = if deleted {
                "Клиент удалён"
            } else {
                "Клиент уже отсутствует"
            };
            bot.answer_callback_query(q.id.clone()).text(answer).await?;
            if deleted && let Some((chat_id, message_id)) = callback_message_target(&q) {
                // карточка устарела, убираем кнопки мутаций
                bot.edit_message_reply_markup(chat_id, message_id)
                    .reply_markup(teloxide::types::InlineKeyboardMarkup::default())
                    .await?;
                bot.send_message(chat_id, format!("🗑 Клиент {} удалён.", uuid))
                    .await?;
            }
        }
        Err(error) => {
            tracing::error!(inbound_id, uuid = %uuid, error = %error, "Удаление не удалось");
            bot.answer_callback_query(q.id.clone())
                .text(format!("Ошибка: {}", error))
                .await?;
        }
    }
    Ok(())
}

async fn callback_server_refresh(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    if require_admin_callback(&bot, &q, &state).await?.is_none() {
        return Ok(());
    }

    bot.answer_callback_query(q.id.clone()).await?;
    if let Some((chat_id, message_id)) = callback_message_target(&q) {
        match state.session.server_status().await {
            Ok(status) => {
                bot.edit_message_text(
                    chat_id,
                    message_id,
                    super::format::render_server_status(&status),
                )
                .reply_markup(crate::bot::keyboards::server_status_keyboard())
                .await?;
            }
            Err(error) => {
                bot.send_message(chat_id, format!("Панель недоступна: {}", error))
                    .await?;
            }
        }
    }
    Ok(())
}
