use super::commands::{cmd_help, send_online_list, send_server_status};
use super::format::{render_bot_stats, usage_guide_text};
use super::shared::{
    HandlerResult, broadcast_text, handle_link_text, mark_awaiting_broadcast, send_bound_status,
    send_panel_backup, take_awaiting_broadcast,
};
use super::state::{BotState, sender_display_name, sender_user_id};
use teloxide::prelude::*;

/// Fallback для текстов вне команд: кнопки меню, ожидаемый текст рассылки
/// и присланные ссылки подключения.
pub async fn handle_menu_buttons(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(user_id) = sender_user_id(&msg) else {
        return Ok(());
    };
    let is_admin = state.config.is_admin(user_id);

    let username = msg.from.as_ref().and_then(|u| u.username.clone());
    let display_name = sender_display_name(&msg);
    state
        .db
        .touch_user(user_id, username.as_deref(), display_name.as_deref())
        .await?;

    if is_admin && take_awaiting_broadcast(&state, user_id).await {
        let (sent, failed) = broadcast_text(&bot, &state, text.trim()).await?;
        bot.send_message(
            msg.chat.id,
            format!(
                "📣 Рассылка завершена: доставлено {}, не доставлено {}.",
                sent, failed
            ),
        )
        .await?;
        return Ok(());
    }

    if text.trim_start().starts_with("vless://") {
        return handle_link_text(&bot, &msg, &state, text.trim()).await;
    }

    match text {
        crate::bot::keyboards::BTN_USER_STATUS => {
            send_bound_status(&bot, msg.chat.id, user_id, &state).await?;
        }
        crate::bot::keyboards::BTN_USER_GUIDE => {
            bot.send_message(msg.chat.id, usage_guide_text())
                .reply_markup(crate::bot::keyboards::user_menu())
                .await?;
        }
        crate::bot::keyboards::BTN_ADMIN_ONLINE if is_admin => {
            send_online_list(&bot, msg.chat.id, &state).await?;
        }
        crate::bot::keyboards::BTN_ADMIN_SERVER if is_admin => {
            send_server_status(&bot, msg.chat.id, &state).await?;
        }
        crate::bot::keyboards::BTN_ADMIN_STATS if is_admin => {
            let stats = state.db.stats().await?;
            bot.send_message(msg.chat.id, render_bot_stats(&stats))
                .await?;
        }
        crate::bot::keyboards::BTN_ADMIN_BACKUP if is_admin => {
            send_panel_backup(&bot, msg.chat.id, &state).await?;
        }
        crate::bot::keyboards::BTN_ADMIN_BROADCAST if is_admin => {
            mark_awaiting_broadcast(&state, user_id).await;
            bot.send_message(msg.chat.id, "Пришлите текст рассылки следующим сообщением.")
                .await?;
        }
        _ if is_admin => {
            cmd_help(bot, msg, state).await?;
        }
        _ => {
            bot.send_message(
                msg.chat.id,
                "Не понял запрос. Пришлите ссылку подключения (vless://...) или используйте кнопки меню.",
            )
            .reply_markup(crate::bot::keyboards::user_menu())
            .await?;
        }
    }
    Ok(())
}
