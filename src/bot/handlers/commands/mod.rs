use super::format::{render_bot_stats, render_online_list, render_server_status};
use super::shared::{
    HandlerResult, broadcast_text, mark_awaiting_broadcast, send_admin_client_card,
    send_bound_status, send_panel_backup, user_id_or_reply,
};
use super::state::{BotState, is_admin_message, sender_display_name, sender_user_id};
use crate::link::{self, ClientIdentifier};
use crate::panel::mutate::{AddClientOpts, ClientUpdate};
use crate::panel::resolve::ClientResolver;
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use uuid::Uuid;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
pub enum BotCommand {
    #[command(description = "Начать работу с ботом")]
    Start,
    #[command(description = "Справка")]
    Help,
    #[command(description = "Статус вашей подписки")]
    Status,
    #[command(description = "Найти клиента (админ)")]
    Search,
    #[command(description = "Добавить клиента (админ)")]
    Add,
    #[command(description = "Удалить клиента (админ)")]
    Delete,
    #[command(description = "Сбросить трафик клиента (админ)")]
    Reset,
    #[command(description = "Изменить квоту/срок клиента (админ)")]
    Update,
    #[command(description = "Кто сейчас онлайн (админ)")]
    Online,
    #[command(description = "Состояние сервера панели (админ)")]
    Server,
    #[command(description = "Бэкап БД панели (админ)")]
    Backup,
    #[command(description = "Рассылка всем пользователям (админ)")]
    Broadcast,
    #[command(description = "Статистика бота (админ)")]
    Stats,
}

pub fn handler()
-> teloxide::dispatching::UpdateHandler<Box<dyn std::error::Error + Send + Sync + 'static>> {
    teloxide::filter_command::<BotCommand, _>()
        .branch(dptree::case![BotCommand::Start].endpoint(cmd_start))
        .branch(dptree::case![BotCommand::Help].endpoint(cmd_help))
        .branch(dptree::case![BotCommand::Status].endpoint(cmd_status))
        .branch(dptree::case![BotCommand::Search].endpoint(cmd_search))
        .branch(dptree::case![BotCommand::Add].endpoint(cmd_add))
        .branch(dptree::case![BotCommand::Delete].endpoint(cmd_delete))
        .branch(dptree::case![BotCommand::Reset].endpoint(cmd_reset))
        .branch(dptree::case![BotCommand::Update].endpoint(cmd_update))
        .branch(dptree::case![BotCommand::Online].endpoint(cmd_online))
        .branch(dptree::case![BotCommand::Server].endpoint(cmd_server))
        .branch(dptree::case![BotCommand::Backup].endpoint(cmd_backup))
        .branch(dptree::case![BotCommand::Broadcast].endpoint(cmd_broadcast))
        .branch(dptree::case![BotCommand::Stats].endpoint(cmd_stats))
}

/// Аргумент админских команд: ссылка, UUID или email.
pub fn parse_ident_arg(arg: &str) -> Option<ClientIdentifier> {
    let arg = arg.trim();
    if arg.is_empty() {
        return None;
    }
    if let Some(ident) = link::extract(arg) {
        return Some(ident);
    }
    if arg.len() == 36 && Uuid::parse_str(arg).is_ok() {
        return Some(ClientIdentifier::Uuid(arg.to_ascii_lowercase()));
    }
    Some(ClientIdentifier::Email(arg.to_string()))
}

async fn cmd_start(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let user_id = match user_id_or_reply(&msg) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(error = %error, "Received /start without sender");
            return Ok(());
        }
    };
    let username = msg.from.as_ref().and_then(|u| u.username.clone());
    let display_name = sender_display_name(&msg);
    tracing::info!(
        user_id,
        username = ?username,
        display_name = ?display_name,
        "Received /start command"
    );
    state
        .db
        .touch_user(user_id, username.as_deref(), display_name.as_deref())
        .await?;

    if state.config.is_admin(user_id) {
        bot.send_message(
            msg.chat.id,
            "Панель администратора. Кнопки ниже или /help для списка команд.",
        )
        .reply_markup(crate::bot::keyboards::admin_menu())
        .await?;
        return Ok(());
    }

    bot.send_message(
        msg.chat.id,
        "Здравствуйте! Пришлите свою ссылку подключения (vless://...) одним сообщением, \
         и я покажу статус вашей подписки: трафик, квоту и срок действия.",
    )
    .reply_markup(crate::bot::keyboards::user_menu())
    .await?;
    Ok(())
}

pub async fn cmd_help(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(user_id) = sender_user_id(&msg) else {
        return Ok(());
    };
    let is_admin = state.config.is_admin(user_id);
    let text = if is_admin {
        r#"Команды:
/status — статус привязанной подписки
/search <ссылка | uuid | email> — найти клиента и открыть карточку
/add <inbound_id> <email> [gb] [days] — создать клиента (0 = безлимит)
/update <uuid> [gb=N] [days=N] [enable=on|off] [ip=N] — изменить клиента
/reset <ссылка | uuid | email> — сбросить счётчики трафика
/delete <uuid> — удалить клиента
/online — клиенты онлайн
/server — состояние сервера панели
/backup — бэкап БД панели файлом
/broadcast — рассылка всем чатам бота
/stats — статистика бота"#
    } else {
        r#"Пришлите свою ссылку подключения (vless://...) одним сообщением — бот найдёт вашу учётку.

/status — статус подписки (после привязки ссылки)
/help — эта справка"#
    };
    let reply_markup = if is_admin {
        crate::bot::keyboards::admin_menu()
    } else {
        crate::bot::keyboards::user_menu()
    };
    bot.send_message(msg.chat.id, text)
        .reply_markup(reply_markup)
        .await?;
    Ok(())
}

async fn cmd_status(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(user_id) = sender_user_id(&msg) else {
        return Ok(());
    };
    tracing::info!(user_id, "Received /status command");
    send_bound_status(&bot, msg.chat.id, user_id, &state).await
}

async fn cmd_search(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }

    let text = msg.text().unwrap_or("");
    let Some(ident) = text
        .split_once(char::is_whitespace)
        .and_then(|(_, rest)| parse_ident_arg(rest))
    else {
        bot.send_message(msg.chat.id, "Использование: /search <ссылка | uuid | email>")
            .await?;
        return Ok(());
    };
    tracing::info!(ident = %ident, "Admin command /search");

    send_admin_client_card(&bot, msg.chat.id, &state, &ident).await
}

async fn cmd_add(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }

    let text = msg.text().unwrap_or("");
    let args: Vec<&str> = text.split_whitespace().skip(1).collect();
    let usage = "Использование: /add <inbound_id> <email> [gb] [days]\n0 в gb/days означает безлимит.";
    let (Some(inbound_arg), Some(email)) = (args.first(), args.get(1)) else {
        bot.send_message(msg.chat.id, usage).await?;
        return Ok(());
    };
    let Ok(inbound_id) = inbound_arg.parse::<i64>() else {
        bot.send_message(msg.chat.id, usage).await?;
        return Ok(());
    };
    let gb = args.get(2).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
    let days = args.get(3).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
    if gb < 0 || days < 0 {
        bot.send_message(msg.chat.id, "gb и days не могут быть отрицательными.")
            .await?;
        return Ok(());
    }
    tracing::info!(inbound_id, email, gb, days, "Admin command /add");

    let opts = AddClientOpts {
        gb,
        days,
        ..AddClientOpts::default()
    };
    match state.mutator.add_client(inbound_id, email, opts).await {
        Ok(uuid) => {
            bot.send_message(
                msg.chat.id,
                format!("✅ Клиент {} создан в inbound {}.\nUUID: {}", email, inbound_id, uuid),
            )
            .await?;
        }
        Err(error) => {
            bot.send_message(msg.chat.id, format!("Не удалось создать клиента: {}", error))
                .await?;
        }
    }
    Ok(())
}

async fn cmd_update(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }

    let text = msg.text().unwrap_or("");
    let args: Vec<&str> = text.split_whitespace().skip(1).collect();
    let usage = "Использование: /update <uuid> [gb=N] [days=N] [enable=on|off] [ip=N]";
    let Some(uuid) = args.first().filter(|v| Uuid::parse_str(v).is_ok()) else {
        bot.send_message(msg.chat.id, usage).await?;
        return Ok(());
    };

    let mut update = ClientUpdate::default();
    for pair in &args[1..] {
        let Some((key, value)) = pair.split_once('=') else {
            bot.send_message(msg.chat.id, usage).await?;
            return Ok(());
        };
        match (key, value) {
            ("gb", value) => update.gb = value.parse::<i64>().ok(),
            ("days", value) => update.days = value.parse::<i64>().ok(),
            ("ip", value) => update.limit_ip = value.parse::<i64>().ok(),
            ("enable", "on" | "true" | "1") => update.enable = Some(true),
            ("enable", "off" | "false" | "0") => update.enable = Some(false),
            _ => {
                bot.send_message(msg.chat.id, usage).await?;
                return Ok(());
            }
        }
    }
    if update.is_empty() {
        bot.send_message(msg.chat.id, usage).await?;
        return Ok(());
    }
    tracing::info!(uuid, update = ?update, "Admin command /update");

    let updated = state.mutator.update_client(uuid, update).await?;
    let reply = if updated {
        "✅ Клиент обновлён."
    } else {
        "Клиент не найден или панель отклонила обновление."
    };
    bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}

async fn cmd_delete(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }

    let text = msg.text().unwrap_or("");
    let Some(uuid) = text
        .split_whitespace()
        .nth(1)
        .filter(|v| Uuid::parse_str(v).is_ok())
    else {
        bot.send_message(msg.chat.id, "Использование: /delete <uuid>")
            .await?;
        return Ok(());
    };
    tracing::info!(uuid, "Admin command /delete");

    // владеющий inbound неизвестен, находим его обходом
    let resolver = ClientResolver::new(state.session.as_ref(), &state.online);
    let ident = ClientIdentifier::Uuid(uuid.to_string());
    let Some((inbound_id, _)) = resolver.backfill_inbound(&ident).await? else {
        bot.send_message(msg.chat.id, "Клиент с таким UUID не найден.")
            .await?;
        return Ok(());
    };

    let deleted = state.mutator.delete_client(uuid, inbound_id).await?;
    let reply = if deleted {
        "🗑 Клиент удалён."
    } else {
        "Клиент уже отсутствует на панели."
    };
    bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}

async fn cmd_reset(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }

    let text = msg.text().unwrap_or("");
    let Some(ident) = text
        .split_once(char::is_whitespace)
        .and_then(|(_, rest)| parse_ident_arg(rest))
    else {
        bot.send_message(msg.chat.id, "Использование: /reset <ссылка | uuid | email>")
            .await?;
        return Ok(());
    };
    tracing::info!(ident = %ident, "Admin command /reset");

    match state.mutator.reset_traffic(&ident, None, None).await {
        Ok(true) => {
            bot.send_message(msg.chat.id, "🔄 Счётчики трафика сброшены.")
                .await?;
        }
        Ok(false) => {
            bot.send_message(msg.chat.id, "Панель отклонила сброс трафика.")
                .await?;
        }
        Err(error) => {
            bot.send_message(msg.chat.id, format!("Сброс не удался: {}", error))
                .await?;
        }
    }
    Ok(())
}

async fn cmd_online(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }
    tracing::info!("Admin command /online");
    send_online_list(&bot, msg.chat.id, &state).await
}

pub async fn send_online_list(bot: &Bot, chat_id: ChatId, state: &BotState) -> HandlerResult {
    let snapshot = state.online.get().await;
    let mut entries: Vec<_> = snapshot.values().collect();
    entries.sort_by(|a, b| a.email.cmp(&b.email));
    bot.send_message(chat_id, render_online_list(&entries))
        .await?;
    Ok(())
}

async fn cmd_server(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }
    tracing::info!("Admin command /server");
    send_server_status(&bot, msg.chat.id, &state).await
}

pub async fn send_server_status(bot: &Bot, chat_id: ChatId, state: &BotState) -> HandlerResult {
    match state.session.server_status().await {
        Ok(status) => {
            bot.send_message(chat_id, render_server_status(&status))
                .reply_markup(crate::bot::keyboards::server_status_keyboard())
                .await?;
        }
        Err(error) => {
            bot.send_message(chat_id, format!("Панель недоступна: {}", error))
                .await?;
        }
    }
    Ok(())
}

async fn cmd_backup(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }
    tracing::info!("Admin command /backup");
    send_panel_backup(&bot, msg.chat.id, &state).await
}

async fn cmd_broadcast(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }
    let Some(admin_id) = sender_user_id(&msg) else {
        return Ok(());
    };
    tracing::info!(admin_id, "Admin command /broadcast");

    // текст рассылки может идти сразу за командой
    if let Some((_, rest)) = msg.text().unwrap_or("").split_once(char::is_whitespace)
        && !rest.trim().is_empty()
    {
        let (sent, failed) = broadcast_text(&bot, &state, rest.trim()).await?;
        bot.send_message(
            msg.chat.id,
            format!("📣 Рассылка завершена: доставлено {}, не доставлено {}.", sent, failed),
        )
        .await?;
        return Ok(());
    }

    mark_awaiting_broadcast(&state, admin_id).await;
    bot.send_message(
        msg.chat.id,
        "Пришлите текст рассылки следующим сообщением.",
    )
    .await?;
    Ok(())
}

async fn cmd_stats(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }
    tracing::info!("Admin command /stats");
    let stats = state.db.stats().await?;
    bot.send_message(msg.chat.id, render_bot_stats(&stats))
        .await?;
    Ok(())
}
