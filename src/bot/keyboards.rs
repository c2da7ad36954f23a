//! Клавиатуры бота: inline и постоянные reply-кнопки.

use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, KeyboardButton, KeyboardMarkup};

pub const BTN_USER_STATUS: &str = "📊 Мой статус";
pub const BTN_USER_GUIDE: &str = "❓ Инструкция";

pub const BTN_ADMIN_ONLINE: &str = "🟢 Онлайн";
pub const BTN_ADMIN_SERVER: &str = "🖥 Сервер";
pub const BTN_ADMIN_STATS: &str = "📊 Статистика";
pub const BTN_ADMIN_BACKUP: &str = "💾 Бэкап";
pub const BTN_ADMIN_BROADCAST: &str = "📣 Рассылка";

pub fn user_menu() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![vec![
        KeyboardButton::new(BTN_USER_STATUS),
        KeyboardButton::new(BTN_USER_GUIDE),
    ]])
    .resize_keyboard()
    .persistent()
}

pub fn admin_menu() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![
        vec![
            KeyboardButton::new(BTN_ADMIN_ONLINE),
            KeyboardButton::new(BTN_ADMIN_SERVER),
        ],
        vec![
            KeyboardButton::new(BTN_ADMIN_STATS),
            KeyboardButton::new(BTN_ADMIN_BACKUP),
        ],
        vec![KeyboardButton::new(BTN_ADMIN_BROADCAST)],
    ])
    .resize_keyboard()
    .persistent()
}

/// Кнопки карточки клиента. Email в callback-данных передаётся как есть:
/// панель не допускает в нём пробелов и двоеточий.
pub fn client_card_keyboard(
    inbound_id: i64,
    uuid: &str,
    email: &str,
    enabled: bool,
) -> InlineKeyboardMarkup {
    let toggle = if enabled {
        InlineKeyboardButton::callback("⛔ Выключить", format!("cen:{}:{}:0", inbound_id, uuid))
    } else {
        InlineKeyboardButton::callback("✅ Включить", format!("cen:{}:{}:1", inbound_id, uuid))
    };
    InlineKeyboardMarkup::default()
        .append_row(vec![
            InlineKeyboardButton::callback(
                "🔄 Сбросить трафик",
                format!("crst:{}:{}", inbound_id, email),
            ),
            toggle,
        ])
        .append_row(vec![InlineKeyboardButton::callback(
            "🗑 Удалить клиента",
            format!("cdel:{}:{}", inbound_id, uuid),
        )])
}

pub fn server_status_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::default().append_row(vec![InlineKeyboardButton::callback(
        "🔄 Обновить",
        "srv:refresh",
    )])
}
