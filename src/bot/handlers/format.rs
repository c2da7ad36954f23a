use crate::db::BotStats;
use crate::panel::status::{ExpiryState, StatusSnapshot, format_remaining, format_size};
use crate::panel::types::OnlineClientEntry;
use chrono::{DateTime, Local, Utc};
use serde_json::Value;

pub fn format_timestamp(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| {
            dt.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S %:z")
                .to_string()
        })
        .unwrap_or_else(|| format!("Некорректный timestamp: {}", ts))
}

/// Текст статуса клиента. Единственное место, где снапшот превращается
/// в сообщение: и пользовательский, и админский ответ собираются здесь.
pub fn render_snapshot(snapshot: &StatusSnapshot) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "👤 {}",
        if snapshot.email.is_empty() {
            "(без email)"
        } else {
            &snapshot.email
        }
    ));
    lines.push(format!(
        "Состояние: {}",
        if snapshot.enabled {
            "✅ включен"
        } else {
            "⛔ выключен"
        }
    ));
    lines.push(format!(
        "Сейчас: {}",
        if snapshot.online {
            "🟢 онлайн"
        } else {
            "⚪ не в сети"
        }
    ));
    lines.push(format!("⬆ Отдано: {}", format_size(snapshot.up)));
    lines.push(format!("⬇ Принято: {}", format_size(snapshot.down)));
    lines.push(format!("Всего: {}", format_size(snapshot.total_used)));
    match snapshot.quota {
        Some(quota) => lines.push(format!(
            "Квота: {} ({:.0}%)",
            format_size(quota),
            snapshot.usage_percent
        )),
        None => lines.push("Квота: безлимит".to_string()),
    }
    match &snapshot.expiry {
        ExpiryState::Never => lines.push("Срок: бессрочно".to_string()),
        ExpiryState::Expired => lines.push("Срок: ⛔ истёк".to_string()),
        ExpiryState::ExpiresIn { seconds } => {
            lines.push(format!("Срок: осталось {}", format_remaining(*seconds)));
        }
    }
    if let Some(last_seen) = snapshot.last_seen {
        lines.push(format!("Активность: {}", format_timestamp(last_seen)));
    }
    lines.join("\n")
}

pub fn render_online_list(entries: &[&OnlineClientEntry]) -> String {
    if entries.is_empty() {
        return "Сейчас нет клиентов онлайн.".to_string();
    }
    let mut lines = vec![format!("🟢 Онлайн: {}", entries.len())];
    for entry in entries {
        let mut line = format!("• {}", entry.email);
        if let Some(ip) = &entry.ip {
            line.push_str(&format!(" ({})", ip));
        }
        lines.push(line);
    }
    lines.join("\n")
}

/// Сводка server/status панели. Поля динамические, берём известные
/// и не падаем на отсутствующих.
pub fn render_server_status(status: &serde_json::Map<String, Value>) -> String {
    let mut lines = vec!["🖥 Сервер панели".to_string()];
    if let Some(cpu) = status.get("cpu").and_then(Value::as_f64) {
        lines.push(format!("CPU: {:.1}%", cpu));
    }
    if let Some(mem) = status.get("mem").and_then(Value::as_object) {
        let current = mem.get("current").and_then(Value::as_i64).unwrap_or(0);
        let total = mem.get("total").and_then(Value::as_i64).unwrap_or(0);
        lines.push(format!(
            "Память: {} / {}",
            format_size(current),
            format_size(total)
        ));
    }
    if let Some(uptime) = status.get("uptime").and_then(Value::as_i64) {
        lines.push(format!("Аптайм: {}", format_remaining(uptime)));
    }
    if let Some(net) = status.get("netTraffic").and_then(Value::as_object) {
        let sent = net.get("sent").and_then(Value::as_i64).unwrap_or(0);
        let recv = net.get("recv").and_then(Value::as_i64).unwrap_or(0);
        lines.push(format!(
            "Трафик: ⬆ {} ⬇ {}",
            format_size(sent),
            format_size(recv)
        ));
    }
    if lines.len() == 1 {
        lines.push("Панель не вернула знакомых полей.".to_string());
    }
    lines.join("\n")
}

pub fn render_bot_stats(stats: &BotStats) -> String {
    format!(
        "📊 Статистика бота:\n\
         Всего пользователей: {}\n\
         С привязкой к клиенту: {}\n\
         Активны за сутки: {}",
        stats.total, stats.bound, stats.seen_today
    )
}

pub fn usage_guide_text() -> &'static str {
    r#"Как проверить статус подписки:

1) Откройте свою ссылку подключения (vless://...) в приложении или в письме от администратора.
2) Пришлите её сюда одним сообщением — бот найдёт вашу учётку и покажет трафик и срок действия.
3) Дальше хватит кнопки «📊 Мой статус»: ссылка запомнена.

Если бот отвечает «не найдено», проверьте ссылку или обратитесь к администратору."#
}
