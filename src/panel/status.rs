//! Нормализация статуса клиента в снапшот для отображения.
//!
//! Чистые преобразования без I/O. Снапшот строится заново на каждый запрос
//! и нигде не кэшируется. Форматирование байтов и остатка срока живёт
//! здесь же: на него опираются несколько обработчиков, и расхождение
//! хотя бы в байт между ними недопустимо.

use std::time::{SystemTime, UNIX_EPOCH};

use super::resolve::ResolvedClient;

// всё, что больше, считаем миллисекундами
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;
const SECS_PER_DAY: i64 = 86_400;
const SECS_PER_HOUR: i64 = 3_600;

/// Состояние срока действия.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryState {
    Never,
    Expired,
    ExpiresIn { seconds: i64 },
}

/// Неизменяемая проекция состояния клиента на момент запроса.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub email: String,
    pub uuid: Option<String>,
    pub enabled: bool,
    pub online: bool,
    pub up: i64,
    pub down: i64,
    pub total_used: i64,
    /// `None` — безлимит.
    pub quota: Option<i64>,
    pub usage_percent: f64,
    pub expiry: ExpiryState,
    /// Unix-секунды последней активности, если панель их отдала.
    pub last_seen: Option<i64>,
}

pub fn build(resolved: &ResolvedClient) -> StatusSnapshot {
    build_at(resolved, now_unix())
}

/// Версия с внешним «сейчас» (unix-секунды) для детерминированных тестов.
pub fn build_at(resolved: &ResolvedClient, now: i64) -> StatusSnapshot {
    let client = resolved.client.as_ref();
    let traffic = resolved.traffic.as_ref();

    let email = resolved.email().unwrap_or_default().to_string();
    let uuid = resolved.uuid().map(str::to_string);
    let enabled = client
        .map(|c| c.enable)
        .or_else(|| traffic.map(|t| t.enable))
        .unwrap_or(true);

    let up = traffic.map(|t| t.up).unwrap_or(0).max(0);
    let down = traffic.map(|t| t.down).unwrap_or(0).max(0);
    let total_used = up + down;

    // каноническое представление безлимита — ноль
    let quota_raw = traffic
        .map(|t| t.total)
        .filter(|total| *total > 0)
        .or_else(|| client.map(|c| c.total_gb))
        .unwrap_or(0);
    let quota = (quota_raw > 0).then_some(quota_raw);
    let usage_percent = quota
        .map(|q| (total_used as f64 / q as f64) * 100.0)
        .unwrap_or(0.0);

    let expiry_raw = client
        .map(|c| c.expiry_time)
        .filter(|expiry| *expiry != 0)
        .or_else(|| traffic.map(|t| t.expiry_time))
        .unwrap_or(0);

    StatusSnapshot {
        email,
        uuid,
        enabled,
        online: resolved.online,
        up,
        down,
        total_used,
        quota,
        usage_percent,
        expiry: expiry_state(expiry_raw, now),
        last_seen: resolved.last_seen.and_then(normalize_timestamp),
    }
}

/// Метки больше 10^12 — миллисекунды, меньшие положительные — секунды,
/// ноль и отрицательные — «не задано».
pub fn normalize_timestamp(value: i64) -> Option<i64> {
    if value <= 0 {
        None
    } else if value > MILLIS_THRESHOLD {
        Some(value / 1000)
    } else {
        Some(value)
    }
}

pub fn expiry_state(expiry: i64, now: i64) -> ExpiryState {
    match normalize_timestamp(expiry) {
        None => ExpiryState::Never,
        Some(ts) if ts < now => ExpiryState::Expired,
        Some(ts) => ExpiryState::ExpiresIn { seconds: ts - now },
    }
}

/// Наибольшая единица, в которой значение меньше 1024; два знака после
/// запятой. Для значений от терабайта и выше — всегда TB.
pub fn format_size(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes.max(0) as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Остаток срока: дни при >= 24 ч, иначе часы, иначе минуты.
pub fn format_remaining(seconds: i64) -> String {
    if seconds >= SECS_PER_DAY {
        format!("{} дн.", seconds / SECS_PER_DAY)
    } else if seconds >= SECS_PER_HOUR {
        format!("{} ч.", seconds / SECS_PER_HOUR)
    } else {
        format!("{} мин.", (seconds / 60).max(1))
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::types::{ClientRecord, ClientTraffic};
    use serde_json::json;

    fn resolved(client: Option<ClientRecord>, traffic: Option<ClientTraffic>) -> ResolvedClient {
        ResolvedClient {
            inbound_id: Some(1),
            client,
            traffic,
            online: false,
            last_seen: None,
        }
    }

    fn client(total_gb: i64, expiry_time: i64) -> ClientRecord {
        serde_json::from_value(json!({
            "id": "aaaaaaaa-0000-0000-0000-000000000001",
            "email": "user1",
            "totalGB": total_gb,
            "expiryTime": expiry_time
        }))
        .unwrap()
    }

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn size_picks_largest_unit_below_1024() {
        assert_eq!(format_size(0), "0.00 B");
        assert_eq!(format_size(1023), "1023.00 B");
        assert_eq!(format_size(1024), "1.00 KB");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(1024 * 1024), "1.00 MB");
        assert_eq!(format_size(10 * 1024 * 1024 * 1024), "10.00 GB");
        assert_eq!(format_size(1024_i64.pow(4)), "1.00 TB");
        // выше терабайта единица не растёт
        assert_eq!(format_size(2048 * 1024_i64.pow(4)), "2048.00 TB");
    }

    #[test]
    fn timestamps_normalize_by_magnitude() {
        assert_eq!(normalize_timestamp(0), None);
        assert_eq!(normalize_timestamp(-5), None);
        assert_eq!(normalize_timestamp(1_700_000_000), Some(1_700_000_000));
        assert_eq!(normalize_timestamp(1_700_000_000_000), Some(1_700_000_000));
    }

    #[test]
    fn expiry_tristate() {
        assert_eq!(expiry_state(0, NOW), ExpiryState::Never);
        assert_eq!(expiry_state((NOW - 10) * 1000, NOW), ExpiryState::Expired);
        assert_eq!(
            expiry_state((NOW + 3 * SECS_PER_DAY) * 1000, NOW),
            ExpiryState::ExpiresIn {
                seconds: 3 * SECS_PER_DAY
            }
        );
        // секунды без миллисекунд тоже принимаются
        assert_eq!(expiry_state(NOW - 1, NOW), ExpiryState::Expired);
    }

    #[test]
    fn remaining_granularity_day_hour_minute() {
        assert_eq!(format_remaining(30 * SECS_PER_DAY), "30 дн.");
        assert_eq!(format_remaining(SECS_PER_DAY), "1 дн.");
        assert_eq!(format_remaining(SECS_PER_DAY - 1), "23 ч.");
        assert_eq!(format_remaining(2 * SECS_PER_HOUR + 59), "2 ч.");
        assert_eq!(format_remaining(59 * 60), "59 мин.");
        assert_eq!(format_remaining(30), "1 мин.");
    }

    #[test]
    fn zero_quota_means_unlimited() {
        let snapshot = build_at(&resolved(Some(client(0, 0)), None), NOW);
        assert_eq!(snapshot.quota, None);
        assert_eq!(snapshot.usage_percent, 0.0);
        assert_eq!(snapshot.expiry, ExpiryState::Never);
    }

    #[test]
    fn usage_percent_only_with_quota() {
        let traffic: ClientTraffic = serde_json::from_value(json!({
            "email": "user1",
            "up": 256,
            "down": 256,
            "total": 1024,
            "expiryTime": 0
        }))
        .unwrap();
        let snapshot = build_at(&resolved(None, Some(traffic)), NOW);
        assert_eq!(snapshot.total_used, 512);
        assert_eq!(snapshot.quota, Some(1024));
        assert!((snapshot.usage_percent - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn client_fields_win_over_missing_traffic() {
        let snapshot = build_at(
            &resolved(Some(client(10 * 1024 * 1024 * 1024, (NOW + 100) * 1000)), None),
            NOW,
        );
        assert_eq!(snapshot.quota, Some(10 * 1024 * 1024 * 1024));
        assert_eq!(snapshot.expiry, ExpiryState::ExpiresIn { seconds: 100 });
        assert_eq!(snapshot.email, "user1");
        assert!(snapshot.enabled);
    }
}
