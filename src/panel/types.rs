//! Типы данных панели и нормализация её JSON-конвертов.
//!
//! Панель заворачивает ответы в `{success, msg, obj}`, причём `obj` иногда
//! приходит JSON-строкой, закодированной вторым слоем. То же с полем
//! `settings` у inbound'а: то строка, то уже объект. Вся развёртка собрана
//! здесь, остальной код работает только с разобранными структурами.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::PanelError;

/// Конверт ответа панели.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub obj: Option<Value>,
}

/// Нормализованное содержимое `obj`.
#[derive(Debug)]
pub enum ObjPayload {
    List(Vec<Value>),
    Object(serde_json::Map<String, Value>),
    Absent,
}

impl ApiEnvelope {
    /// Проверяет `success` и снимает двойную кодировку `obj`.
    pub fn into_payload(self) -> Result<ObjPayload, PanelError> {
        if !self.success {
            let msg = if self.msg.trim().is_empty() {
                "без описания".to_string()
            } else {
                self.msg
            };
            return Err(PanelError::RemoteRejected(msg));
        }
        normalize_obj(self.obj)
    }
}

/// Если `obj` — строка, декодирует её как JSON ровно один раз.
pub fn normalize_obj(obj: Option<Value>) -> Result<ObjPayload, PanelError> {
    let value = match obj {
        None | Some(Value::Null) => return Ok(ObjPayload::Absent),
        Some(Value::String(raw)) => {
            if raw.trim().is_empty() {
                return Ok(ObjPayload::Absent);
            }
            serde_json::from_str::<Value>(&raw).map_err(|error| {
                PanelError::InvalidResponse(format!("строковый obj не является JSON: {}", error))
            })?
        }
        Some(other) => other,
    };

    match value {
        Value::Array(items) => Ok(ObjPayload::List(items)),
        Value::Object(map) => Ok(ObjPayload::Object(map)),
        Value::Null => Ok(ObjPayload::Absent),
        other => Err(PanelError::InvalidResponse(format!(
            "неожиданный тип obj: {}",
            other
        ))),
    }
}

fn default_enable() -> bool {
    true
}

/// Запись клиента внутри settings-блоба inbound'а.
///
/// Неизвестные поля (flow, fingerprint и прочее, что панель добавляет от
/// версии к версии) складываются в `extra` и при записи назад уходят как были.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(rename = "totalGB", default)]
    pub total_gb: i64,
    #[serde(rename = "expiryTime", default)]
    pub expiry_time: i64,
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(rename = "limitIp", default)]
    pub limit_ip: i64,
    // панель хранит tgId то числом, то строкой
    #[serde(rename = "tgId", default)]
    pub tg_id: Value,
    #[serde(rename = "subId", default)]
    pub sub_id: String,
    #[serde(default)]
    pub reset: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ClientRecord {
    pub fn tg_id_i64(&self) -> Option<i64> {
        match &self.tg_id {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Разобранный settings-блоб. `extra` сохраняет ключи помимо `clients`
/// (decryption, fallbacks), чтобы write-back не терял полей.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundSettings {
    #[serde(default)]
    pub clients: Vec<ClientRecord>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Один inbound панели с уже декодированным settings.
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub id: i64,
    pub remark: String,
    pub protocol: String,
    pub port: u16,
    pub settings: InboundSettings,
}

impl InboundRecord {
    /// Разбирает элемент листинга. `settings` декодируется ровно один раз.
    pub fn from_value(value: &Value) -> Result<Self, PanelError> {
        let obj = value.as_object().ok_or_else(|| {
            PanelError::InvalidResponse("inbound не является объектом".to_string())
        })?;
        let id = obj
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| PanelError::InvalidResponse("inbound без числового id".to_string()))?;
        let remark = obj
            .get("remark")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let protocol = obj
            .get("protocol")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let port = obj.get("port").and_then(Value::as_u64).unwrap_or(0) as u16;
        let settings = decode_settings(obj.get("settings"))?;
        Ok(Self {
            id,
            remark,
            protocol,
            port,
            settings,
        })
    }
}

/// `settings` приходит строкой или объектом; оба варианта приводятся
/// к [`InboundSettings`].
pub fn decode_settings(value: Option<&Value>) -> Result<InboundSettings, PanelError> {
    match value {
        None | Some(Value::Null) => Ok(InboundSettings::default()),
        Some(Value::String(raw)) => serde_json::from_str(raw).map_err(|error| {
            PanelError::InvalidResponse(format!("settings-строка не разбирается: {}", error))
        }),
        Some(other) => serde_json::from_value(other.clone()).map_err(|error| {
            PanelError::InvalidResponse(format!("settings-объект не разбирается: {}", error))
        }),
    }
}

/// Кодирует settings обратно в строку для тела мутации. Выполняется один раз
/// на запись, чтобы не плодить вложенную кодировку.
pub fn encode_settings(settings: &InboundSettings) -> Result<String, PanelError> {
    serde_json::to_string(settings)
        .map_err(|error| PanelError::InvalidResponse(format!("settings не сериализуется: {}", error)))
}

/// Счётчики трафика клиента из clientStats панели. Авторитетные значения
/// живут на стороне панели, здесь только последнее наблюдение.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientTraffic {
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(default)]
    pub up: i64,
    #[serde(default)]
    pub down: i64,
    #[serde(default)]
    pub total: i64,
    #[serde(rename = "expiryTime", default)]
    pub expiry_time: i64,
}

impl ClientTraffic {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Эфемерная запись онлайн-листинга. Живёт только внутри кэша и не
/// переживает его обновление.
#[derive(Debug, Clone, Default)]
pub struct OnlineClientEntry {
    pub email: String,
    pub up: i64,
    pub down: i64,
    pub ip: Option<String>,
    pub last_seen: Option<i64>,
}

impl OnlineClientEntry {
    /// Панель отдаёт элементы то голыми email-строками, то объектами.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(email) if !email.trim().is_empty() => Some(Self {
                email: email.trim().to_string(),
                ..Self::default()
            }),
            Value::Object(map) => {
                let email = map.get("email").and_then(Value::as_str)?.trim();
                if email.is_empty() {
                    return None;
                }
                Some(Self {
                    email: email.to_string(),
                    up: map.get("up").and_then(Value::as_i64).unwrap_or(0),
                    down: map.get("down").and_then(Value::as_i64).unwrap_or(0),
                    ip: map
                        .get("ip")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    last_seen: map.get("lastSeen").and_then(Value::as_i64),
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_failure_carries_message() {
        let envelope = ApiEnvelope {
            success: false,
            msg: "client not found".to_string(),
            obj: None,
        };
        match envelope.into_payload() {
            Err(PanelError::RemoteRejected(msg)) => assert_eq!(msg, "client not found"),
            other => panic!("ожидался RemoteRejected, получено {:?}", other),
        }
    }

    #[test]
    fn obj_string_is_decoded_once() {
        let obj = Some(json!("[{\"email\":\"a\"},{\"email\":\"b\"}]"));
        match normalize_obj(obj) {
            Ok(ObjPayload::List(items)) => assert_eq!(items.len(), 2),
            other => panic!("ожидался List, получено {:?}", other),
        }
    }

    #[test]
    fn obj_garbage_string_is_invalid_response() {
        let obj = Some(json!("не json вовсе"));
        assert!(matches!(
            normalize_obj(obj),
            Err(PanelError::InvalidResponse(_))
        ));
    }

    #[test]
    fn obj_null_and_empty_string_are_absent() {
        assert!(matches!(normalize_obj(None), Ok(ObjPayload::Absent)));
        assert!(matches!(
            normalize_obj(Some(Value::Null)),
            Ok(ObjPayload::Absent)
        ));
        assert!(matches!(
            normalize_obj(Some(json!("  "))),
            Ok(ObjPayload::Absent)
        ));
    }

    #[test]
    fn settings_decodes_from_string_and_object() {
        let as_string = json!({
            "id": 3,
            "protocol": "vless",
            "port": 443,
            "settings": "{\"clients\":[{\"id\":\"u-1\",\"email\":\"user1\"}],\"decryption\":\"none\"}"
        });
        let inbound = InboundRecord::from_value(&as_string).unwrap();
        assert_eq!(inbound.id, 3);
        assert_eq!(inbound.settings.clients.len(), 1);
        assert_eq!(inbound.settings.clients[0].email, "user1");
        assert!(inbound.settings.extra.contains_key("decryption"));

        let as_object = json!({
            "id": 4,
            "protocol": "vless",
            "port": 8443,
            "settings": {"clients": [{"id": "u-2", "email": "user2"}]}
        });
        let inbound = InboundRecord::from_value(&as_object).unwrap();
        assert_eq!(inbound.settings.clients[0].email, "user2");
    }

    #[test]
    fn settings_roundtrip_preserves_unknown_fields() {
        let raw = json!({
            "clients": [{
                "id": "u-1",
                "email": "user1",
                "totalGB": 1024,
                "flow": "xtls-rprx-vision"
            }],
            "decryption": "none",
            "fallbacks": []
        });
        let settings = decode_settings(Some(&raw)).unwrap();
        let encoded = encode_settings(&settings).unwrap();
        let reparsed: Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(reparsed["decryption"], "none");
        assert_eq!(reparsed["clients"][0]["flow"], "xtls-rprx-vision");
        assert_eq!(reparsed["clients"][0]["totalGB"], 1024);
    }

    #[test]
    fn client_enable_defaults_to_true() {
        let settings =
            decode_settings(Some(&json!({"clients": [{"id": "u", "email": "e"}]}))).unwrap();
        assert!(settings.clients[0].enable);
    }

    #[test]
    fn tg_id_accepts_number_and_string() {
        let settings = decode_settings(Some(&json!({
            "clients": [
                {"id": "a", "email": "a", "tgId": 123},
                {"id": "b", "email": "b", "tgId": "456"},
                {"id": "c", "email": "c", "tgId": ""}
            ]
        })))
        .unwrap();
        assert_eq!(settings.clients[0].tg_id_i64(), Some(123));
        assert_eq!(settings.clients[1].tg_id_i64(), Some(456));
        assert_eq!(settings.clients[2].tg_id_i64(), None);
    }

    #[test]
    fn online_entry_from_string_and_object() {
        assert_eq!(
            OnlineClientEntry::from_value(&json!("user1")).unwrap().email,
            "user1"
        );
        let entry = OnlineClientEntry::from_value(&json!({
            "email": "user2",
            "up": 10,
            "down": 20,
            "ip": "10.0.0.1",
            "lastSeen": 1700000000
        }))
        .unwrap();
        assert_eq!(entry.email, "user2");
        assert_eq!(entry.down, 20);
        assert_eq!(entry.ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(entry.last_seen, Some(1_700_000_000));
        assert!(OnlineClientEntry::from_value(&json!(42)).is_none());
        assert!(OnlineClientEntry::from_value(&json!("")).is_none());
    }
}
