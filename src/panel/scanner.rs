//! Обход inbound'ов панели.
//!
//! Панель не умеет искать клиента по идентификатору, поэтому обход листинга
//! с декодированием settings-блобов — базовый примитив и для резолва,
//! и для мутаций.

use serde_json::Value;

use super::PanelError;
use super::session::PanelApi;
use super::types::{InboundRecord, ObjPayload};

pub struct InboundScanner<'a> {
    api: &'a dyn PanelApi,
}

impl<'a> InboundScanner<'a> {
    pub fn new(api: &'a dyn PanelApi) -> Self {
        Self { api }
    }

    /// Листинг в порядке выдачи панели. Settings каждого элемента
    /// декодируются лениво при выдаче итератора; сбой разбора одного
    /// inbound не прерывает обход, элемент пропускается с предупреждением.
    pub async fn list_inbounds(
        &self,
    ) -> Result<impl Iterator<Item = InboundRecord> + Send, PanelError> {
        let payload = self
            .api
            .get("panel/api/inbounds/list")
            .await?
            .into_payload()?;
        let items = match payload {
            ObjPayload::List(items) => items,
            ObjPayload::Absent => Vec::new(),
            ObjPayload::Object(_) => {
                return Err(PanelError::InvalidResponse(
                    "листинг inbound'ов пришёл объектом".to_string(),
                ));
            }
        };
        Ok(decode_inbounds(items))
    }

    /// Прямое чтение по id, когда полный обход не нужен.
    pub async fn get_inbound(&self, id: i64) -> Result<Option<InboundRecord>, PanelError> {
        let envelope = self
            .api
            .get(&format!("panel/api/inbounds/get/{}", id))
            .await?;
        match envelope.into_payload() {
            Ok(ObjPayload::Object(map)) => {
                InboundRecord::from_value(&Value::Object(map)).map(Some)
            }
            Ok(_) => Ok(None),
            Err(PanelError::RemoteRejected(msg)) => {
                tracing::debug!(inbound_id = id, msg = %msg, "Панель не нашла inbound");
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }
}

/// Ленивое декодирование элементов листинга: settings каждого inbound'а
/// разбирается при выдаче, нечитаемые элементы изолируются.
pub fn decode_inbounds(items: Vec<Value>) -> impl Iterator<Item = InboundRecord> {
    items
        .into_iter()
        .filter_map(|value| match InboundRecord::from_value(&value) {
            Ok(inbound) => Some(inbound),
            Err(error) => {
                tracing::warn!(error = %error, "Пропускаю inbound с нечитаемым settings");
                None
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn corrupt_inbound_is_skipped_not_fatal() {
        let items = vec![
            json!({"id": 1, "protocol": "vless", "port": 443,
                   "settings": "{\"clients\":[{\"id\":\"a\",\"email\":\"a\"}]}"}),
            json!({"id": 2, "protocol": "vless", "port": 444, "settings": "{оборванный json"}),
            json!({"id": 3, "protocol": "vless", "port": 445,
                   "settings": {"clients": [{"id": "c", "email": "c"}]}}),
        ];
        let decoded: Vec<_> = decode_inbounds(items).collect();
        assert_eq!(
            decoded.iter().map(|i| i.id).collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[test]
    fn listing_order_is_preserved() {
        let items = vec![
            json!({"id": 7, "protocol": "vless", "port": 1}),
            json!({"id": 3, "protocol": "vless", "port": 2}),
            json!({"id": 5, "protocol": "vless", "port": 3}),
        ];
        let ids: Vec<_> = decode_inbounds(items).map(|i| i.id).collect();
        assert_eq!(ids, vec![7, 3, 5]);
    }
}
