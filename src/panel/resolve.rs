//! Резолв клиента по идентификатору.
//!
//! У панели нет поиска по идентификатору, поэтому стратегии выстроены явной
//! цепочкой от дешёвой к дорогой; выигрывает первая удачная:
//! известный inbound → traffic-эндпоинт → полный обход листинга.

use super::PanelError;
use super::online::OnlineClientCache;
use super::scanner::InboundScanner;
use super::session::PanelApi;
use super::types::{ClientRecord, ClientTraffic, ObjPayload};
use crate::link::ClientIdentifier;

/// Результат резолва: владеющий inbound (если известен), запись из settings
/// (если найдена обходом) и последние счётчики трафика.
#[derive(Debug, Clone)]
pub struct ResolvedClient {
    pub inbound_id: Option<i64>,
    pub client: Option<ClientRecord>,
    pub traffic: Option<ClientTraffic>,
    pub online: bool,
    pub last_seen: Option<i64>,
}

impl ResolvedClient {
    pub fn email(&self) -> Option<&str> {
        self.client
            .as_ref()
            .map(|c| c.email.as_str())
            .or_else(|| self.traffic.as_ref().map(|t| t.email.as_str()))
            .filter(|email| !email.is_empty())
    }

    pub fn uuid(&self) -> Option<&str> {
        self.client
            .as_ref()
            .map(|c| c.id.as_str())
            .filter(|id| !id.is_empty())
    }
}

/// Поиск записи в списке клиентов: UUID сравнивается без учёта регистра,
/// email — точно. Первое совпадение побеждает.
pub fn find_client<'a>(
    clients: &'a [ClientRecord],
    ident: &ClientIdentifier,
) -> Option<&'a ClientRecord> {
    clients.iter().find(|client| match ident {
        ClientIdentifier::Uuid(uuid) => client.id.eq_ignore_ascii_case(uuid),
        ClientIdentifier::Email(email) => client.email == *email,
    })
}

pub struct ClientResolver<'a> {
    api: &'a dyn PanelApi,
    online: &'a OnlineClientCache,
}

impl<'a> ClientResolver<'a> {
    pub fn new(api: &'a dyn PanelApi, online: &'a OnlineClientCache) -> Self {
        Self { api, online }
    }

    /// «Не найдено» — это `Ok(None)`, а не ошибка: вызывающий обязан уметь
    /// отличать его от недоступной панели.
    pub async fn resolve(
        &self,
        ident: &ClientIdentifier,
        known_inbound: Option<i64>,
    ) -> Result<Option<ResolvedClient>, PanelError> {
        let scanner = InboundScanner::new(self.api);

        // 1. известный inbound: ищем только в его списке
        if let Some(inbound_id) = known_inbound
            && let Some(inbound) = scanner.get_inbound(inbound_id).await?
            && let Some(client) = find_client(&inbound.settings.clients, ident)
        {
            let client = client.clone();
            let traffic = self.fetch_traffic_best_effort(ident).await;
            return Ok(Some(
                self.assemble(Some(inbound_id), Some(client), traffic).await,
            ));
        }

        // 2. traffic-эндпоинт — ближайшее к индексному поиску, что есть у
        //    панели; владеющий inbound при этом остаётся неизвестным
        if let Some(traffic) = self.fetch_traffic(ident).await? {
            return Ok(Some(self.assemble(None, None, Some(traffic)).await));
        }

        // 3. полный обход в порядке листинга панели
        for inbound in scanner.list_inbounds().await? {
            if let Some(client) = find_client(&inbound.settings.clients, ident) {
                let client = client.clone();
                let traffic = self.fetch_traffic_best_effort(ident).await;
                return Ok(Some(
                    self.assemble(Some(inbound.id), Some(client), traffic).await,
                ));
            }
        }

        Ok(None)
    }

    /// Дорезолвливает владеющий inbound полным обходом; нужен мутациям,
    /// когда клиент найден только через traffic-эндпоинт.
    pub async fn backfill_inbound(
        &self,
        ident: &ClientIdentifier,
    ) -> Result<Option<(i64, ClientRecord)>, PanelError> {
        let scanner = InboundScanner::new(self.api);
        for inbound in scanner.list_inbounds().await? {
            if let Some(client) = find_client(&inbound.settings.clients, ident) {
                return Ok(Some((inbound.id, client.clone())));
            }
        }
        Ok(None)
    }

    async fn assemble(
        &self,
        inbound_id: Option<i64>,
        client: Option<ClientRecord>,
        traffic: Option<ClientTraffic>,
    ) -> ResolvedClient {
        let mut resolved = ResolvedClient {
            inbound_id,
            client,
            traffic,
            online: false,
            last_seen: None,
        };
        if let Some(email) = resolved.email() {
            let snapshot = self.online.get().await;
            if let Some(entry) = snapshot.get(email) {
                resolved.online = true;
                resolved.last_seen = entry.last_seen;
            }
        }
        resolved
    }

    async fn fetch_traffic(
        &self,
        ident: &ClientIdentifier,
    ) -> Result<Option<ClientTraffic>, PanelError> {
        let path = match ident {
            ClientIdentifier::Uuid(uuid) => {
                format!("panel/api/inbounds/getClientTrafficsById/{}", uuid)
            }
            ClientIdentifier::Email(email) => format!(
                "panel/api/inbounds/getClientTraffics/{}",
                urlencoding::encode(email)
            ),
        };

        let payload = match self.api.get(&path).await?.into_payload() {
            Ok(payload) => payload,
            // success=false здесь означает «не найдено», это не сбой
            Err(PanelError::RemoteRejected(msg)) => {
                tracing::debug!(ident = %ident, msg = %msg, "Traffic-эндпоинт не нашёл клиента");
                return Ok(None);
            }
            Err(error) => return Err(error),
        };

        Ok(match payload {
            ObjPayload::Object(map) => {
                ClientTraffic::from_value(&serde_json::Value::Object(map))
            }
            // поиск по UUID отвечает списком
            ObjPayload::List(items) => items.first().and_then(ClientTraffic::from_value),
            ObjPayload::Absent => None,
        })
    }

    // обогащение статуса счётчиками не должно ронять уже удавшийся резолв
    async fn fetch_traffic_best_effort(&self, ident: &ClientIdentifier) -> Option<ClientTraffic> {
        match self.fetch_traffic(ident).await {
            Ok(traffic) => traffic,
            Err(error) => {
                tracing::debug!(ident = %ident, error = %error, "Счётчики трафика недоступны");
                None
            }
        }
    }
}
