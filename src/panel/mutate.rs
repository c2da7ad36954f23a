//! Мутации клиентов панели.
//!
//! Панель не умеет частичных обновлений: каждая операция — это
//! read-modify-write settings-блоба владеющего inbound'а. Параллельные
//! перезаписи одного блоба теряют чужие изменения, поэтому все мутации
//! одного inbound сериализуются через реестр асинхронных замков.
//! Вызывающие не собирают payload'ы сами — инвариант «один inbound, один
//! блоб, один круг» закрыт внутри этого модуля.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::distr::{Alphanumeric, SampleString};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::PanelError;
use super::resolve::find_client;
use super::scanner::InboundScanner;
use super::session::PanelApi;
use super::types::{ClientRecord, InboundSettings, encode_settings};
use crate::link::ClientIdentifier;

pub const BYTES_PER_GB: i64 = 1024 * 1024 * 1024;
const MS_PER_DAY: i64 = 86_400_000;
const SUB_ID_LEN: usize = 16;

/// Реестр замков по id inbound'а.
#[derive(Default)]
pub struct InboundLocks {
    inner: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl InboundLocks {
    /// Возвращает замок данного inbound'а; держатель guard'а монопольно
    /// владеет его settings-блобом на время read-modify-write.
    pub async fn lock_for(&self, inbound_id: i64) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().await;
        map.entry(inbound_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Параметры нового клиента. Нули в `gb`/`days` означают безлимит.
#[derive(Debug, Clone, Default)]
pub struct AddClientOpts {
    pub gb: i64,
    pub days: i64,
    pub limit_ip: i64,
    pub tg_id: Option<i64>,
    pub uuid: Option<String>,
    pub sub_id: Option<String>,
}

/// Частичное обновление: применяются только заданные поля.
#[derive(Debug, Clone, Default)]
pub struct ClientUpdate {
    pub gb: Option<i64>,
    pub days: Option<i64>,
    pub enable: Option<bool>,
    pub limit_ip: Option<i64>,
}

impl ClientUpdate {
    pub fn is_empty(&self) -> bool {
        self.gb.is_none() && self.days.is_none() && self.enable.is_none() && self.limit_ip.is_none()
    }
}

pub struct ClientMutator {
    api: Arc<dyn PanelApi>,
    locks: InboundLocks,
}

impl ClientMutator {
    pub fn new(api: Arc<dyn PanelApi>) -> Self {
        Self {
            api,
            locks: InboundLocks::default(),
        }
    }

    /// Добавляет клиента в inbound. Существующий клиент с тем же email
    /// предварительно удаляется — семантика замены, не отказа.
    /// Возвращает UUID созданного клиента.
    pub async fn add_client(
        &self,
        inbound_id: i64,
        email: &str,
        opts: AddClientOpts,
    ) -> Result<String, PanelError> {
        let email = email.trim();
        if email.is_empty() {
            return Err(PanelError::RemoteRejected(
                "email нового клиента пуст".to_string(),
            ));
        }

        let lock = self.locks.lock_for(inbound_id).await;
        let _guard = lock.lock().await;

        let scanner = InboundScanner::new(self.api.as_ref());
        let inbound = scanner.get_inbound(inbound_id).await?.ok_or_else(|| {
            PanelError::RemoteRejected(format!("inbound {} не найден", inbound_id))
        })?;

        if let Some(existing) = inbound
            .settings
            .clients
            .iter()
            .find(|client| client.email == email)
        {
            let existing_id = existing.id.clone();
            tracing::info!(
                inbound_id,
                email,
                old_uuid = %existing_id,
                "Клиент с таким email уже есть, заменяю"
            );
            self.del_client_raw(inbound_id, &existing_id).await?;
        }

        let client = new_client_record(email, &opts, now_unix_ms());
        let uuid = client.id.clone();
        let settings = InboundSettings {
            clients: vec![client],
            extra: Default::default(),
        };
        let body = json!({
            "id": inbound_id,
            "settings": encode_settings(&settings)?,
        });
        self.api
            .post("panel/api/inbounds/addClient", Some(&body))
            .await?
            .into_payload()?;

        tracing::info!(inbound_id, email, uuid = %uuid, "Клиент добавлен");
        Ok(uuid)
    }

    /// Обновляет заданные поля клиента, остальное остаётся как было.
    /// `false` — клиент не найден или панель отказала по существу.
    pub async fn update_client(
        &self,
        uuid: &str,
        update: ClientUpdate,
    ) -> Result<bool, PanelError> {
        if update.is_empty() {
            return Ok(false);
        }
        let ident = ClientIdentifier::Uuid(uuid.to_string());
        let Some((inbound_id, _)) = self.locate(&ident).await? else {
            return Ok(false);
        };

        let lock = self.locks.lock_for(inbound_id).await;
        let _guard = lock.lock().await;

        // перечитываем под замком: мерджить нужно свежую запись
        let scanner = InboundScanner::new(self.api.as_ref());
        let Some(inbound) = scanner.get_inbound(inbound_id).await? else {
            return Ok(false);
        };
        let Some(current) = find_client(&inbound.settings.clients, &ident) else {
            return Ok(false);
        };

        let merged = apply_update(current.clone(), &update, now_unix_ms());
        let settings = InboundSettings {
            clients: vec![merged],
            extra: Default::default(),
        };
        let body = json!({
            "id": inbound_id,
            "settings": encode_settings(&settings)?,
        });
        let path = format!("panel/api/inbounds/updateClient/{}", uuid);
        match self.api.post(&path, Some(&body)).await?.into_payload() {
            Ok(_) => {
                tracing::info!(inbound_id, uuid, "Клиент обновлён");
                Ok(true)
            }
            Err(PanelError::RemoteRejected(msg)) => {
                tracing::warn!(inbound_id, uuid, msg = %msg, "Панель отклонила обновление");
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    /// Удаляет клиента из inbound'а. Удаление уже отсутствующего — `false`,
    /// не ошибка и не успех: «уже нет» и «удалил» различимы для вызывающего.
    pub async fn delete_client(&self, uuid: &str, inbound_id: i64) -> Result<bool, PanelError> {
        let lock = self.locks.lock_for(inbound_id).await;
        let _guard = lock.lock().await;

        let scanner = InboundScanner::new(self.api.as_ref());
        let Some(inbound) = scanner.get_inbound(inbound_id).await? else {
            return Ok(false);
        };
        let ident = ClientIdentifier::Uuid(uuid.to_string());
        if find_client(&inbound.settings.clients, &ident).is_none() {
            tracing::info!(inbound_id, uuid, "Клиент уже отсутствует, удалять нечего");
            return Ok(false);
        }

        self.del_client_raw(inbound_id, uuid).await?;
        tracing::info!(inbound_id, uuid, "Клиент удалён");
        Ok(true)
    }

    /// Сброс счётчиков через выделенный эндпоинт панели. Обязательны
    /// inbound_id и email; недостающее дорезолвливается полным обходом,
    /// и если обход ничего не дал — операция завершается ошибкой.
    pub async fn reset_traffic(
        &self,
        ident: &ClientIdentifier,
        inbound_id: Option<i64>,
        email: Option<&str>,
    ) -> Result<bool, PanelError> {
        let (inbound_id, email) = match (inbound_id, email) {
            (Some(id), Some(email)) if !email.is_empty() => (id, email.to_string()),
            _ => {
                let Some((found_id, client)) = self.locate(ident).await? else {
                    return Err(PanelError::RemoteRejected(format!(
                        "клиент {} не найден, сброс трафика невозможен",
                        ident
                    )));
                };
                let email = email
                    .filter(|e| !e.is_empty())
                    .map(str::to_string)
                    .unwrap_or(client.email);
                if email.is_empty() {
                    return Err(PanelError::RemoteRejected(
                        "у клиента нет email, сброс трафика невозможен".to_string(),
                    ));
                }
                (inbound_id.unwrap_or(found_id), email)
            }
        };

        let lock = self.locks.lock_for(inbound_id).await;
        let _guard = lock.lock().await;

        let path = format!(
            "panel/api/inbounds/{}/resetClientTraffic/{}",
            inbound_id,
            urlencoding::encode(&email)
        );
        match self.api.post(&path, None).await?.into_payload() {
            Ok(_) => {
                tracing::info!(inbound_id, email = %email, "Счётчики трафика сброшены");
                Ok(true)
            }
            Err(PanelError::RemoteRejected(msg)) => {
                tracing::warn!(inbound_id, email = %email, msg = %msg, "Панель отклонила сброс");
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    async fn locate(
        &self,
        ident: &ClientIdentifier,
    ) -> Result<Option<(i64, ClientRecord)>, PanelError> {
        let scanner = InboundScanner::new(self.api.as_ref());
        for inbound in scanner.list_inbounds().await? {
            if let Some(client) = find_client(&inbound.settings.clients, ident) {
                return Ok(Some((inbound.id, client.clone())));
            }
        }
        Ok(None)
    }

    async fn del_client_raw(&self, inbound_id: i64, uuid: &str) -> Result<(), PanelError> {
        let path = format!("panel/api/inbounds/{}/delClient/{}", inbound_id, uuid);
        self.api.post(&path, None).await?.into_payload()?;
        Ok(())
    }
}

/// Собирает запись нового клиента. UUID и subId генерируются, если не
/// заданы; квота и срок переводятся в байты и epoch-миллисекунды.
/// Каноническое представление безлимита — ноль, без магических сентинелов.
pub fn new_client_record(email: &str, opts: &AddClientOpts, now_ms: i64) -> ClientRecord {
    ClientRecord {
        id: opts
            .uuid
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        email: email.to_string(),
        total_gb: gb_to_bytes(opts.gb),
        expiry_time: days_to_expiry(opts.days, now_ms),
        enable: true,
        limit_ip: opts.limit_ip.max(0),
        tg_id: opts
            .tg_id
            .map(Value::from)
            .unwrap_or_else(|| Value::String(String::new())),
        sub_id: opts.sub_id.clone().unwrap_or_else(generate_sub_id),
        reset: 0,
        extra: Default::default(),
    }
}

/// Мерджит только заданные поля обновления в свежепрочитанную запись.
pub fn apply_update(mut client: ClientRecord, update: &ClientUpdate, now_ms: i64) -> ClientRecord {
    if let Some(gb) = update.gb {
        client.total_gb = gb_to_bytes(gb);
    }
    if let Some(days) = update.days {
        client.expiry_time = days_to_expiry(days, now_ms);
    }
    if let Some(enable) = update.enable {
        client.enable = enable;
    }
    if let Some(limit_ip) = update.limit_ip {
        client.limit_ip = limit_ip.max(0);
    }
    client
}

pub fn gb_to_bytes(gb: i64) -> i64 {
    gb.max(0).saturating_mul(BYTES_PER_GB)
}

pub fn days_to_expiry(days: i64, now_ms: i64) -> i64 {
    if days <= 0 {
        0
    } else {
        now_ms.saturating_add(days.saturating_mul(MS_PER_DAY))
    }
}

fn generate_sub_id() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), SUB_ID_LEN)
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW_MS: i64 = 1_700_000_000_000;

    fn sample_client() -> ClientRecord {
        serde_json::from_value(json!({
            "id": "aaaaaaaa-0000-0000-0000-000000000001",
            "email": "user1",
            "totalGB": 5 * BYTES_PER_GB,
            "expiryTime": NOW_MS + 1000,
            "limitIp": 2,
            "flow": "xtls-rprx-vision"
        }))
        .unwrap()
    }

    #[test]
    fn new_client_converts_gb_and_days() {
        let opts = AddClientOpts {
            gb: 10,
            days: 30,
            ..AddClientOpts::default()
        };
        let client = new_client_record("bob", &opts, NOW_MS);
        assert_eq!(client.total_gb, 10 * 1024_i64.pow(3));
        assert_eq!(client.expiry_time, NOW_MS + 30 * 86_400_000);
        assert!(client.enable);
        assert_eq!(client.id.len(), 36);
        assert_eq!(client.sub_id.len(), SUB_ID_LEN);
    }

    #[test]
    fn zero_gb_and_days_encode_unlimited_as_zero() {
        let client = new_client_record("bob", &AddClientOpts::default(), NOW_MS);
        assert_eq!(client.total_gb, 0);
        assert_eq!(client.expiry_time, 0);
    }

    #[test]
    fn supplied_uuid_and_sub_id_are_kept() {
        let opts = AddClientOpts {
            uuid: Some("bbbbbbbb-0000-0000-0000-000000000002".to_string()),
            sub_id: Some("fixedsub".to_string()),
            ..AddClientOpts::default()
        };
        let client = new_client_record("bob", &opts, NOW_MS);
        assert_eq!(client.id, "bbbbbbbb-0000-0000-0000-000000000002");
        assert_eq!(client.sub_id, "fixedsub");
    }

    #[test]
    fn update_merges_only_given_fields() {
        let update = ClientUpdate {
            gb: Some(20),
            ..ClientUpdate::default()
        };
        let merged = apply_update(sample_client(), &update, NOW_MS);
        assert_eq!(merged.total_gb, 20 * BYTES_PER_GB);
        // нетронутые поля сохраняются дословно, включая неизвестные
        assert_eq!(merged.expiry_time, NOW_MS + 1000);
        assert_eq!(merged.limit_ip, 2);
        assert_eq!(
            merged.extra.get("flow").and_then(|v| v.as_str()),
            Some("xtls-rprx-vision")
        );
    }

    #[test]
    fn update_days_zero_clears_expiry() {
        let update = ClientUpdate {
            days: Some(0),
            ..ClientUpdate::default()
        };
        let merged = apply_update(sample_client(), &update, NOW_MS);
        assert_eq!(merged.expiry_time, 0);
    }

    // Модель read-modify-write поверх общего блоба: под per-inbound замком
    // обе параллельные правки разных клиентов доезжают до блоба.
    #[tokio::test]
    async fn per_inbound_lock_prevents_lost_update() {
        use std::sync::Mutex as StdMutex;

        let locks = Arc::new(InboundLocks::default());
        let blob = Arc::new(StdMutex::new(vec![
            new_client_record("a", &AddClientOpts::default(), NOW_MS),
            new_client_record("b", &AddClientOpts::default(), NOW_MS),
        ]));

        let mut handles = Vec::new();
        for (email, gb) in [("a", 11), ("b", 22)] {
            let locks = locks.clone();
            let blob = blob.clone();
            handles.push(tokio::spawn(async move {
                let lock = locks.lock_for(1).await;
                let _guard = lock.lock().await;
                // read
                let snapshot = blob.lock().unwrap().clone();
                // точка переключения между чтением и записью
                tokio::task::yield_now().await;
                // modify + write-back всего блоба
                let update = ClientUpdate {
                    gb: Some(gb),
                    ..ClientUpdate::default()
                };
                let written: Vec<_> = snapshot
                    .into_iter()
                    .map(|c| {
                        if c.email == email {
                            apply_update(c, &update, NOW_MS)
                        } else {
                            c
                        }
                    })
                    .collect();
                *blob.lock().unwrap() = written;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let final_blob = blob.lock().unwrap();
        assert_eq!(final_blob[0].total_gb, 11 * BYTES_PER_GB);
        assert_eq!(final_blob[1].total_gb, 22 * BYTES_PER_GB);
    }

    // Без сериализации тот же сценарий теряет одну из правок: оба читают
    // исходный блоб, второй write-back затирает первый. Регрессионный
    // сторож самой опасности.
    #[test]
    fn unsynchronized_blob_overwrite_loses_an_update() {
        let original = vec![
            new_client_record("a", &AddClientOpts::default(), NOW_MS),
            new_client_record("b", &AddClientOpts::default(), NOW_MS),
        ];

        // оба «админа» читают до чьей-либо записи
        let read_one = original.clone();
        let read_two = original.clone();

        let upd = |snapshot: Vec<ClientRecord>, email: &str, gb: i64| -> Vec<ClientRecord> {
            let update = ClientUpdate {
                gb: Some(gb),
                ..ClientUpdate::default()
            };
            snapshot
                .into_iter()
                .map(|c| {
                    if c.email == email {
                        apply_update(c, &update, NOW_MS)
                    } else {
                        c
                    }
                })
                .collect()
        };

        let after_first = upd(read_one, "a", 11); // первый write-back
        assert_eq!(after_first[0].total_gb, 11 * BYTES_PER_GB);

        let blob = upd(read_two, "b", 22); // второй затирает первый
        assert_eq!(blob[0].total_gb, 0, "правка клиента a потеряна");
        assert_eq!(blob[1].total_gb, 22 * BYTES_PER_GB);
    }

    use crate::panel::types::ApiEnvelope;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    fn envelope(success: bool, obj: Option<Value>) -> ApiEnvelope {
        ApiEnvelope {
            success,
            msg: String::new(),
            obj,
        }
    }

    /// Панель в памяти: список inbound'ов с настоящими settings-объектами,
    /// addClient/delClient мутируют их так же, как это делает сама панель.
    struct FakePanel {
        inbounds: StdMutex<Vec<Value>>,
    }

    impl FakePanel {
        fn new(inbounds: Vec<Value>) -> Self {
            Self {
                inbounds: StdMutex::new(inbounds),
            }
        }

        fn clients_of(&self, inbound_id: i64) -> Vec<Value> {
            self.inbounds
                .lock()
                .unwrap()
                .iter()
                .find(|v| v.get("id").and_then(Value::as_i64) == Some(inbound_id))
                .and_then(|v| v["settings"]["clients"].as_array().cloned())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl PanelApi for FakePanel {
        async fn get(&self, path: &str) -> Result<ApiEnvelope, PanelError> {
            if path == "panel/api/inbounds/list" {
                let items = self.inbounds.lock().unwrap().clone();
                return Ok(envelope(true, Some(Value::Array(items))));
            }
            if let Some(raw_id) = path.strip_prefix("panel/api/inbounds/get/") {
                let id: i64 = raw_id.parse().expect("нечисловой id в пути");
                let found = self
                    .inbounds
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|v| v.get("id").and_then(Value::as_i64) == Some(id))
                    .cloned();
                return Ok(match found {
                    Some(inbound) => envelope(true, Some(inbound)),
                    None => envelope(false, None),
                });
            }
            Ok(envelope(false, None))
        }

        async fn post(&self, path: &str, body: Option<&Value>) -> Result<ApiEnvelope, PanelError> {
            if path == "panel/api/inbounds/addClient" {
                let body = body.expect("addClient без тела");
                let id = body["id"].as_i64().expect("addClient без id");
                let settings: Value =
                    serde_json::from_str(body["settings"].as_str().expect("settings не строка"))
                        .expect("settings не JSON");
                let mut inbounds = self.inbounds.lock().unwrap();
                let target = inbounds
                    .iter_mut()
                    .find(|v| v.get("id").and_then(Value::as_i64) == Some(id))
                    .expect("inbound не найден");
                let added = settings["clients"].as_array().cloned().unwrap_or_default();
                target["settings"]["clients"]
                    .as_array_mut()
                    .expect("clients не массив")
                    .extend(added);
                return Ok(envelope(true, None));
            }
            if let Some(rest) = path.strip_prefix("panel/api/inbounds/")
                && let Some((raw_id, uuid)) = rest.split_once("/delClient/")
            {
                let id: i64 = raw_id.parse().expect("нечисловой id в пути");
                let mut inbounds = self.inbounds.lock().unwrap();
                if let Some(target) = inbounds
                    .iter_mut()
                    .find(|v| v.get("id").and_then(Value::as_i64) == Some(id))
                {
                    target["settings"]["clients"]
                        .as_array_mut()
                        .expect("clients не массив")
                        .retain(|c| c.get("id").and_then(Value::as_str) != Some(uuid));
                }
                return Ok(envelope(true, None));
            }
            Ok(envelope(false, None))
        }
    }

    const EXISTING_UUID: &str = "cccccccc-0000-0000-0000-000000000003";

    fn single_inbound_panel() -> Arc<FakePanel> {
        Arc::new(FakePanel::new(vec![json!({
            "id": 1,
            "protocol": "vless",
            "port": 443,
            "settings": {"clients": [{"id": EXISTING_UUID, "email": "bob"}]}
        })]))
    }

    #[tokio::test]
    async fn delete_is_idempotent_second_call_reports_absent() {
        let panel = single_inbound_panel();
        let mutator = ClientMutator::new(panel.clone());

        assert!(mutator.delete_client(EXISTING_UUID, 1).await.unwrap());
        assert!(panel.clients_of(1).is_empty());

        // повторное удаление — «уже нет», не успех и не ошибка
        assert!(!mutator.delete_client(EXISTING_UUID, 1).await.unwrap());
    }

    #[tokio::test]
    async fn add_replaces_client_with_same_email() {
        let panel = single_inbound_panel();
        let mutator = ClientMutator::new(panel.clone());

        let new_uuid = mutator
            .add_client(1, "bob", AddClientOpts::default())
            .await
            .unwrap();
        assert_ne!(new_uuid, EXISTING_UUID);

        let clients = panel.clients_of(1);
        assert_eq!(clients.len(), 1, "старый bob должен быть заменён");
        assert_eq!(
            clients[0].get("id").and_then(Value::as_str),
            Some(new_uuid.as_str())
        );
        assert_eq!(clients[0].get("email").and_then(Value::as_str), Some("bob"));
    }
}
