//! Кэш онлайн-клиентов.
//!
//! Короткий TTL, single-flight: протухший снапшот обновляет ровно один
//! вызов, остальные читатели немедленно получают предыдущий. Сбой
//! обновления не всплывает наружу — кэш отдаёт последнее удачное
//! состояние и пишет предупреждение в лог.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::PanelError;
use super::session::PanelSession;
use super::types::{ObjPayload, OnlineClientEntry};

pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

/// Источник онлайн-листинга. Отдельный шов, чтобы кэш тестировался без сети.
#[async_trait]
pub trait OnlineSource: Send + Sync {
    async fn fetch_online(&self) -> Result<Vec<OnlineClientEntry>, PanelError>;
}

#[async_trait]
impl OnlineSource for PanelSession {
    async fn fetch_online(&self) -> Result<Vec<OnlineClientEntry>, PanelError> {
        let payload = self
            .post("panel/api/inbounds/onlines", None)
            .await?
            .into_payload()?;
        let items = match payload {
            ObjPayload::List(items) => items,
            ObjPayload::Absent => Vec::new(),
            ObjPayload::Object(_) => {
                return Err(PanelError::InvalidResponse(
                    "onlines вернул объект вместо списка".to_string(),
                ));
            }
        };
        Ok(items.iter().filter_map(OnlineClientEntry::from_value).collect())
    }
}

struct CacheState {
    snapshot: Arc<HashMap<String, OnlineClientEntry>>,
    fetched_at: Option<Instant>,
}

pub struct OnlineClientCache {
    source: Arc<dyn OnlineSource>,
    ttl: Duration,
    state: RwLock<CacheState>,
    refreshing: AtomicBool,
}

impl OnlineClientCache {
    pub fn new(source: Arc<dyn OnlineSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            state: RwLock::new(CacheState {
                snapshot: Arc::new(HashMap::new()),
                fetched_at: None,
            }),
            refreshing: AtomicBool::new(false),
        }
    }

    /// Снапшот онлайн-клиентов по email. Читатели не ждут чужое обновление:
    /// пока идёт refresh, возвращается прошлый снапшот.
    pub async fn get(&self) -> Arc<HashMap<String, OnlineClientEntry>> {
        let (snapshot, fresh) = {
            let state = self.state.read().await;
            let fresh = state
                .fetched_at
                .is_some_and(|at| at.elapsed() < self.ttl);
            (state.snapshot.clone(), fresh)
        };
        if fresh {
            return snapshot;
        }

        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // обновление уже идёт — stale-while-revalidate
            return snapshot;
        }
        // снимается и при отмене future на await источника: иначе слот
        // останется занят навсегда
        let _slot = RefreshSlot(&self.refreshing);

        let result = self.source.fetch_online().await;
        let mut state = self.state.write().await;
        match result {
            Ok(entries) => {
                let map: HashMap<_, _> = entries
                    .into_iter()
                    .map(|entry| (entry.email.clone(), entry))
                    .collect();
                tracing::debug!(count = map.len(), "Онлайн-кэш обновлён");
                state.snapshot = Arc::new(map);
                state.fetched_at = Some(Instant::now());
            }
            Err(error) => {
                // fail-open: прежний снапшот остаётся в силе
                tracing::warn!(
                    error = %error,
                    "Не удалось обновить онлайн-кэш, отдаю прежний снапшот"
                );
            }
        }
        state.snapshot.clone()
    }
}

struct RefreshSlot<'a>(&'a AtomicBool);

impl Drop for RefreshSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
