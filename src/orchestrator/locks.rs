use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tracing::info;

use crate::deploy::OrchestrationMode;

type Key = (String, OrchestrationMode);

/// インフラ作業ディレクトリごとの非同期ロック
/// (2 つの実行が plan ファイルや inventory を共有しない)
#[derive(Default)]
pub struct WorkdirLocks {
    slots: Mutex<HashMap<Key, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkdirLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, provider: &str, mode: OrchestrationMode) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry((provider.to_ascii_lowercase(), mode))
            .or_default()
            .clone()
    }

    /// 他の実行が作業ディレクトリを離すまで待つ
    pub async fn acquire(&self, provider: &str, mode: OrchestrationMode) -> OwnedMutexGuard<()> {
        let slot = self.slot(provider, mode);
        match slot.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                info!(provider, mode = mode.as_str(), "Working directory busy, waiting");
                slot.lock_owned().await
            }
        }
    }

    pub fn is_busy(&self, provider: &str, mode: OrchestrationMode) -> bool {
        self.slot(provider, mode).try_lock().is_err()
    }
}
