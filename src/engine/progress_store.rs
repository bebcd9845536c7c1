// ==========================================
// 医院药品数据导入质控系统 - 任务进度存储
// ==========================================
// 职责: 任务/明细进度快照与编排会话的限时缓存（写入即覆盖并重置过期）
// 键: import:progress:{task_id} / import:progress:{task_id}:{TABLE} / import:session:{task_id}
// 约束: 缓存只是投影，未命中时由调用方从持久化记录重建
// ==========================================

use crate::domain::progress::{ImportSessionInfo, TaskDetailProgressInfo, TaskProgressInfo};
use crate::domain::types::TableType;
use crate::engine::cache::{CacheBackend, CacheResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct TaskProgressStore {
    backend: Arc<dyn CacheBackend>,
    progress_ttl: Duration,
    session_ttl: Duration,
}

impl TaskProgressStore {
    pub fn new(backend: Arc<dyn CacheBackend>, progress_ttl: Duration, session_ttl: Duration) -> Self {
        Self {
            backend,
            progress_ttl,
            session_ttl,
        }
    }

    pub async fn connect(&self) -> CacheResult<()> {
        self.backend.connect().await
    }

    pub async fn disconnect(&self) -> CacheResult<()> {
        self.backend.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.backend.is_connected()
    }

    // ===== 任务进度 =====

    pub async fn put_task_progress(&self, info: &TaskProgressInfo) -> CacheResult<()> {
        debug!(task_id = info.task_id, percent = info.progress_percent, "写入任务进度快照");
        self.put_json(&task_key(info.task_id), info, self.progress_ttl)
            .await
    }

    pub async fn get_task_progress(&self, task_id: i64) -> CacheResult<Option<TaskProgressInfo>> {
        self.get_json(&task_key(task_id)).await
    }

    // ===== 明细进度 =====

    pub async fn put_detail_progress(&self, info: &TaskDetailProgressInfo) -> CacheResult<()> {
        self.put_json(
            &detail_key(info.task_id, info.table_type),
            info,
            self.progress_ttl,
        )
        .await
    }

    pub async fn get_detail_progress(
        &self,
        task_id: i64,
        table_type: TableType,
    ) -> CacheResult<Option<TaskDetailProgressInfo>> {
        self.get_json(&detail_key(task_id, table_type)).await
    }

    /// 清除任务及全部明细快照
    pub async fn evict_task(&self, task_id: i64) -> CacheResult<()> {
        self.backend.delete(&task_key(task_id)).await?;
        for table_type in TableType::ALL {
            self.backend.delete(&detail_key(task_id, table_type)).await?;
        }
        Ok(())
    }

    // ===== 会话 =====

    pub async fn put_session(&self, session: &ImportSessionInfo) -> CacheResult<()> {
        self.put_json(&session_key(session.task_id), session, self.session_ttl)
            .await
    }

    pub async fn get_session(&self, task_id: i64) -> CacheResult<Option<ImportSessionInfo>> {
        self.get_json(&session_key(task_id)).await
    }

    pub async fn remove_session(&self, task_id: i64) -> CacheResult<bool> {
        self.backend.delete(&session_key(task_id)).await
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> CacheResult<()> {
        let json = serde_json::to_string(value)?;
        self.backend.set(key, &json, ttl).await
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        match self.backend.get(key).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

fn task_key(task_id: i64) -> String {
    format!("import:progress:{}", task_id)
}

fn detail_key(task_id: i64, table_type: TableType) -> String {
    format!("import:progress:{}:{}", task_id, table_type.code())
}

fn session_key(task_id: i64) -> String {
    format!("import:session:{}", task_id)
}
