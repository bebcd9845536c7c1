// ==========================================
// 医院药品数据导入质控系统 - 任务锁
// ==========================================
// 职责: 每个任务一把带过期时间的互斥锁，值为持有者 actor
// 规则:
// - 获取 = 原子 set-if-absent + TTL
// - 同一持有者再次获取只刷新 TTL，返回重入守卫（重入守卫释放为空操作）
// - 释放必须由持有者发起；过期的锁任何人都可获取
// ==========================================

use crate::engine::cache::CacheBackend;
use crate::engine::error::{TaskError, TaskResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 锁守卫
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLockGuard {
    pub task_id: i64,
    pub actor: String,
    pub reentrant: bool,
}

pub struct TaskLockManager {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl TaskLockManager {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// 获取任务锁
    ///
    /// # 错误
    /// - TaskLocked: 其他 actor 持有未过期的锁
    pub async fn acquire(&self, task_id: i64, actor: &str) -> TaskResult<TaskLockGuard> {
        let key = lock_key(task_id);
        // 持有者恰在两步之间过期时重试一次
        for _ in 0..2 {
            if self.backend.set_nx(&key, actor, self.ttl).await? {
                debug!(task_id, actor, "获取任务锁");
                return Ok(TaskLockGuard {
                    task_id,
                    actor: actor.to_string(),
                    reentrant: false,
                });
            }

            match self.backend.get(&key).await? {
                Some(holder) if holder == actor => {
                    self.backend.expire(&key, self.ttl).await?;
                    debug!(task_id, actor, "重入任务锁，刷新过期时间");
                    return Ok(TaskLockGuard {
                        task_id,
                        actor: actor.to_string(),
                        reentrant: true,
                    });
                }
                Some(holder) => {
                    warn!(task_id, actor, holder = %holder, "任务锁被占用");
                    return Err(TaskError::TaskLocked { task_id, holder });
                }
                None => continue,
            }
        }
        Err(TaskError::TaskLocked {
            task_id,
            holder: "unknown".to_string(),
        })
    }

    /// 释放任务锁（重入守卫不释放）
    ///
    /// # 返回
    /// - true: 本次调用删除了锁
    pub async fn release(&self, guard: &TaskLockGuard) -> TaskResult<bool> {
        if guard.reentrant {
            return Ok(false);
        }
        let released = self
            .backend
            .delete_if_eq(&lock_key(guard.task_id), &guard.actor)
            .await?;
        if released {
            debug!(task_id = guard.task_id, actor = %guard.actor, "释放任务锁");
        } else {
            warn!(task_id = guard.task_id, actor = %guard.actor, "释放时锁已过期或易主");
        }
        Ok(released)
    }

    /// 刷新 TTL（长任务在阶段边界续期）
    pub async fn refresh(&self, guard: &TaskLockGuard) -> TaskResult<()> {
        let key = lock_key(guard.task_id);
        match self.backend.get(&key).await? {
            Some(holder) if holder == guard.actor => {
                self.backend.expire(&key, self.ttl).await?;
                Ok(())
            }
            _ => Err(TaskError::LockNotHeld {
                task_id: guard.task_id,
                actor: guard.actor.clone(),
            }),
        }
    }

    pub async fn holder(&self, task_id: i64) -> TaskResult<Option<String>> {
        Ok(self.backend.get(&lock_key(task_id)).await?)
    }
}

fn lock_key(task_id: i64) -> String {
    format!("import:lock:{}", task_id)
}
