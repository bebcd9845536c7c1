// ==========================================
// 医院药品数据导入质控系统 - 导入编排器
// ==========================================
// 职责: 任务状态机 PENDING → EXTRACTING → IMPORTING → QC_CHECKING → 终态
// 流程:
// 1. 获取任务锁（其他 actor 持有则 TASK_LOCKED）
// 2. 解压归类，每个识别文件生成一个 PENDING 明细
// 3. 明细并发导入（上限 worker_limit），每批写回计数
// 4. 屏障: 全部明细导入终态后执行导入后质控（按表类型顺序）
// 5. 推导终态，写入失败摘要，释放锁
// 约束: 兄弟明细互不中断；取消与锁续期在明细边界和每批提交后检查
// ==========================================

use crate::config::{ImportConfigReader, ImportSettings};
use crate::domain::progress::{ImportSessionInfo, TaskDetailProgressInfo, TaskProgressInfo};
use crate::domain::qc::{QcFinding, RuleConfigIssue};
use crate::domain::task::{derive_task_status, FailedDetailSummary, ImportTask, ImportTaskDetail};
use crate::domain::types::{
    DetailStatus, ImportType, RuleType, StageStatus, TableType, TaskStatus,
};
use crate::engine::cache::CacheBackend;
use crate::engine::error::{TaskError, TaskResult};
use crate::engine::lock_manager::{TaskLockGuard, TaskLockManager};
use crate::engine::progress_store::TaskProgressStore;
use crate::engine::qc::{NoLookup, PreloadedLookup, QcRuleEngine, TableStats};
use crate::importer::{
    detect_import_type, ArchiveExtractor, BatchListener, ImportError, ImportJob, PreScan,
    RowFilter, RowImporter, RunProgress,
};
use crate::repository::{ImportTaskRepository, QcRuleRepository, TableDataRepository};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const CANCELLED_REASON: &str = "任务已取消";
const LOCK_LOST_REASON: &str = "任务锁已失效";
// 失败明细 error_detail 中保留的行错误条数
const REJECTION_SAMPLE: usize = 100;

// ==========================================
// TaskRunReport - 一次编排的结果
// ==========================================
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunReport {
    pub task: ImportTask,
    pub details: Vec<ImportTaskDetail>,
    /// 本次快照中被跳过的配置错误规则
    pub rule_issues: Vec<RuleConfigIssue>,
}

/// 明细导入方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImportMode {
    Fresh,
    /// 仅重导上一批次失败行（无失败行时导入未落库行）
    Retry,
    /// 跳过已落库与当前批次已拒绝的行，沿用批次号
    Resume,
}

/// 单次编排共享的上下文
struct RunContext {
    task_id: i64,
    task_no: String,
    engine: QcRuleEngine,
    guard: TaskLockGuard,
    cancel: Arc<AtomicBool>,
    lock_lost: AtomicBool,
    session: AsyncMutex<ImportSessionInfo>,
}

impl RunContext {
    /// 需要停止时的原因（锁失效优先于取消）
    fn stop_reason(&self) -> Option<&'static str> {
        if self.lock_lost.load(Ordering::SeqCst) {
            Some(LOCK_LOST_REASON)
        } else if self.cancel.load(Ordering::SeqCst) {
            Some(CANCELLED_REASON)
        } else {
            None
        }
    }
}

/// 运行中任务的取消标记，离开作用域时注销
struct RunningGuard<'a> {
    running: &'a Mutex<HashMap<i64, Arc<AtomicBool>>>,
    task_id: i64,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.remove(&self.task_id);
    }
}

// ==========================================
// ImportOrchestrator
// ==========================================
pub struct ImportOrchestrator {
    settings: ImportSettings,
    task_repo: Arc<ImportTaskRepository>,
    data_repo: Arc<TableDataRepository>,
    rule_repo: Arc<QcRuleRepository>,
    importer: RowImporter,
    extractor: ArchiveExtractor,
    progress: TaskProgressStore,
    locks: TaskLockManager,
    running: Mutex<HashMap<i64, Arc<AtomicBool>>>,
    // 串行化任务行的读-改-写
    task_write: AsyncMutex<()>,
}

impl ImportOrchestrator {
    /// 从配置读取器创建
    pub async fn from_config<C: ImportConfigReader>(
        conn: Arc<Mutex<Connection>>,
        config: &C,
        cache: Arc<dyn CacheBackend>,
    ) -> TaskResult<Self> {
        let settings = config
            .load_settings()
            .await
            .map_err(|e| TaskError::Config(e.to_string()))?;
        Ok(Self::new(conn, settings, cache))
    }

    pub fn new(
        conn: Arc<Mutex<Connection>>,
        settings: ImportSettings,
        cache: Arc<dyn CacheBackend>,
    ) -> Self {
        let data_repo = Arc::new(TableDataRepository::from_connection(conn.clone()));
        let rule_repo = Arc::new(QcRuleRepository::from_connection(conn.clone()));
        Self {
            task_repo: Arc::new(ImportTaskRepository::from_connection(conn)),
            importer: RowImporter::new(data_repo.clone(), rule_repo.clone(), settings.batch_size),
            extractor: ArchiveExtractor::new(settings.archive_limits()),
            progress: TaskProgressStore::new(
                cache.clone(),
                settings.progress_ttl(),
                settings.session_ttl(),
            ),
            locks: TaskLockManager::new(cache, settings.lock_ttl()),
            running: Mutex::new(HashMap::new()),
            task_write: AsyncMutex::new(()),
            data_repo,
            rule_repo,
            settings,
        }
    }

    pub fn settings(&self) -> &ImportSettings {
        &self.settings
    }

    /// 连接缓存后端（进度与锁共用）
    pub async fn connect(&self) -> TaskResult<()> {
        Ok(self.progress.connect().await?)
    }

    pub async fn disconnect(&self) -> TaskResult<()> {
        Ok(self.progress.disconnect().await?)
    }

    // ==========================================
    // 创建任务
    // ==========================================

    /// 保存上传文件并创建 PENDING 任务
    ///
    /// # 错误
    /// - UnsupportedFormat: 扩展名不是 zip/7z/xlsx/xls/csv
    /// - Oversize: 超过压缩包大小上限
    #[instrument(skip(self, bytes), fields(file_name = %file_name, size = bytes.len()))]
    pub async fn create_task(
        &self,
        task_name: &str,
        file_name: &str,
        bytes: &[u8],
        creator: Option<&str>,
    ) -> TaskResult<ImportTask> {
        let import_type = detect_import_type(file_name)?;
        let size = bytes.len() as u64;
        if size > self.settings.max_archive_bytes {
            return Err(ImportError::Oversize {
                size,
                limit: self.settings.max_archive_bytes,
            }
            .into());
        }

        let task_no = generate_task_no();
        let upload_dir = self.settings.work_dir.join(&task_no).join("upload");
        let stored_path = upload_dir.join(safe_file_name(file_name));
        std::fs::create_dir_all(&upload_dir).map_err(ImportError::from)?;
        std::fs::write(&stored_path, bytes).map_err(ImportError::from)?;

        let mut task = ImportTask::new_pending(
            task_no,
            task_name.to_string(),
            file_name.to_string(),
            size as i64,
            import_type,
            creator.map(str::to_string),
        );
        task.source_file_path = Some(stored_path.to_string_lossy().to_string());
        task.id = self.task_repo.insert_task(&task)?;

        info!(task_id = task.id, task_no = %task.task_no, import_type = ?import_type, "导入任务已创建");
        self.publish_task(&task, &[]).await;
        Ok(task)
    }

    // ==========================================
    // 启动
    // ==========================================

    /// 执行完整流程（解压 → 导入 → 质控 → 终态）
    ///
    /// # 错误
    /// - TASK_LOCKED: 其他 actor 持有任务锁
    /// - INVALID_STATE: 任务不是 PENDING
    #[instrument(skip(self), fields(task_id = task_id, actor = %actor))]
    pub async fn start_task(&self, task_id: i64, actor: &str) -> TaskResult<TaskRunReport> {
        let guard = self.locks.acquire(task_id, actor).await?;
        let result = async {
            let task = self.load_task(task_id)?;
            if task.status != TaskStatus::Pending {
                return Err(invalid_state(&task, "start"));
            }
            self.run_from_extraction(task, &guard).await
        }
        .await;
        self.release(&guard).await;
        result
    }

    // ==========================================
    // 取消
    // ==========================================

    /// 取消任务（运行中的任务在下一个明细边界停止，已提交批次保留）
    ///
    /// 需持有任务锁（运行任务的 actor 可重入）。本进程内运行中的任务只设置取消标记，
    /// 由运行方收尾；否则直接收尾
    #[instrument(skip(self), fields(task_id = task_id, actor = %actor))]
    pub async fn cancel_task(&self, task_id: i64, actor: &str) -> TaskResult<ImportTask> {
        let guard = self.locks.acquire(task_id, actor).await?;
        let result = async {
            let task = self.load_task(task_id)?;
            if !task.status.is_cancellable() {
                return Err(invalid_state(&task, "cancel"));
            }

            let flag = self
                .running
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&task_id)
                .cloned();
            if let Some(flag) = flag {
                flag.store(true, Ordering::SeqCst);
                info!(task_id, "已通知运行中的任务取消");
                return Ok(task);
            }

            // 无运行实例: 未终结明细直接置为失败
            for mut detail in self.task_repo.list_details(task_id)? {
                if !detail.status.is_terminal() {
                    detail.mark_failed(CANCELLED_REASON);
                    self.save_detail(&detail).await?;
                }
            }
            let task = self.finalize_task(task_id, Some(CANCELLED_REASON)).await?;
            self.remove_session(task_id).await;
            info!(task_id, status = %task.status, "任务已取消");
            Ok(task)
        }
        .await;
        self.release(&guard).await;
        result
    }

    // ==========================================
    // 重试
    // ==========================================

    /// 重试单个失败明细
    ///
    /// # 错误
    /// - RETRY_LIMIT_EXCEEDED: retry_count 已达 max_retry_count，不处理任何行
    /// - INVALID_STATE: 任务未到终态或明细未失败
    #[instrument(skip(self), fields(task_id = task_id, detail_id = detail_id, actor = %actor))]
    pub async fn retry_detail(
        &self,
        task_id: i64,
        detail_id: i64,
        actor: &str,
    ) -> TaskResult<TaskRunReport> {
        let guard = self.locks.acquire(task_id, actor).await?;
        let result = async {
            let task = self.load_task(task_id)?;
            if !task.status.is_terminal() {
                return Err(invalid_state(&task, "retry_detail"));
            }
            if task.extract_status == StageStatus::Failed {
                return self.rerun_extraction(task, &guard).await;
            }

            let detail = self
                .task_repo
                .find_detail(detail_id)?
                .filter(|d| d.task_id == task_id)
                .ok_or_else(|| TaskError::NotFound(format!("明细 {} (任务 {})", detail_id, task_id)))?;
            if detail.status != DetailStatus::Failed {
                return Err(TaskError::InvalidState {
                    task_id,
                    status: format!("detail {}", detail.status),
                    operation: "retry_detail",
                });
            }
            ensure_retry_allowed(&detail)?;
            self.run_retry(task, vec![detail], &guard).await
        }
        .await;
        self.release(&guard).await;
        result
    }

    /// 重试任务的全部可重试失败明细；解压失败的任务从解压重新开始
    #[instrument(skip(self), fields(task_id = task_id, actor = %actor))]
    pub async fn retry_task(&self, task_id: i64, actor: &str) -> TaskResult<TaskRunReport> {
        let guard = self.locks.acquire(task_id, actor).await?;
        let result = async {
            let task = self.load_task(task_id)?;
            if !task.status.is_terminal() {
                return Err(invalid_state(&task, "retry_task"));
            }
            if task.extract_status == StageStatus::Failed {
                return self.rerun_extraction(task, &guard).await;
            }

            let failed: Vec<ImportTaskDetail> = self
                .task_repo
                .list_details(task_id)?
                .into_iter()
                .filter(|d| d.status == DetailStatus::Failed)
                .collect();
            if failed.is_empty() {
                return Err(invalid_state(&task, "retry_task"));
            }
            let (retryable, exhausted): (Vec<_>, Vec<_>) =
                failed.into_iter().partition(|d| d.can_retry());
            if retryable.is_empty() {
                // 全部用尽时报告第一个
                if let Some(detail) = exhausted.first() {
                    ensure_retry_allowed(detail)?;
                }
            }
            for detail in &exhausted {
                warn!(task_id, detail_id = detail.id, "明细重试次数已用尽，跳过");
            }
            self.run_retry(task, retryable, &guard).await
        }
        .await;
        self.release(&guard).await;
        result
    }

    // ==========================================
    // 续跑
    // ==========================================

    /// 重启后继续未完成任务
    ///
    /// 会话仍在时按会话的已完成项跳过；会话过期时以持久化明细为准
    #[instrument(skip(self), fields(task_id = task_id, actor = %actor))]
    pub async fn resume_task(&self, task_id: i64, actor: &str) -> TaskResult<TaskRunReport> {
        let guard = self.locks.acquire(task_id, actor).await?;
        let result = async {
            let task = self.load_task(task_id)?;
            if task.status.is_terminal() {
                return Err(invalid_state(&task, "resume"));
            }
            let details = self.task_repo.list_details(task_id)?;
            if task.status == TaskStatus::Pending || task.extract_status != StageStatus::Success {
                if !details.is_empty() {
                    let removed = self.task_repo.delete_details(task_id)?;
                    warn!(task_id, removed, "解压未完成，清除残留明细后重新解压");
                }
                return self.run_from_extraction(task, &guard).await;
            }

            let session = match self.progress.get_session(task_id).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(task_id, error = %e, "读取会话失败，按持久化明细续跑");
                    None
                }
            };
            let pending: Vec<ImportTaskDetail> = details
                .into_iter()
                .filter(|d| !d.status.is_terminal())
                .filter(|d| {
                    session
                        .as_ref()
                        .map_or(true, |s| !s.completed_items.contains(&d.table_type))
                })
                .collect();
            info!(
                task_id,
                pending = pending.len(),
                session = session.is_some(),
                "续跑未完成明细"
            );

            let session = session.unwrap_or_else(|| {
                ImportSessionInfo::new(
                    Uuid::new_v4().to_string(),
                    task_id,
                    actor,
                    pending.iter().map(|d| d.table_type).collect(),
                )
            });
            let ctx = self.begin_run(&task, session, &guard).await?;
            let _running = self.register_running(task_id, ctx.cancel.clone());

            self.update_task(task_id, |task, _| {
                task.status = TaskStatus::Importing;
                task.import_status = StageStatus::Processing;
                task.import_start_time.get_or_insert_with(Utc::now);
            })
            .await?;

            let (to_import, awaiting_qc): (Vec<_>, Vec<_>) = pending
                .into_iter()
                .partition(|d| d.import_status != StageStatus::Success);
            let imported = self.import_details(&ctx, to_import, ImportMode::Resume).await;
            self.finish_run(&ctx, imported.into_iter().chain(awaiting_qc).collect())
                .await
        }
        .await;
        self.release(&guard).await;
        result
    }

    /// 续跑全部未完成任务（进程启动时调用）
    pub async fn resume_unfinished(&self, actor: &str) -> TaskResult<Vec<TaskResult<TaskRunReport>>> {
        let tasks = self.task_repo.list_unfinished_tasks()?;
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            results.push(self.resume_task(task.id, actor).await);
        }
        Ok(results)
    }

    // ==========================================
    // 查询
    // ==========================================

    /// 任务进度（缓存优先，未命中时由持久化记录重建并回填）
    pub async fn get_task_progress(&self, task_id: i64) -> TaskResult<TaskProgressInfo> {
        if let Some(info) = self.progress.get_task_progress(task_id).await? {
            return Ok(info);
        }
        let task = self.load_task(task_id)?;
        let details = self.task_repo.list_details(task_id)?;
        let info = TaskProgressInfo::from_records(&task, &details);
        self.progress.put_task_progress(&info).await?;
        debug!(task_id, "进度缓存未命中，已重建");
        Ok(info)
    }

    /// 明细进度（缓存优先）
    pub async fn get_detail_progress(
        &self,
        task_id: i64,
        table_type: TableType,
    ) -> TaskResult<TaskDetailProgressInfo> {
        if let Some(info) = self.progress.get_detail_progress(task_id, table_type).await? {
            return Ok(info);
        }
        let detail = self
            .task_repo
            .list_details(task_id)?
            .into_iter()
            .find(|d| d.table_type == table_type)
            .ok_or_else(|| {
                TaskError::NotFound(format!("任务 {} 的 {} 明细", task_id, table_type.code()))
            })?;
        let info = TaskDetailProgressInfo::from_detail(&detail);
        self.progress.put_detail_progress(&info).await?;
        Ok(info)
    }

    /// 质控结果（按表类型、阶段、行号排序，同一行内为评估顺序）
    pub fn list_findings(&self, task_id: i64) -> TaskResult<Vec<QcFinding>> {
        Ok(self.rule_repo.list_findings(task_id)?)
    }

    pub fn get_task(&self, task_id: i64) -> TaskResult<ImportTask> {
        self.load_task(task_id)
    }

    pub fn list_details(&self, task_id: i64) -> TaskResult<Vec<ImportTaskDetail>> {
        Ok(self.task_repo.list_details(task_id)?)
    }

    // ==========================================
    // 阶段实现
    // ==========================================

    /// 从解压阶段开始执行
    async fn run_from_extraction(
        &self,
        task: ImportTask,
        guard: &TaskLockGuard,
    ) -> TaskResult<TaskRunReport> {
        let task_id = task.id;
        let session = ImportSessionInfo::new(Uuid::new_v4().to_string(), task_id, &guard.actor, vec![]);
        let ctx = self.begin_run(&task, session, guard).await?;
        let _running = self.register_running(task_id, ctx.cancel.clone());

        // ===== 解压 =====
        self.update_task(task_id, |task, _| {
            task.status = TaskStatus::Extracting;
            task.extract_status = StageStatus::Processing;
            task.extract_start_time = Some(Utc::now());
            task.error_message = None;
            task.error_detail = None;
        })
        .await?;

        let details = match self.extract(&task) {
            Ok(details) => details,
            Err(e) => {
                error!(task_id, task_no = %task.task_no, error = %e, "解压归类失败，任务终止");
                let message = e.to_string();
                let task = self
                    .update_task(task_id, move |task, _| {
                        task.status = TaskStatus::Failed;
                        task.extract_status = StageStatus::Failed;
                        task.extract_end_time = Some(Utc::now());
                        task.error_message = Some(message);
                    })
                    .await?;
                self.remove_session(task_id).await;
                return Ok(TaskRunReport {
                    task,
                    details: vec![],
                    rule_issues: ctx.engine.issues().to_vec(),
                });
            }
        };

        {
            let mut session = ctx.session.lock().await;
            session.pending_items = details.iter().map(|d| d.table_type).collect();
            self.put_session(&session).await;
        }
        let file_count = details.len() as i64;
        self.update_task(task_id, move |task, _| {
            task.extract_status = StageStatus::Success;
            task.extract_end_time = Some(Utc::now());
            task.total_files = task.total_files.max(file_count);
        })
        .await?;
        self.keep_lock(&ctx).await;

        // ===== 导入 =====
        self.update_task(task_id, |task, _| {
            task.status = TaskStatus::Importing;
            task.import_status = StageStatus::Processing;
            task.import_start_time = Some(Utc::now());
        })
        .await?;
        let imported = self.import_details(&ctx, details, ImportMode::Fresh).await;
        self.finish_run(&ctx, imported).await
    }

    /// 解压失败任务的重跑：清空阶段状态后从解压开始
    async fn rerun_extraction(
        &self,
        task: ImportTask,
        guard: &TaskLockGuard,
    ) -> TaskResult<TaskRunReport> {
        info!(task_id = task.id, "解压阶段失败，重新执行解压");
        self.task_repo.delete_details(task.id)?;
        let task = self
            .update_task(task.id, |task, _| {
                task.status = TaskStatus::Pending;
                task.extract_status = StageStatus::Pending;
                task.import_status = StageStatus::Pending;
                task.qc_status = StageStatus::Pending;
            })
            .await?;
        self.run_from_extraction(task, guard).await
    }

    /// 重试指定明细
    async fn run_retry(
        &self,
        task: ImportTask,
        details: Vec<ImportTaskDetail>,
        guard: &TaskLockGuard,
    ) -> TaskResult<TaskRunReport> {
        let task_id = task.id;
        let mut prepared = Vec::with_capacity(details.len());
        for mut detail in details {
            detail.retry_count += 1;
            info!(
                task_id,
                detail_id = detail.id,
                table_type = detail.table_type.code(),
                retry_count = detail.retry_count,
                "重试明细"
            );
            prepared.push(detail);
        }

        let session = ImportSessionInfo::new(
            Uuid::new_v4().to_string(),
            task_id,
            &guard.actor,
            prepared.iter().map(|d| d.table_type).collect(),
        );
        let ctx = self.begin_run(&task, session, guard).await?;
        let _running = self.register_running(task_id, ctx.cancel.clone());

        self.update_task(task_id, |task, _| {
            task.status = TaskStatus::Importing;
            task.import_status = StageStatus::Processing;
            task.qc_status = StageStatus::Pending;
            task.import_start_time = Some(Utc::now());
            task.error_message = None;
            task.error_detail = None;
        })
        .await?;
        let imported = self.import_details(&ctx, prepared, ImportMode::Retry).await;
        self.finish_run(&ctx, imported).await
    }

    /// 编排开始：规则快照 + 会话
    async fn begin_run(
        &self,
        task: &ImportTask,
        session: ImportSessionInfo,
        guard: &TaskLockGuard,
    ) -> TaskResult<RunContext> {
        let engine = QcRuleEngine::new(self.rule_repo.list_enabled_rules()?);
        for issue in engine.issues() {
            warn!(task_id = task.id, rule_code = %issue.rule_code, message = %issue.message, "规则配置错误，已跳过");
        }
        self.put_session(&session).await;
        debug!(task_id = task.id, actor = %guard.actor, rules = engine.rule_count(), "编排开始");
        Ok(RunContext {
            task_id: task.id,
            task_no: task.task_no.clone(),
            engine,
            guard: guard.clone(),
            cancel: Arc::new(AtomicBool::new(false)),
            lock_lost: AtomicBool::new(false),
            session: AsyncMutex::new(session),
        })
    }

    /// 导入后质控 + 终态
    async fn finish_run(
        &self,
        ctx: &RunContext,
        details: Vec<ImportTaskDetail>,
    ) -> TaskResult<TaskRunReport> {
        let task_id = ctx.task_id;
        self.keep_lock(ctx).await;

        // ===== 屏障: 此处所有明细的导入阶段已到终态 =====
        self.update_task(task_id, |task, details| {
            task.status = TaskStatus::QcChecking;
            task.qc_status = StageStatus::Processing;
            task.qc_start_time = Some(Utc::now());
            task.import_end_time = Some(Utc::now());
            task.import_status = if details.iter().any(|d| d.import_status == StageStatus::Success) {
                StageStatus::Success
            } else {
                StageStatus::Failed
            };
        })
        .await?;

        let mut awaiting: Vec<ImportTaskDetail> = details
            .into_iter()
            .filter(|d| !d.status.is_terminal())
            .collect();
        awaiting.sort_by_key(|d| d.table_type);

        let lookup = self.preload_lookup(ctx, &awaiting)?;
        for detail in awaiting {
            let table_type = detail.table_type;
            let detail = match self.check_interrupt(ctx).await {
                Some(reason) => self.fail_detail(detail, reason).await,
                None => self.qc_detail(ctx, detail, &lookup).await,
            };
            debug!(task_id, detail_id = detail.id, status = %detail.status, "明细质控结束");
            self.complete_session_item(ctx, table_type).await;
        }

        let task = self.finalize_task(task_id, ctx.stop_reason()).await?;
        self.remove_session(task_id).await;
        info!(
            task_id,
            task_no = %ctx.task_no,
            status = %task.status,
            progress = task.progress_percent,
            "任务结束"
        );

        Ok(TaskRunReport {
            details: self.task_repo.list_details(task_id)?,
            rule_issues: ctx.engine.issues().to_vec(),
            task,
        })
    }

    /// 解压并落盘，创建 PENDING 明细
    fn extract(&self, task: &ImportTask) -> TaskResult<Vec<ImportTaskDetail>> {
        let source = task
            .source_file_path
            .as_deref()
            .ok_or_else(|| ImportError::FileNotFound(task.source_file_name.clone()))?;
        let bytes = std::fs::read(source).map_err(|e| {
            ImportError::FileNotFound(format!("{}: {}", source, e))
        })?;
        let mut result = self.extractor.extract(&task.source_file_name, &bytes)?;

        for name in &result.unrecognized {
            warn!(task_id = task.id, file_name = %name, "无法识别的文件，已忽略");
        }
        for name in &result.duplicates {
            warn!(task_id = task.id, file_name = %name, "同类型重复文件，已忽略");
        }
        if task.import_type == ImportType::Archive {
            for table_type in &result.missing_types {
                info!(task_id = task.id, table_type = table_type.code(), "压缩包缺少可选文件");
            }
        }

        let files_dir = self.settings.work_dir.join(&task.task_no).join("files");
        std::fs::create_dir_all(&files_dir).map_err(ImportError::from)?;

        // 先全部落盘，再在一个事务内登记明细
        let mut details = Vec::with_capacity(result.files.len());
        for file in result.files.drain(..) {
            let path = files_dir.join(format!(
                "{}_{}",
                file.table_type.code(),
                safe_file_name(&file.file_name)
            ));
            std::fs::write(&path, &file.bytes).map_err(ImportError::from)?;
            details.push(ImportTaskDetail::new_pending(
                task.id,
                file.table_type,
                file.file_name,
                Some(path.to_string_lossy().to_string()),
                self.settings.max_retry_count,
            ));
        }
        let ids = self.task_repo.insert_details(&details)?;
        for (detail, id) in details.iter_mut().zip(ids) {
            detail.id = id;
        }
        info!(task_id = task.id, files = details.len(), "解压归类完成");
        Ok(details)
    }

    /// 明细并发导入（上限 worker_limit）
    async fn import_details(
        &self,
        ctx: &RunContext,
        details: Vec<ImportTaskDetail>,
        mode: ImportMode,
    ) -> Vec<ImportTaskDetail> {
        stream::iter(details)
            .map(|detail| self.import_detail(ctx, detail, mode))
            .buffer_unordered(self.settings.worker_limit.max(1))
            .collect()
            .await
    }

    /// 导入单个明细；任何错误只让该明细失败
    async fn import_detail(
        &self,
        ctx: &RunContext,
        detail: ImportTaskDetail,
        mode: ImportMode,
    ) -> ImportTaskDetail {
        let table_type = detail.table_type;
        if let Some(reason) = self.check_interrupt(ctx).await {
            let detail = self.fail_detail(detail, reason).await;
            self.complete_session_item(ctx, table_type).await;
            return detail;
        }

        let cell = AsyncMutex::new(detail);
        if let Err(e) = self.try_import_detail(ctx, &cell, mode).await {
            let mut detail = cell.lock().await;
            warn!(
                task_id = ctx.task_id,
                detail_id = detail.id,
                table_type = table_type.code(),
                error = %e,
                "明细导入失败"
            );
            // 预扫描前失败属于解析阶段（缺列、文件损坏）
            if detail.parse_status == StageStatus::Processing {
                detail.parse_status = StageStatus::Failed;
            } else {
                detail.import_status = StageStatus::Failed;
            }
            detail.mark_failed(e.to_string());
            if let Err(save_error) = self.save_detail(&detail).await {
                error!(detail_id = detail.id, error = %save_error, "明细失败状态写入失败");
            }
        }

        let detail = cell.into_inner();
        if detail.status.is_terminal() {
            self.complete_session_item(ctx, table_type).await;
        }
        if let Err(e) = self.update_task(ctx.task_id, |_, _| {}).await {
            warn!(task_id = ctx.task_id, error = %e, "任务计数刷新失败");
        }
        detail
    }

    async fn try_import_detail(
        &self,
        ctx: &RunContext,
        cell: &AsyncMutex<ImportTaskDetail>,
        mode: ImportMode,
    ) -> TaskResult<()> {
        let (job, baseline) = {
            let mut detail = cell.lock().await;
            let (filter, batch_no, baseline) = self.plan_run(ctx, &detail, mode)?;

            detail.status = DetailStatus::Parsing;
            detail.parse_status = StageStatus::Processing;
            detail.import_status = StageStatus::Pending;
            detail.qc_status = StageStatus::Pending;
            detail.valid_rows = baseline.valid_rows as i64;
            detail.success_rows = baseline.success_rows as i64;
            detail.failed_rows = baseline.failed_rows as i64;
            detail.qc_passed_rows = 0;
            detail.qc_failed_rows = 0;
            detail.import_batch_no = Some(batch_no.clone());
            detail.error_message = None;
            detail.error_detail = None;
            detail.start_time = Some(Utc::now());
            detail.end_time = None;
            self.save_detail(&detail).await?;

            info!(
                task_id = ctx.task_id,
                detail_id = detail.id,
                table_type = detail.table_type.code(),
                batch_no = %batch_no,
                mode = ?mode,
                "明细开始导入"
            );

            let file_path = detail
                .file_path
                .as_deref()
                .map(PathBuf::from)
                .ok_or_else(|| ImportError::FileNotFound(detail.file_name.clone()))?;
            (
                ImportJob {
                    task_id: ctx.task_id,
                    detail_id: detail.id,
                    table_type: detail.table_type,
                    file_path,
                    batch_no,
                    filter,
                },
                baseline,
            )
        };

        let listener = DetailListener {
            orchestrator: self,
            ctx,
            detail: cell,
            baseline,
        };
        let report = self
            .importer
            .import_file(&job, &ctx.engine, &NoLookup, &listener)
            .await?;

        let mut detail = cell.lock().await;
        detail.parse_status = StageStatus::Success;
        if !report.rejections.is_empty() {
            let sample: Vec<_> = report.rejections.iter().take(REJECTION_SAMPLE).collect();
            detail.error_detail = Some(serde_json::to_string(&sample).map_err(|e| {
                TaskError::Import(ImportError::InternalError(e.to_string()))
            })?);
        }

        let table_errors = report.has_table_errors();
        if let Some(reason) = report.storage_error {
            detail.import_status = StageStatus::Failed;
            detail.mark_failed(reason);
        } else {
            detail.import_status = StageStatus::Success;
            detail.status = DetailStatus::Importing;
            if table_errors {
                detail.qc_status = StageStatus::Failed;
                detail.error_message = Some("导入前质控未通过".to_string());
            }
        }
        self.save_detail(&detail).await?;
        Ok(())
    }

    /// 计算本次运行的行过滤、批次号与计数基线
    fn plan_run(
        &self,
        ctx: &RunContext,
        detail: &ImportTaskDetail,
        mode: ImportMode,
    ) -> TaskResult<(RowFilter, String, RunProgress)> {
        let new_batch_no = format!(
            "{}-{}-{}",
            ctx.task_no,
            detail.table_type.code(),
            detail.retry_count
        );
        let table_type = detail.table_type;

        match (mode, detail.import_batch_no.clone()) {
            (ImportMode::Retry, previous) => {
                let failed = match previous {
                    Some(batch_no) => self.data_repo.failed_row_numbers(detail.id, &batch_no)?,
                    None => HashSet::new(),
                };
                self.rule_repo
                    .delete_findings(detail.id, RuleType::PostImport, None)?;
                self.rule_repo
                    .delete_table_findings(detail.id, RuleType::PreImport)?;
                if !failed.is_empty() {
                    self.rule_repo
                        .delete_findings(detail.id, RuleType::PreImport, Some(&failed))?;
                }

                let persisted = self.data_repo.persisted_row_numbers(table_type, detail.id)?;
                let baseline = RunProgress {
                    total_rows: detail.total_rows.max(0) as usize,
                    valid_rows: persisted.len(),
                    success_rows: persisted.len(),
                    failed_rows: 0,
                };
                let filter = if failed.is_empty() {
                    RowFilter::Skip(persisted)
                } else {
                    RowFilter::Only(failed)
                };
                Ok((filter, new_batch_no, baseline))
            }
            (ImportMode::Resume, Some(batch_no)) => {
                let persisted = self.data_repo.persisted_row_numbers(table_type, detail.id)?;
                let failed = self.data_repo.failed_row_numbers(detail.id, &batch_no)?;
                self.rule_repo
                    .delete_table_findings(detail.id, RuleType::PreImport)?;
                let baseline = RunProgress {
                    total_rows: detail.total_rows.max(0) as usize,
                    valid_rows: persisted.len(),
                    success_rows: persisted.len(),
                    failed_rows: failed.len(),
                };
                let skip: HashSet<usize> = persisted.union(&failed).copied().collect();
                Ok((RowFilter::Skip(skip), batch_no, baseline))
            }
            (ImportMode::Resume, None) | (ImportMode::Fresh, _) => {
                Ok((RowFilter::All, new_batch_no, RunProgress::default()))
            }
        }
    }

    /// 预加载导入后规则引用的跨表取值（评估期间不访问数据库）
    fn preload_lookup(
        &self,
        ctx: &RunContext,
        details: &[ImportTaskDetail],
    ) -> TaskResult<PreloadedLookup> {
        let mut refs: Vec<(TableType, String)> = details
            .iter()
            .flat_map(|d| ctx.engine.cross_table_refs(RuleType::PostImport, d.table_type))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        refs.sort();

        let mut lookup = PreloadedLookup::default();
        for (table_type, column) in refs {
            let values = self
                .data_repo
                .distinct_values(ctx.task_id, table_type, &column)?;
            lookup.insert(table_type, &column, values);
        }
        Ok(lookup)
    }

    /// 单明细导入后质控；任何错误只让该明细失败
    async fn qc_detail(
        &self,
        ctx: &RunContext,
        mut detail: ImportTaskDetail,
        lookup: &PreloadedLookup,
    ) -> ImportTaskDetail {
        match self.try_qc_detail(ctx, &mut detail, lookup).await {
            Ok(()) => detail,
            Err(e) => {
                warn!(task_id = ctx.task_id, detail_id = detail.id, error = %e, "明细质控失败");
                detail.qc_status = StageStatus::Failed;
                self.fail_detail(detail, e.to_string()).await
            }
        }
    }

    async fn try_qc_detail(
        &self,
        ctx: &RunContext,
        detail: &mut ImportTaskDetail,
        lookup: &PreloadedLookup,
    ) -> TaskResult<()> {
        let stage = RuleType::PostImport;
        let table_type = detail.table_type;
        let pre_failed = detail.qc_status == StageStatus::Failed;

        detail.status = DetailStatus::QcChecking;
        if !pre_failed {
            detail.qc_status = StageStatus::Processing;
        }
        self.save_detail(detail).await?;
        self.rule_repo.delete_findings(detail.id, stage, None)?;

        let row_rules = ctx.engine.has_row_rules(stage, table_type);
        let global_rules = ctx.engine.has_global_rules(stage, table_type);
        if row_rules || global_rules {
            let mut stats = TableStats::new(ctx.engine.duplicate_columns(stage, table_type));
            let mut cursor = 0;
            loop {
                let (next, page) = self.data_repo.fetch_rows(
                    table_type,
                    detail.id,
                    cursor,
                    self.settings.batch_size,
                )?;
                if page.is_empty() {
                    break;
                }
                cursor = next;

                let mut findings = Vec::new();
                for row in &page {
                    if global_rules {
                        stats.observe(row);
                    }
                    if row_rules {
                        findings.extend(ctx.engine.evaluate_row(stage, table_type, row, lookup));
                    }
                }
                self.rule_repo
                    .insert_findings(ctx.task_id, Some(detail.id), stage, &findings)?;
            }

            if global_rules {
                let findings = ctx.engine.evaluate_table(stage, table_type, &stats, lookup);
                self.rule_repo
                    .insert_findings(ctx.task_id, Some(detail.id), stage, &findings)?;
            }
        }

        let error_findings = self.rule_repo.count_error_findings(detail.id, stage)?;
        detail.qc_failed_rows = self.rule_repo.count_error_rows(detail.id, stage)?;
        detail.qc_passed_rows = (detail.success_rows - detail.qc_failed_rows).max(0);

        if error_findings > 0 {
            detail.qc_status = StageStatus::Failed;
            detail.mark_failed(format!("质控未通过: {} 条 error 级结果", error_findings));
        } else if pre_failed {
            let reason = detail
                .error_message
                .clone()
                .unwrap_or_else(|| "导入前质控未通过".to_string());
            detail.mark_failed(reason);
        } else {
            detail.qc_status = StageStatus::Success;
            detail.status = DetailStatus::Success;
            detail.error_message = None;
            detail.end_time = Some(Utc::now());
            detail.updated_at = Utc::now();
        }
        self.save_detail(detail).await?;

        info!(
            task_id = ctx.task_id,
            detail_id = detail.id,
            table_type = table_type.code(),
            qc_failed_rows = detail.qc_failed_rows,
            status = %detail.status,
            "明细质控完成"
        );
        Ok(())
    }

    /// 推导终态并写入失败摘要；失去任务锁的运行一律失败
    async fn finalize_task(
        &self,
        task_id: i64,
        interrupted: Option<&'static str>,
    ) -> TaskResult<ImportTask> {
        self.update_task(task_id, move |task, details| {
            let statuses: Vec<DetailStatus> = details.iter().map(|d| d.status).collect();
            if let Some(status) = derive_task_status(&statuses) {
                task.status = status;
            }
            if interrupted == Some(LOCK_LOST_REASON) {
                task.status = TaskStatus::Failed;
            }
            task.qc_end_time = Some(Utc::now());
            let qc_ran = details
                .iter()
                .any(|d| d.qc_status.is_terminal() && d.import_status == StageStatus::Success);
            task.qc_status = if details.iter().any(|d| d.qc_status == StageStatus::Failed) || !qc_ran {
                StageStatus::Failed
            } else {
                StageStatus::Success
            };
            if task.import_status == StageStatus::Processing || task.import_status == StageStatus::Pending {
                task.import_status = if details.iter().any(|d| d.import_status == StageStatus::Success) {
                    StageStatus::Success
                } else {
                    StageStatus::Failed
                };
            }

            let failed: Vec<FailedDetailSummary> = details
                .iter()
                .filter(|d| d.status == DetailStatus::Failed)
                .map(FailedDetailSummary::from_detail)
                .collect();
            match task.status {
                TaskStatus::Failed | TaskStatus::PartialSuccess => {
                    let mut message = if failed.is_empty() {
                        "没有可导入的明细".to_string()
                    } else {
                        format!(
                            "{} 个明细失败: {}",
                            failed.len(),
                            failed
                                .iter()
                                .map(|f| format!("{}({})", f.table_type.display_name(), f.reason))
                                .collect::<Vec<_>>()
                                .join("; ")
                        )
                    };
                    if let Some(reason) = interrupted {
                        message = format!("{}; {}", reason, message);
                    }
                    task.error_message = Some(message);
                    task.error_detail = serde_json::to_string(&failed).ok();
                }
                _ => {
                    task.error_message = None;
                    task.error_detail = None;
                }
            }
        })
        .await
    }

    // ==========================================
    // 持久化与进度发布
    // ==========================================

    /// 任务行读-改-写（串行），随后按明细汇总计数并发布进度
    async fn update_task<F>(&self, task_id: i64, apply: F) -> TaskResult<ImportTask>
    where
        F: FnOnce(&mut ImportTask, &[ImportTaskDetail]),
    {
        let _write = self.task_write.lock().await;
        let mut task = self.load_task(task_id)?;
        let details = self.task_repo.list_details(task_id)?;
        apply(&mut task, &details);
        task.apply_detail_totals(&details);
        task.updated_at = Utc::now();
        self.task_repo.update_task(&task)?;
        self.publish_task(&task, &details).await;
        Ok(task)
    }

    async fn save_detail(&self, detail: &ImportTaskDetail) -> TaskResult<()> {
        self.task_repo.update_detail(detail)?;
        if let Err(e) = self
            .progress
            .put_detail_progress(&TaskDetailProgressInfo::from_detail(detail))
            .await
        {
            warn!(detail_id = detail.id, error = %e, "明细进度缓存写入失败");
        }
        Ok(())
    }

    async fn fail_detail(
        &self,
        mut detail: ImportTaskDetail,
        reason: impl Into<String>,
    ) -> ImportTaskDetail {
        detail.mark_failed(reason);
        if let Err(e) = self.save_detail(&detail).await {
            error!(detail_id = detail.id, error = %e, "明细失败状态写入失败");
        }
        detail
    }

    async fn publish_task(&self, task: &ImportTask, details: &[ImportTaskDetail]) {
        let info = TaskProgressInfo::from_records(task, details);
        if let Err(e) = self.progress.put_task_progress(&info).await {
            warn!(task_id = task.id, error = %e, "任务进度缓存写入失败");
        }
    }

    async fn put_session(&self, session: &ImportSessionInfo) {
        if let Err(e) = self.progress.put_session(session).await {
            warn!(task_id = session.task_id, error = %e, "会话写入失败");
        }
    }

    async fn remove_session(&self, task_id: i64) {
        if let Err(e) = self.progress.remove_session(task_id).await {
            warn!(task_id, error = %e, "会话删除失败，等待过期");
        }
    }

    async fn complete_session_item(&self, ctx: &RunContext, table_type: TableType) {
        let mut session = ctx.session.lock().await;
        session.complete_item(table_type);
        self.put_session(&session).await;
    }

    fn load_task(&self, task_id: i64) -> TaskResult<ImportTask> {
        self.task_repo
            .find_task(task_id)?
            .ok_or_else(|| TaskError::NotFound(format!("任务 {}", task_id)))
    }

    fn register_running(&self, task_id: i64, flag: Arc<AtomicBool>) -> RunningGuard<'_> {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id, flag);
        RunningGuard {
            running: &self.running,
            task_id,
        }
    }

    /// 续期任务锁；续期失败后本次运行不再写入新的批次
    async fn keep_lock(&self, ctx: &RunContext) -> bool {
        if ctx.lock_lost.load(Ordering::SeqCst) {
            return false;
        }
        match self.locks.refresh(&ctx.guard).await {
            Ok(()) => true,
            Err(e) => {
                error!(task_id = ctx.task_id, actor = %ctx.guard.actor, error = %e, "任务锁续期失败，停止运行");
                ctx.lock_lost.store(true, Ordering::SeqCst);
                false
            }
        }
    }

    /// 明细边界检查：续期任务锁后返回停止原因
    async fn check_interrupt(&self, ctx: &RunContext) -> Option<&'static str> {
        self.keep_lock(ctx).await;
        ctx.stop_reason()
    }

    async fn release(&self, guard: &TaskLockGuard) {
        if let Err(e) = self.locks.release(guard).await {
            warn!(task_id = guard.task_id, error = %e, "任务锁释放失败，等待过期");
        }
    }
}

// ==========================================
// DetailListener - 每批写回明细计数
// ==========================================
struct DetailListener<'a> {
    orchestrator: &'a ImportOrchestrator,
    ctx: &'a RunContext,
    detail: &'a AsyncMutex<ImportTaskDetail>,
    baseline: RunProgress,
}

#[async_trait]
impl BatchListener for DetailListener<'_> {
    async fn on_prescan(&self, scan: PreScan) {
        {
            let mut detail = self.detail.lock().await;
            detail.total_rows = detail.total_rows.max(scan.total_rows as i64);
            detail.parse_status = StageStatus::Success;
            detail.status = DetailStatus::Importing;
            detail.import_status = StageStatus::Processing;
            detail.updated_at = Utc::now();
            if let Err(e) = self.orchestrator.save_detail(&detail).await {
                warn!(detail_id = detail.id, error = %e, "明细计数写入失败");
            }
        }
        if let Err(e) = self.orchestrator.update_task(self.ctx.task_id, |_, _| {}).await {
            warn!(task_id = self.ctx.task_id, error = %e, "任务计数刷新失败");
        }
    }

    async fn on_batch(&self, progress: RunProgress) {
        {
            let mut detail = self.detail.lock().await;
            detail.valid_rows = (self.baseline.valid_rows + progress.valid_rows) as i64;
            detail.success_rows = (self.baseline.success_rows + progress.success_rows) as i64;
            detail.failed_rows = (self.baseline.failed_rows + progress.failed_rows) as i64;
            detail.updated_at = Utc::now();
            if let Err(e) = self.orchestrator.save_detail(&detail).await {
                warn!(detail_id = detail.id, error = %e, "明细计数写入失败");
            }
        }
        if let Err(e) = self.orchestrator.update_task(self.ctx.task_id, |_, _| {}).await {
            warn!(task_id = self.ctx.task_id, error = %e, "任务计数刷新失败");
        }
        self.orchestrator.keep_lock(self.ctx).await;
    }

    fn stop_reason(&self) -> Option<String> {
        self.ctx.stop_reason().map(str::to_string)
    }
}

// ==========================================
// 辅助函数
// ==========================================

/// 任务编号: IMP + 时间戳 + 6 位随机后缀
pub fn generate_task_no() -> String {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(6).collect();
    format!("IMP{}{}", Utc::now().format("%Y%m%d%H%M%S"), suffix.to_uppercase())
}

/// 去掉目录部分，防止路径穿越
fn safe_file_name(file_name: &str) -> String {
    Path::new(file_name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "upload.bin".to_string())
}

fn invalid_state(task: &ImportTask, operation: &'static str) -> TaskError {
    TaskError::InvalidState {
        task_id: task.id,
        status: task.status.to_string(),
        operation,
    }
}

fn ensure_retry_allowed(detail: &ImportTaskDetail) -> TaskResult<()> {
    if detail.retry_exhausted() {
        return Err(TaskError::RetryLimitExceeded {
            detail_id: detail.id,
            retry_count: detail.retry_count,
            max_retry_count: detail.max_retry_count,
        });
    }
    Ok(())
}
