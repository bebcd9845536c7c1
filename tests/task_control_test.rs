// ==========================================
// 任务控制集成测试
// ==========================================
// 测试目标: 任务锁 / 取消 / 重试 / 续跑 / 缓存不可用
// ==========================================


use drug_import_qc::domain::types::{
    DetailStatus, ErrorLevel, RuleCategory, RuleType, StageStatus, TableType, TaskStatus,
};
use drug_import_qc::domain::task::ImportTaskDetail;
use drug_import_qc::engine::{
    CacheBackend, ImportOrchestrator, InMemoryCache, TaskError, TaskLockGuard, TaskLockManager,
};
use drug_import_qc::repository::ImportTaskRepository;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;

const ACTOR: &str = "alice";

fn null_drug_rule(level: ErrorLevel, enabled: bool) -> drug_import_qc::domain::qc::QcRule {
    let mut rule = rule(
        "USAGE_NULL_DRUG",
        RuleType::PreImport,
        RuleCategory::Global,
        Some(TableType::DrugUsage),
        Some("drug_code"),
        "null_count('drug_code') > 0",
        level,
    );
    rule.enabled = enabled;
    rule
}

/// 等待某明细已提交至少 rows 行（运行中轮询进度，不阻塞导入）
async fn wait_for_committed_rows(
    orchestrator: &ImportOrchestrator,
    task_id: i64,
    table_type: TableType,
    rows: i64,
) {
    loop {
        tokio::task::yield_now().await;
        if let Ok(progress) = orchestrator.get_detail_progress(task_id, table_type).await {
            if progress.success_rows >= rows || progress.status.is_terminal() {
                return;
            }
        }
    }
}

// ==========================================
// 任务锁
// ==========================================

#[tokio::test]
async fn test_start_is_rejected_while_another_actor_holds_lock() {
    let env = TestEnv::new();
    let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCache::new());
    let orchestrator = env.orchestrator_with_cache(cache.clone()).await;
    let task = orchestrator
        .create_task("锁竞争", "药品目录.csv", catalog_csv(3).as_bytes(), None)
        .await
        .unwrap();

    let locks = TaskLockManager::new(cache.clone(), Duration::from_millis(200));
    let bob = locks.acquire(task.id, "bob").await.unwrap();

    let err = orchestrator.start_task(task.id, ACTOR).await.unwrap_err();
    assert!(matches!(&err, TaskError::TaskLocked { holder, .. } if holder == "bob"));
    assert!(err.is_retryable());
    assert_eq!(orchestrator.get_task(task.id).unwrap().status, TaskStatus::Pending);

    // 锁过期后可由其他 actor 接管
    tokio::time::sleep(Duration::from_millis(300)).await;
    let report = orchestrator.start_task(task.id, ACTOR).await.unwrap();
    assert_eq!(report.task.status, TaskStatus::Completed);
    assert!(!locks.release(&bob).await.unwrap());
    assert!(locks.holder(task.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_run_that_loses_its_lock_ends_failed() {
    let env = TestEnv::with_settings(|s| {
        s.worker_limit = 1;
        s.batch_size = 5;
    });
    let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCache::new());
    let orchestrator = env.orchestrator_with_cache(cache.clone()).await;
    let locks = TaskLockManager::new(cache.clone(), Duration::from_secs(300));
    let task = orchestrator
        .create_task("锁失效", "药品使用.csv", usage_csv(3000, 0).as_bytes(), None)
        .await
        .unwrap();

    let (report, bob) = tokio::join!(orchestrator.start_task(task.id, ACTOR), async {
        wait_for_committed_rows(&orchestrator, task.id, TableType::DrugUsage, 50).await;
        // 锁过期后被其他 actor 接管
        let expired = TaskLockGuard {
            task_id: task.id,
            actor: ACTOR.to_string(),
            reentrant: false,
        };
        assert!(locks.release(&expired).await.unwrap());
        locks.acquire(task.id, "bob").await.unwrap()
    });

    let report = report.unwrap();
    assert_eq!(report.task.status, TaskStatus::Failed);
    assert!(report
        .task
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("任务锁已失效"));

    let usage = &report.details[0];
    assert_eq!(usage.status, DetailStatus::Failed);
    assert_eq!(usage.error_message.as_deref(), Some("任务锁已失效"));
    assert!(usage.success_rows >= 50 && usage.success_rows < 3000);
    assert_eq!(env.count("SELECT COUNT(*) FROM drug_usage"), usage.success_rows);

    // 新持有者的锁不受影响
    assert_eq!(locks.holder(task.id).await.unwrap(), Some("bob".to_string()));
    assert!(locks.release(&bob).await.unwrap());
}

#[tokio::test]
async fn test_unavailable_cache_is_retryable_and_leaves_task_pending() {
    let env = TestEnv::new();
    let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCache::new());
    // 不连接缓存
    let orchestrator = ImportOrchestrator::new(env.conn.clone(), env.settings.clone(), cache);

    let task = orchestrator
        .create_task("缓存不可用", "药品目录.csv", catalog_csv(3).as_bytes(), None)
        .await
        .unwrap();
    let err = orchestrator.start_task(task.id, ACTOR).await.unwrap_err();

    assert_eq!(err.code(), "CACHE_UNAVAILABLE");
    assert!(err.is_retryable());
    assert_eq!(orchestrator.get_task(task.id).unwrap().status, TaskStatus::Pending);
}

// ==========================================
// 取消
// ==========================================

#[tokio::test]
async fn test_cancel_pending_task_fails_it() {
    let env = TestEnv::new();
    let orchestrator = env.orchestrator().await;
    let task = orchestrator
        .create_task("取消", "药品目录.csv", catalog_csv(3).as_bytes(), None)
        .await
        .unwrap();

    let cancelled = orchestrator.cancel_task(task.id, ACTOR).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Failed);
    assert!(cancelled.error_message.as_deref().unwrap().contains("任务已取消"));

    let err = orchestrator.cancel_task(task.id, ACTOR).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
}

#[tokio::test]
async fn test_cancel_interrupted_task_fails_unfinished_details_only() {
    let env = TestEnv::new();
    let orchestrator = env.orchestrator().await;
    let task = orchestrator
        .create_task("中断取消", "upload.zip", &full_archive(5), None)
        .await
        .unwrap();
    orchestrator.start_task(task.id, ACTOR).await.unwrap();

    // 模拟进程中断: 任务停在导入中，一个明细未完成
    let repo = ImportTaskRepository::from_connection(env.conn.clone());
    let mut task = orchestrator.get_task(task.id).unwrap();
    task.status = TaskStatus::Importing;
    repo.update_task(&task).unwrap();
    let mut usage = orchestrator
        .list_details(task.id)
        .unwrap()
        .into_iter()
        .find(|d| d.table_type == TableType::DrugUsage)
        .unwrap();
    usage.status = DetailStatus::Importing;
    repo.update_detail(&usage).unwrap();

    let cancelled = orchestrator.cancel_task(task.id, ACTOR).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::PartialSuccess);

    let details = orchestrator.list_details(task.id).unwrap();
    for detail in details {
        if detail.table_type == TableType::DrugUsage {
            assert_eq!(detail.status, DetailStatus::Failed);
            assert_eq!(detail.error_message.as_deref(), Some("任务已取消"));
        } else {
            assert_eq!(detail.status, DetailStatus::Success);
        }
    }
    // 已提交批次保留
    assert_eq!(env.count("SELECT COUNT(*) FROM drug_usage"), 5);
}

#[tokio::test]
async fn test_cancel_running_task_stops_after_committed_batches() {
    let env = TestEnv::with_settings(|s| {
        s.worker_limit = 1;
        s.batch_size = 5;
    });
    let orchestrator = env.orchestrator().await;
    let archive = build_zip(&[
        ("医院信息.csv", hospital_csv()),
        ("药品目录.csv", catalog_csv(3000)),
        ("药品入库.csv", inbound_csv(10)),
        ("药品出库.csv", outbound_csv(10)),
        ("药品使用.csv", usage_csv(10, 0)),
    ]);
    let task = orchestrator
        .create_task("运行中取消", "upload.zip", &archive, None)
        .await
        .unwrap();

    let (report, cancelled) = tokio::join!(orchestrator.start_task(task.id, ACTOR), async {
        wait_for_committed_rows(&orchestrator, task.id, TableType::DrugCatalog, 50).await;
        orchestrator.cancel_task(task.id, ACTOR).await
    });

    // 运行方可重入取消，仅设置标记
    let cancelled = cancelled.unwrap();
    assert!(!cancelled.status.is_terminal());

    let report = report.unwrap();
    assert_eq!(report.task.status, TaskStatus::Failed);
    assert!(report
        .task
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("任务已取消"));

    let find = |table_type: TableType| {
        report
            .details
            .iter()
            .find(|d| d.table_type == table_type)
            .unwrap()
    };
    let catalog = find(TableType::DrugCatalog);
    assert_eq!(catalog.status, DetailStatus::Failed);
    assert_eq!(catalog.import_status, StageStatus::Failed);
    assert_eq!(catalog.error_message.as_deref(), Some("任务已取消"));
    assert!(catalog.success_rows >= 50 && catalog.success_rows < 3000);
    // 已提交批次保留
    assert_eq!(env.count("SELECT COUNT(*) FROM drug_catalog"), catalog.success_rows);

    for table_type in [TableType::DrugInbound, TableType::DrugOutbound, TableType::DrugUsage] {
        let detail = find(table_type);
        assert_eq!(detail.status, DetailStatus::Failed, "{}", table_type);
        assert_eq!(detail.error_message.as_deref(), Some("任务已取消"));
        assert_eq!(detail.success_rows, 0);
    }
    assert_eq!(env.count("SELECT COUNT(*) FROM drug_usage"), 0);

    // 锁已释放，可由他人操作
    let err = orchestrator.cancel_task(task.id, "bob").await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
}

// ==========================================
// 重试
// ==========================================

#[tokio::test]
async fn test_retry_limit_exceeded_processes_nothing() {
    let env = TestEnv::with_settings(|s| s.max_retry_count = 0);
    env.put_rule(&null_drug_rule(ErrorLevel::Error, true));
    let orchestrator = env.orchestrator().await;

    let task = orchestrator
        .create_task("重试上限", "药品使用.csv", usage_csv(20, 4).as_bytes(), None)
        .await
        .unwrap();
    let report = orchestrator.start_task(task.id, ACTOR).await.unwrap();
    assert_eq!(report.task.status, TaskStatus::Failed);
    let detail = report.details[0].clone();
    assert_eq!(detail.status, DetailStatus::Failed);

    let err = orchestrator
        .retry_detail(task.id, detail.id, ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TaskError::RetryLimitExceeded { retry_count: 0, max_retry_count: 0, .. }
    ));

    let after = orchestrator.list_details(task.id).unwrap().remove(0);
    assert_eq!(after.retry_count, 0);
    assert_eq!(after.import_batch_no, detail.import_batch_no);
    assert_eq!(env.count("SELECT COUNT(*) FROM drug_usage"), 15);
}

#[tokio::test]
async fn test_retry_after_rule_fix_completes_task() {
    let env = TestEnv::new();
    env.put_rule(&null_drug_rule(ErrorLevel::Error, true));
    let orchestrator = env.orchestrator().await;

    let task = orchestrator
        .create_task("规则修正", "药品使用.csv", usage_csv(20, 4).as_bytes(), None)
        .await
        .unwrap();
    let first = orchestrator.start_task(task.id, ACTOR).await.unwrap();
    assert_eq!(first.task.status, TaskStatus::Failed);
    let detail_id = first.details[0].id;

    env.put_rule(&null_drug_rule(ErrorLevel::Error, false));
    let report = orchestrator.retry_detail(task.id, detail_id, ACTOR).await.unwrap();

    assert_eq!(report.task.status, TaskStatus::Completed);
    let detail = &report.details[0];
    assert_eq!(detail.status, DetailStatus::Success);
    assert_eq!(detail.retry_count, 1);
    assert!(detail.import_batch_no.as_deref().unwrap().ends_with("-DRUG_USAGE-1"));
    // 空编码行仍为行级失败，已落库行不重复写入
    assert_eq!(detail.success_rows, 15);
    assert_eq!(detail.failed_rows, 5);
    assert_eq!(env.count("SELECT COUNT(*) FROM drug_usage"), 15);
    // 旧的表级结果已清除
    assert!(orchestrator.list_findings(task.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_retry_task_reimports_failed_batch_after_file_fix() {
    let env = TestEnv::new();
    let orchestrator = env.orchestrator().await;

    let broken = catalog_csv(25).replacen("H001,D006,", "H001,D005,", 1);
    let archive = build_zip(&[
        ("药品目录.csv", broken),
        ("药品使用.csv", usage_csv(10, 0)),
    ]);
    let task = orchestrator
        .create_task("批次修复", "upload.zip", &archive, None)
        .await
        .unwrap();
    let first = orchestrator.start_task(task.id, ACTOR).await.unwrap();
    assert_eq!(first.task.status, TaskStatus::PartialSuccess);

    let catalog = first
        .details
        .iter()
        .find(|d| d.table_type == TableType::DrugCatalog)
        .unwrap();
    std::fs::write(catalog.file_path.as_deref().unwrap(), catalog_csv(25)).unwrap();

    let report = orchestrator.retry_task(task.id, ACTOR).await.unwrap();
    assert_eq!(report.task.status, TaskStatus::Completed);
    assert_eq!(report.task.progress_percent, 100);
    assert!(report.task.error_message.is_none());

    let catalog = report
        .details
        .iter()
        .find(|d| d.table_type == TableType::DrugCatalog)
        .unwrap();
    assert_eq!(catalog.retry_count, 1);
    assert_eq!(catalog.success_rows, 25);
    assert_eq!(catalog.failed_rows, 0);
    assert_eq!(catalog.import_status, StageStatus::Success);
    assert_eq!(env.count("SELECT COUNT(*) FROM drug_catalog"), 25);

    // 成功明细不参与重试
    let usage = report
        .details
        .iter()
        .find(|d| d.table_type == TableType::DrugUsage)
        .unwrap();
    assert_eq!(usage.retry_count, 0);

    let err = orchestrator.retry_task(task.id, ACTOR).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
}

// ==========================================
// 续跑
// ==========================================

#[tokio::test]
async fn test_resume_continues_after_last_committed_batch() {
    let env = TestEnv::new();
    let orchestrator = env.orchestrator().await;
    let task = orchestrator
        .create_task("续跑", "药品使用.csv", usage_csv(30, 0).as_bytes(), None)
        .await
        .unwrap();
    orchestrator.start_task(task.id, ACTOR).await.unwrap();

    // 模拟只提交了前 12 行后进程退出
    env.execute("DELETE FROM drug_usage WHERE row_no > 12");
    let repo = ImportTaskRepository::from_connection(env.conn.clone());
    let mut task = orchestrator.get_task(task.id).unwrap();
    task.status = TaskStatus::Importing;
    task.import_status = StageStatus::Processing;
    repo.update_task(&task).unwrap();
    let mut detail = orchestrator.list_details(task.id).unwrap().remove(0);
    let batch_no = detail.import_batch_no.clone();
    detail.status = DetailStatus::Importing;
    detail.import_status = StageStatus::Processing;
    detail.qc_status = StageStatus::Pending;
    detail.success_rows = 12;
    detail.valid_rows = 12;
    repo.update_detail(&detail).unwrap();

    // 新进程（新缓存，无会话）
    let restarted = env.orchestrator().await;
    let results = restarted.resume_unfinished(ACTOR).await.unwrap();
    assert_eq!(results.len(), 1);
    let report = results.into_iter().next().unwrap().unwrap();

    assert_eq!(report.task.status, TaskStatus::Completed);
    let detail = &report.details[0];
    assert_eq!(detail.import_batch_no, batch_no);
    assert_eq!(detail.success_rows, 30);
    assert_eq!(detail.retry_count, 0);
    assert_eq!(env.count("SELECT COUNT(*) FROM drug_usage"), 30);
    assert_eq!(
        env.count("SELECT COUNT(DISTINCT row_no) FROM drug_usage"),
        30
    );
}

#[tokio::test]
async fn test_resume_reextracts_when_extraction_was_interrupted() {
    let env = TestEnv::new();
    let orchestrator = env.orchestrator().await;
    let task = orchestrator
        .create_task("解压中断", "upload.zip", &full_archive(6), None)
        .await
        .unwrap();

    // 模拟解压中途退出: 只登记了一个明细
    let repo = ImportTaskRepository::from_connection(env.conn.clone());
    let mut stuck = orchestrator.get_task(task.id).unwrap();
    stuck.status = TaskStatus::Extracting;
    stuck.extract_status = StageStatus::Processing;
    repo.update_task(&stuck).unwrap();
    repo.insert_detail(&ImportTaskDetail::new_pending(
        task.id,
        TableType::HospitalInfo,
        "医院信息.csv".into(),
        None,
        3,
    ))
    .unwrap();

    let report = orchestrator.resume_task(task.id, ACTOR).await.unwrap();
    assert_eq!(report.task.status, TaskStatus::Completed);
    assert_eq!(report.task.extract_status, StageStatus::Success);
    assert_eq!(report.details.len(), 5);
    assert!(report.details.iter().all(|d| d.status == DetailStatus::Success));
    assert_eq!(env.count("SELECT COUNT(*) FROM drug_usage"), 6);
}

#[tokio::test]
async fn test_resume_rejects_terminal_task() {
    let env = TestEnv::new();
    let orchestrator = env.orchestrator().await;
    let task = orchestrator
        .create_task("终态", "药品目录.csv", catalog_csv(2).as_bytes(), None)
        .await
        .unwrap();
    orchestrator.start_task(task.id, ACTOR).await.unwrap();

    let err = orchestrator.resume_task(task.id, ACTOR).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
}
