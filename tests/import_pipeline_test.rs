// ==========================================
// 导入流水线集成测试
// ==========================================
// 测试目标: 解压 → 并发导入 → 屏障 → 导入后质控 → 终态推导
// ==========================================


use drug_import_qc::domain::types::{
    DetailStatus, ErrorLevel, RuleCategory, RuleType, StageStatus, TableType, TaskStatus,
};
use drug_import_qc::engine::TaskError;
use drug_import_qc::logging;
use test_helpers::*;

const ACTOR: &str = "alice";

#[tokio::test]
async fn test_full_archive_completes_without_findings() {
    logging::init_test();
    let env = TestEnv::new();
    let orchestrator = env.orchestrator().await;

    let task = orchestrator
        .create_task("三月上报", "2024-03.zip", &full_archive(30), Some(ACTOR))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.task_no.starts_with("IMP"));

    let report = orchestrator.start_task(task.id, ACTOR).await.unwrap();

    assert_eq!(report.task.status, TaskStatus::Completed);
    assert_eq!(report.task.progress_percent, 100);
    assert_eq!(report.task.extract_status, StageStatus::Success);
    assert_eq!(report.task.import_status, StageStatus::Success);
    assert_eq!(report.task.qc_status, StageStatus::Success);
    assert_eq!(report.task.total_files, 5);
    assert_eq!(report.task.success_files, 5);
    assert_eq!(report.task.total_records, 1 + 30 * 4);
    assert_eq!(report.task.success_records, 1 + 30 * 4);
    assert!(report.task.error_message.is_none());

    assert_eq!(report.details.len(), 5);
    for detail in &report.details {
        assert_eq!(detail.status, DetailStatus::Success, "{}", detail.table_type);
        assert_eq!(detail.success_rows, detail.total_rows);
        assert_eq!(detail.failed_rows, 0);
        assert_eq!(detail.qc_passed_rows, detail.success_rows);
        assert!(detail.import_batch_no.as_deref().unwrap().ends_with("-0"));
    }
    assert!(orchestrator.list_findings(task.id).unwrap().is_empty());
    assert_eq!(env.count("SELECT COUNT(*) FROM drug_usage"), 30);
}

#[tokio::test]
async fn test_missing_catalog_fails_at_extraction() {
    let env = TestEnv::new();
    let orchestrator = env.orchestrator().await;

    let archive = build_zip(&[
        ("医院信息.csv", hospital_csv()),
        ("药品使用.csv", usage_csv(5, 0)),
    ]);
    let task = orchestrator
        .create_task("缺少目录", "upload.zip", &archive, None)
        .await
        .unwrap();
    let report = orchestrator.start_task(task.id, ACTOR).await.unwrap();

    assert_eq!(report.task.status, TaskStatus::Failed);
    assert_eq!(report.task.extract_status, StageStatus::Failed);
    assert!(report.task.error_message.as_deref().unwrap().contains("药品目录"));
    assert!(report.details.is_empty());
    assert!(orchestrator.list_details(task.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_unsupported_upload_is_rejected_before_task_creation() {
    let env = TestEnv::new();
    let orchestrator = env.orchestrator().await;

    let err = orchestrator
        .create_task("错误格式", "report.pdf", b"%PDF", None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CLASSIFICATION_ERROR");
    assert_eq!(env.count("SELECT COUNT(*) FROM import_task"), 0);
}

#[tokio::test]
async fn test_pre_import_global_rule_level_decides_detail_outcome() {
    // 100 行中 10 行药品编码为空
    let csv = usage_csv(100, 10);

    for (level, expected) in [
        (ErrorLevel::Warning, DetailStatus::Success),
        (ErrorLevel::Error, DetailStatus::Failed),
    ] {
        let env = TestEnv::new();
        env.put_rule(&rule(
            "USAGE_NULL_DRUG",
            RuleType::PreImport,
            RuleCategory::Global,
            Some(TableType::DrugUsage),
            Some("drug_code"),
            "null_count('drug_code') > 5",
            level,
        ));
        let orchestrator = env.orchestrator().await;
        let task = orchestrator
            .create_task("使用记录", "药品使用.csv", csv.as_bytes(), None)
            .await
            .unwrap();
        let report = orchestrator.start_task(task.id, ACTOR).await.unwrap();

        let detail = &report.details[0];
        assert_eq!(detail.status, expected, "level {:?}", level);
        assert_eq!(detail.total_rows, 100);
        assert_eq!(detail.failed_rows, 10);
        assert_eq!(detail.success_rows, 90);

        let findings = orchestrator.list_findings(task.id).unwrap();
        let table_findings: Vec<_> = findings
            .iter()
            .filter(|f| f.rule_code == "USAGE_NULL_DRUG")
            .collect();
        assert_eq!(table_findings.len(), 1);
        assert!(table_findings[0].row_number.is_none());

        let expected_task = if expected == DetailStatus::Success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        assert_eq!(report.task.status, expected_task);
    }
}

#[tokio::test]
async fn test_post_import_cross_table_rule_flags_unknown_drugs() {
    let env = TestEnv::new();
    env.put_rule(&rule(
        "USAGE_DRUG_IN_CATALOG",
        RuleType::PostImport,
        RuleCategory::Logic,
        Some(TableType::DrugUsage),
        Some("drug_code"),
        "not exists_in('DRUG_CATALOG', 'drug_code', drug_code)",
        ErrorLevel::Error,
    ));
    let orchestrator = env.orchestrator().await;

    // 目录只有 D001..D020，使用记录引用 D001..D030
    let archive = build_zip(&[
        ("药品目录.csv", catalog_csv(20)),
        ("药品使用.csv", usage_csv(30, 0)),
    ]);
    let task = orchestrator
        .create_task("跨表校验", "upload.zip", &archive, None)
        .await
        .unwrap();
    let report = orchestrator.start_task(task.id, ACTOR).await.unwrap();

    assert_eq!(report.task.status, TaskStatus::PartialSuccess);
    assert_eq!(report.task.qc_status, StageStatus::Failed);

    let usage = report
        .details
        .iter()
        .find(|d| d.table_type == TableType::DrugUsage)
        .unwrap();
    assert_eq!(usage.status, DetailStatus::Failed);
    assert_eq!(usage.qc_failed_rows, 10);
    assert_eq!(usage.qc_passed_rows, 20);
    assert!(usage.error_message.as_deref().unwrap().starts_with("质控未通过"));

    let rows: Vec<usize> = orchestrator
        .list_findings(task.id)
        .unwrap()
        .into_iter()
        .filter_map(|f| f.row_number)
        .collect();
    assert_eq!(rows, (21..=30).collect::<Vec<_>>());

    let summary = report.task.error_detail.as_deref().unwrap();
    assert!(summary.contains("DRUG_USAGE"));
}

#[tokio::test]
async fn test_rule_with_invalid_expression_is_skipped_and_reported() {
    let env = TestEnv::new();
    env.put_rule(&rule(
        "BROKEN",
        RuleType::PostImport,
        RuleCategory::Field,
        Some(TableType::DrugCatalog),
        Some("drug_name"),
        "drug_name ==",
        ErrorLevel::Error,
    ));
    let orchestrator = env.orchestrator().await;

    let task = orchestrator
        .create_task("目录", "药品目录.csv", catalog_csv(5).as_bytes(), None)
        .await
        .unwrap();
    let report = orchestrator.start_task(task.id, ACTOR).await.unwrap();

    assert_eq!(report.task.status, TaskStatus::Completed);
    assert_eq!(report.rule_issues.len(), 1);
    assert_eq!(report.rule_issues[0].rule_code, "BROKEN");
}

#[tokio::test]
async fn test_findings_are_deterministic_across_runs() {
    let env = TestEnv::with_settings(|s| s.worker_limit = 5);
    env.put_rule(&rule(
        "QTY_LARGE",
        RuleType::PostImport,
        RuleCategory::Field,
        None,
        Some("quantity"),
        "$value > 5",
        ErrorLevel::Warning,
    ));
    env.put_rule(&rule(
        "DUP_DRUG",
        RuleType::PostImport,
        RuleCategory::Global,
        Some(TableType::DrugUsage),
        None,
        "duplicate_count(drug_code) > 0",
        ErrorLevel::Warning,
    ));
    let orchestrator = env.orchestrator().await;

    let mut runs = Vec::new();
    for name in ["第一次", "第二次"] {
        let task = orchestrator
            .create_task(name, "upload.zip", &full_archive(60), None)
            .await
            .unwrap();
        orchestrator.start_task(task.id, ACTOR).await.unwrap();
        let findings: Vec<_> = orchestrator
            .list_findings(task.id)
            .unwrap()
            .into_iter()
            .map(|f| (f.table_type, f.row_number, f.rule_code, f.message))
            .collect();
        runs.push(findings);
    }

    assert!(!runs[0].is_empty());
    assert_eq!(runs[0], runs[1]);
}

#[tokio::test]
async fn test_batch_storage_failure_only_fails_its_detail() {
    let env = TestEnv::new();
    let orchestrator = env.orchestrator().await;

    // 第 6 行与第 5 行药品编码重复，首批 (1..=10) 整批回滚
    let mut catalog = catalog_csv(25);
    catalog = catalog.replacen("H001,D006,", "H001,D005,", 1);
    let archive = build_zip(&[
        ("药品目录.csv", catalog),
        ("药品使用.csv", usage_csv(12, 0)),
    ]);
    let task = orchestrator
        .create_task("重复目录", "upload.zip", &archive, None)
        .await
        .unwrap();
    let report = orchestrator.start_task(task.id, ACTOR).await.unwrap();

    assert_eq!(report.task.status, TaskStatus::PartialSuccess);
    let catalog = report
        .details
        .iter()
        .find(|d| d.table_type == TableType::DrugCatalog)
        .unwrap();
    assert_eq!(catalog.status, DetailStatus::Failed);
    assert_eq!(catalog.import_status, StageStatus::Failed);
    assert_eq!(catalog.failed_rows, 10);
    assert_eq!(catalog.success_rows, 15);
    assert!(catalog.error_message.as_deref().unwrap().contains("批次写入失败"));

    let usage = report
        .details
        .iter()
        .find(|d| d.table_type == TableType::DrugUsage)
        .unwrap();
    assert_eq!(usage.status, DetailStatus::Success);
    assert_eq!(usage.success_rows, 12);
}

#[tokio::test]
async fn test_progress_is_rebuilt_after_cache_loss() {
    let env = TestEnv::new();
    let orchestrator = env.orchestrator().await;
    let task = orchestrator
        .create_task("进度", "upload.zip", &full_archive(8), None)
        .await
        .unwrap();
    orchestrator.start_task(task.id, ACTOR).await.unwrap();

    // 新缓存（原缓存丢失）
    let fresh = env.orchestrator().await;
    let progress = fresh.get_task_progress(task.id).await.unwrap();
    assert_eq!(progress.status, TaskStatus::Completed);
    assert_eq!(progress.progress_percent, 100);
    assert_eq!(progress.details.len(), 5);

    let detail = fresh
        .get_detail_progress(task.id, TableType::DrugInbound)
        .await
        .unwrap();
    assert_eq!(detail.total_rows, 8);
    assert_eq!(detail.progress_percent, 100);

    let missing = fresh.get_task_progress(9_999).await.unwrap_err();
    assert!(matches!(missing, TaskError::NotFound(_)));
}

#[tokio::test]
async fn test_start_requires_pending_task() {
    let env = TestEnv::new();
    let orchestrator = env.orchestrator().await;
    let task = orchestrator
        .create_task("重复启动", "药品目录.csv", catalog_csv(3).as_bytes(), None)
        .await
        .unwrap();
    orchestrator.start_task(task.id, ACTOR).await.unwrap();

    let err = orchestrator.start_task(task.id, ACTOR).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
}
