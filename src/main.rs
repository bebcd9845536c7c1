// ==========================================
// 医院药品数据导入质控系统 - 命令行入口
// ==========================================
// 用法: drug-import-qc <db_path> <file_path> [task_name]
// 流程: 建表 → 读取配置 → 创建任务 → 执行 → 输出任务与质控结果 (JSON)
// ==========================================

use anyhow::{bail, Context, Result};
use drug_import_qc::config::ConfigManager;
use drug_import_qc::db::{ensure_schema, open_sqlite_connection};
use drug_import_qc::engine::{CacheBackend, ImportOrchestrator, InMemoryCache};
use std::path::Path;
use std::sync::{Arc, Mutex};

const CLI_ACTOR: &str = "cli";

#[tokio::main]
async fn main() -> Result<()> {
    drug_import_qc::logging::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        bail!("用法: {} <db_path> <file_path> [task_name]", args[0]);
    }
    let db_path = &args[1];
    let file_path = Path::new(&args[2]);

    tracing::info!("==================================================");
    tracing::info!("{} v{}", drug_import_qc::APP_NAME, drug_import_qc::VERSION);
    tracing::info!("使用数据库: {}", db_path);
    tracing::info!("==================================================");

    let conn = open_sqlite_connection(db_path).context("打开数据库失败")?;
    ensure_schema(&conn).context("建表失败")?;
    let conn = Arc::new(Mutex::new(conn));

    let config = ConfigManager::from_connection(conn.clone())?;
    tracing::info!(config = %config.get_config_snapshot()?, "导入配置");
    let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCache::new());
    let orchestrator = ImportOrchestrator::from_config(conn, &config, cache).await?;
    orchestrator.connect().await?;

    let file_name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .context("无效的文件路径")?;
    let task_name = args.get(3).cloned().unwrap_or_else(|| file_name.clone());
    let bytes = std::fs::read(file_path)
        .with_context(|| format!("读取文件失败: {}", file_path.display()))?;

    let task = orchestrator
        .create_task(&task_name, &file_name, &bytes, Some(CLI_ACTOR))
        .await?;
    let report = orchestrator.start_task(task.id, CLI_ACTOR).await?;
    let findings = orchestrator.list_findings(task.id)?;

    let output = serde_json::json!({
        "task": report.task,
        "details": report.details,
        "ruleIssues": report.rule_issues,
        "findings": findings,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    orchestrator.disconnect().await?;
    Ok(())
}
