// ==========================================
// 医院药品数据导入质控系统 - 行导入器
// ==========================================
// 职责: 单个已归类文件 → 目标数据表
// 流程:
// 1. 预扫描: 表头校验 + 总行数 + 导入前全局规则统计
// 2. 逐行: 字段映射/格式校验 → 导入前行级规则 → 攒批
// 3. 每批一个事务写入，失败只回滚本批；每批结束回调进度
// 约束: 结构错误（缺列/解析失败）返回 Err，由调用方判定明细失败
// ==========================================

use crate::domain::qc::QcFinding;
use crate::domain::record::{ImportRow, RowRejection};
use crate::domain::types::{RuleType, TableType};
use crate::engine::qc::{CrossTableLookup, QcRuleEngine, TableStats};
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::field_mapper::FieldMapper;
use crate::importer::file_parser::UniversalFileParser;
use crate::repository::{QcRuleRepository, RowOwner, TableDataRepository};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 行过滤
#[derive(Debug, Clone, PartialEq)]
pub enum RowFilter {
    All,
    /// 仅导入这些行（重试上一批次的失败行）
    Only(HashSet<usize>),
    /// 跳过这些行（续跑时跳过已落库/已拒绝行）
    Skip(HashSet<usize>),
}

impl RowFilter {
    pub fn accepts(&self, row_number: usize) -> bool {
        match self {
            RowFilter::All => true,
            RowFilter::Only(rows) => rows.contains(&row_number),
            RowFilter::Skip(rows) => !rows.contains(&row_number),
        }
    }
}

/// 单文件导入作业
#[derive(Debug, Clone)]
pub struct ImportJob {
    pub task_id: i64,
    pub detail_id: i64,
    pub table_type: TableType,
    pub file_path: PathBuf,
    pub batch_no: String,
    pub filter: RowFilter,
}

/// 本次运行的累计计数（不含历史基线）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunProgress {
    pub total_rows: usize,
    pub valid_rows: usize,
    pub success_rows: usize,
    pub failed_rows: usize,
}

/// 预扫描结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreScan {
    pub total_rows: usize,
}

/// 进度回调（每批结束、预扫描结束时调用；回调自身的失败不影响导入）
#[async_trait]
pub trait BatchListener: Send + Sync {
    async fn on_prescan(&self, scan: PreScan);
    async fn on_batch(&self, progress: RunProgress);

    /// 每批提交后检查；返回 Some 时停止导入，已提交批次保留
    fn stop_reason(&self) -> Option<String> {
        None
    }
}

/// 单文件导入报告
#[derive(Debug, Clone, Default)]
pub struct FileImportReport {
    pub progress: RunProgress,
    /// 通过过滤器、本次实际处理的行数
    pub attempted_rows: usize,
    pub rejections: Vec<RowRejection>,
    /// 导入前全局规则（表级）结果
    pub table_findings: Vec<QcFinding>,
    /// 导入前行级规则结果条数
    pub row_findings: usize,
    /// 首个批次写入失败的原因
    pub storage_error: Option<String>,
}

impl FileImportReport {
    /// 表级导入前规则是否出现 error 级结果
    pub fn has_table_errors(&self) -> bool {
        self.table_findings.iter().any(QcFinding::is_error)
    }
}

// ==========================================
// RowImporter
// ==========================================
pub struct RowImporter {
    data_repo: Arc<TableDataRepository>,
    rule_repo: Arc<QcRuleRepository>,
    batch_size: usize,
}

impl RowImporter {
    pub fn new(
        data_repo: Arc<TableDataRepository>,
        rule_repo: Arc<QcRuleRepository>,
        batch_size: usize,
    ) -> Self {
        Self {
            data_repo,
            rule_repo,
            batch_size: batch_size.max(1),
        }
    }

    /// 导入单个文件
    ///
    /// # 错误
    /// - MissingRequiredColumns / 解析错误: 结构错误，整个明细失败
    /// - 质控结果/行错误写入失败
    ///
    /// 批次写入失败不返回 Err：该批行计为失败，原因记入 storage_error
    pub async fn import_file(
        &self,
        job: &ImportJob,
        engine: &QcRuleEngine,
        lookup: &dyn CrossTableLookup,
        listener: &dyn BatchListener,
    ) -> ImportResult<FileImportReport> {
        let parser = UniversalFileParser;
        let stage = RuleType::PreImport;
        let mut report = FileImportReport::default();

        // ===== 阶段 1: 预扫描 =====
        let sheet = parser.open(&job.file_path)?;
        let mapper = FieldMapper::new(job.table_type, &sheet.headers)?;
        let with_stats = engine.has_global_rules(stage, job.table_type);
        let mut stats = TableStats::new(engine.duplicate_columns(stage, job.table_type));
        for raw in sheet.rows {
            let raw = raw?;
            report.progress.total_rows += 1;
            if with_stats {
                stats.observe(&mapper.project(&raw));
            }
        }
        listener
            .on_prescan(PreScan {
                total_rows: report.progress.total_rows,
            })
            .await;
        debug!(
            detail_id = job.detail_id,
            table_type = job.table_type.code(),
            total_rows = report.progress.total_rows,
            "预扫描完成"
        );

        if with_stats {
            report.table_findings = engine.evaluate_table(stage, job.table_type, &stats, lookup);
            self.rule_repo.insert_findings(
                job.task_id,
                Some(job.detail_id),
                stage,
                &report.table_findings,
            )?;
            if report.has_table_errors() {
                warn!(
                    detail_id = job.detail_id,
                    table_type = job.table_type.code(),
                    "导入前全局规则未通过"
                );
            }
        }

        // ===== 阶段 2/3: 逐行校验 + 分批写入 =====
        let check_rows = engine.has_row_rules(stage, job.table_type);
        let owner = RowOwner {
            task_id: job.task_id,
            detail_id: job.detail_id,
            batch_no: &job.batch_no,
        };
        let mut chunk = Chunk::default();

        let sheet = parser.open(&job.file_path)?;
        for raw in sheet.rows {
            let raw = raw?;
            if !job.filter.accepts(raw.row_number) {
                continue;
            }
            report.attempted_rows += 1;
            chunk.seen += 1;

            match mapper.map_row(&raw) {
                Ok(row) => {
                    let mut rejected = false;
                    if check_rows {
                        let findings = engine.evaluate_row(stage, job.table_type, &row, lookup);
                        for finding in findings.iter().filter(|f| f.is_error()) {
                            chunk.rejections.push(RowRejection {
                                row_number: row.row_number,
                                field: finding.field_name.clone(),
                                reason: finding.message.clone(),
                            });
                            rejected = true;
                        }
                        chunk.findings.extend(findings);
                    }
                    if rejected {
                        chunk.failed += 1;
                    } else {
                        report.progress.valid_rows += 1;
                        chunk.rows.push(row);
                    }
                }
                Err(rejections) => {
                    chunk.failed += 1;
                    chunk.rejections.extend(rejections);
                }
            }

            if chunk.seen >= self.batch_size {
                self.flush(job, owner, &mut chunk, &mut report)?;
                listener.on_batch(report.progress).await;
                if let Some(reason) = listener.stop_reason() {
                    info!(
                        detail_id = job.detail_id,
                        batch_no = %job.batch_no,
                        success = report.progress.success_rows,
                        reason = %reason,
                        "导入中止"
                    );
                    return Err(ImportError::Interrupted(reason));
                }
            }
        }
        if chunk.seen > 0 {
            self.flush(job, owner, &mut chunk, &mut report)?;
            listener.on_batch(report.progress).await;
        }

        info!(
            detail_id = job.detail_id,
            table_type = job.table_type.code(),
            batch_no = %job.batch_no,
            attempted = report.attempted_rows,
            success = report.progress.success_rows,
            failed = report.progress.failed_rows,
            "文件导入完成"
        );
        Ok(report)
    }

    /// 写入一批并清空缓冲
    fn flush(
        &self,
        job: &ImportJob,
        owner: RowOwner<'_>,
        chunk: &mut Chunk,
        report: &mut FileImportReport,
    ) -> ImportResult<()> {
        let mut chunk = std::mem::take(chunk);

        match self.data_repo.insert_batch(job.table_type, owner, &chunk.rows) {
            Ok(written) => report.progress.success_rows += written,
            Err(e) => {
                let reason = format!("批次写入失败: {}", e);
                warn!(
                    detail_id = job.detail_id,
                    batch_no = %job.batch_no,
                    rows = chunk.rows.len(),
                    error = %e,
                    "批次写入失败，本批回滚"
                );
                chunk.failed += chunk.rows.len();
                chunk
                    .rejections
                    .extend(chunk.rows.iter().map(|row| RowRejection {
                        row_number: row.row_number,
                        field: None,
                        reason: reason.clone(),
                    }));
                report.storage_error.get_or_insert(reason);
            }
        }
        report.progress.failed_rows += chunk.failed;

        chunk.rejections.sort_by_key(|r| r.row_number);
        self.data_repo.record_row_errors(owner, &chunk.rejections)?;
        self.rule_repo.insert_findings(
            job.task_id,
            Some(job.detail_id),
            RuleType::PreImport,
            &chunk.findings,
        )?;
        report.row_findings += chunk.findings.len();
        report.rejections.append(&mut chunk.rejections);
        Ok(())
    }
}

/// 当前批次缓冲
#[derive(Default)]
struct Chunk {
    seen: usize,
    failed: usize,
    rows: Vec<ImportRow>,
    rejections: Vec<RowRejection>,
    findings: Vec<QcFinding>,
}
