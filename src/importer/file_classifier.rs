// ==========================================
// 医院药品数据导入质控系统 - 文件类型识别
// ==========================================
// 规则: 先按文件名关键字匹配；未命中时按表头与各表必填列的吻合度匹配
// ==========================================

use crate::domain::types::TableType;
use std::path::Path;

/// 按关键字优先级排列（通用词靠后，避免 hospital_drug_usage 被识别为医院信息）
const MATCH_ORDER: [TableType; 5] = [
    TableType::DrugCatalog,
    TableType::DrugInbound,
    TableType::DrugOutbound,
    TableType::DrugUsage,
    TableType::HospitalInfo,
];

/// 支持的表格扩展名
pub const SPREADSHEET_EXTENSIONS: [&str; 3] = ["xlsx", "xls", "csv"];

pub struct FileTypeClassifier;

impl FileTypeClassifier {
    /// 是否为可解析的表格文件
    pub fn is_spreadsheet(file_name: &str) -> bool {
        let ext = extension_of(file_name);
        SPREADSHEET_EXTENSIONS.contains(&ext.as_str())
    }

    /// 按文件名识别
    pub fn classify_by_name(file_name: &str) -> Option<TableType> {
        let stem = Path::new(file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(file_name)
            .to_lowercase();

        MATCH_ORDER.into_iter().find(|table| {
            table
                .file_name_keywords()
                .iter()
                .any(|kw| stem.contains(&kw.to_lowercase()))
        })
    }

    /// 按表头识别：必填列全部命中的表中，取命中列数最多者
    pub fn classify_by_headers(headers: &[String]) -> Option<TableType> {
        let mut best: Option<(TableType, usize)> = None;

        for table in MATCH_ORDER {
            let schema = table.schema();
            let resolved: Vec<&str> = headers
                .iter()
                .filter_map(|h| schema.resolve_header(h))
                .collect();

            let all_required = schema
                .required_columns()
                .all(|c| resolved.contains(&c.name));
            if !all_required {
                continue;
            }

            let score = resolved.len();
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((table, score));
            }
        }

        best.map(|(table, _)| table)
    }

    /// 综合识别（文件名优先）
    pub fn classify(file_name: &str, headers: Option<&[String]>) -> Option<TableType> {
        Self::classify_by_name(file_name).or_else(|| headers.and_then(Self::classify_by_headers))
    }
}

/// 小写扩展名
pub fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}
