// ==========================================
// 医院药品数据导入质控系统 - 字段映射器
// ==========================================
// 职责: 表头 → 规范列名，必填校验 + 基础格式校验（整数/数值/日期）
// 输出: ImportRow（值已规范化），或逐字段的拒绝原因
// ==========================================

use crate::domain::record::{ImportRow, RawRow, RowRejection};
use crate::domain::table_schema::TableSchema;
use crate::domain::types::TableType;
use crate::importer::data_cleaner::DataCleaner;
use crate::importer::error::{ImportError, ImportResult};
use std::collections::HashMap;

/// 单表字段映射器（表头解析一次，逐行复用）
pub struct FieldMapper {
    schema: &'static TableSchema,
    // 原始表头 → 规范列名
    header_map: HashMap<String, &'static str>,
}

impl FieldMapper {
    /// 校验表头并建立映射
    ///
    /// # 错误
    /// - MissingRequiredColumns: 任一必填列无对应表头（整个明细失败）
    pub fn new(table_type: TableType, headers: &[String]) -> ImportResult<Self> {
        let schema = table_type.schema();
        let mut header_map = HashMap::new();
        for header in headers {
            if let Some(name) = schema.resolve_header(header) {
                // 同一规范列出现多次时取第一列
                if !header_map.values().any(|v| *v == name) {
                    header_map.insert(header.clone(), name);
                }
            }
        }

        let missing: Vec<&str> = schema
            .required_columns()
            .filter(|c| !header_map.values().any(|v| *v == c.name))
            .map(|c| c.name)
            .collect();
        if !missing.is_empty() {
            return Err(ImportError::MissingRequiredColumns(format!(
                "{}: {}",
                table_type.display_name(),
                missing.join(", ")
            )));
        }

        Ok(Self { schema, header_map })
    }

    pub fn table_type(&self) -> TableType {
        self.schema.table_type
    }

    /// 宽松投影：只做表头映射与空值归一，不做格式校验（预扫描统计用）
    pub fn project(&self, raw: &RawRow) -> ImportRow {
        let mut row = ImportRow::new(raw.row_number);
        for (header, value) in &raw.cells {
            if let (Some(name), Some(value)) = (
                self.header_map.get(header),
                DataCleaner::normalize_null(value),
            ) {
                row.values.insert(name.to_string(), value.to_string());
            }
        }
        row
    }

    /// 映射单行
    ///
    /// 同一行的所有字段问题一次性返回，不在首个错误处中断
    pub fn map_row(&self, raw: &RawRow) -> Result<ImportRow, Vec<RowRejection>> {
        let mut row = ImportRow::new(raw.row_number);
        let mut rejections = Vec::new();

        for (header, value) in &raw.cells {
            let Some(name) = self.header_map.get(header) else {
                continue;
            };
            let Some(value) = DataCleaner::normalize_null(value) else {
                continue;
            };
            let Some(column) = self.schema.column(name) else {
                continue;
            };
            match DataCleaner::normalize(value, column.kind) {
                Ok(normalized) => {
                    row.values.insert(name.to_string(), normalized);
                }
                Err(reason) => rejections.push(RowRejection {
                    row_number: raw.row_number,
                    field: Some(name.to_string()),
                    reason,
                }),
            }
        }

        for column in self.schema.required_columns() {
            let format_failed = rejections
                .iter()
                .any(|r| r.field.as_deref() == Some(column.name));
            if !row.values.contains_key(column.name) && !format_failed {
                rejections.push(RowRejection {
                    row_number: raw.row_number,
                    field: Some(column.name.to_string()),
                    reason: "必填字段为空".to_string(),
                });
            }
        }

        if rejections.is_empty() {
            Ok(row)
        } else {
            // 按列定义顺序输出，保证结果稳定
            rejections.sort_by_key(|r| {
                r.field
                    .as_deref()
                    .and_then(|f| self.schema.columns.iter().position(|c| c.name == f))
                    .unwrap_or(usize::MAX)
            });
            Err(rejections)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn raw(row_number: usize, pairs: &[(&str, &str)]) -> RawRow {
        RawRow {
            row_number,
            cells: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_missing_required_column_fails_detail() {
        let result = FieldMapper::new(TableType::DrugCatalog, &headers(&["医疗机构代码", "药品编码"]));
        match result {
            Err(ImportError::MissingRequiredColumns(msg)) => assert!(msg.contains("drug_name")),
            _ => panic!("缺少药品名称列应失败"),
        }
    }

    #[test]
    fn test_map_row_normalizes_values() {
        let mapper = FieldMapper::new(
            TableType::DrugInbound,
            &headers(&["医疗机构代码", "药品编码", "入库日期", "入库数量", "备注"]),
        )
        .unwrap();

        let row = mapper
            .map_row(&raw(
                3,
                &[
                    ("医疗机构代码", "H001"),
                    ("药品编码", "D001"),
                    ("入库日期", "2024/1/5"),
                    ("入库数量", "1,200"),
                    ("备注", "忽略"),
                ],
            ))
            .unwrap();

        assert_eq!(row.row_number, 3);
        assert_eq!(row.get("inbound_date"), Some("2024-01-05"));
        assert_eq!(row.get("quantity"), Some("1200"));
        assert_eq!(row.values.len(), 4);
    }

    #[test]
    fn test_map_row_collects_all_rejections() {
        let mapper = FieldMapper::new(
            TableType::DrugInbound,
            &headers(&["医疗机构代码", "药品编码", "入库日期", "入库数量"]),
        )
        .unwrap();

        let rejections = mapper
            .map_row(&raw(
                7,
                &[
                    ("医疗机构代码", "H001"),
                    ("药品编码", "NULL"),
                    ("入库日期", "bad"),
                    ("入库数量", "abc"),
                ],
            ))
            .unwrap_err();

        let fields: Vec<&str> = rejections.iter().filter_map(|r| r.field.as_deref()).collect();
        assert_eq!(fields, vec!["drug_code", "inbound_date", "quantity"]);
        assert!(rejections.iter().all(|r| r.row_number == 7));
    }

    #[test]
    fn test_project_keeps_unvalidated_values() {
        let mapper = FieldMapper::new(
            TableType::DrugInbound,
            &headers(&["医疗机构代码", "药品编码", "入库日期", "入库数量"]),
        )
        .unwrap();

        let row = mapper.project(&raw(
            2,
            &[
                ("医疗机构代码", "H001"),
                ("药品编码", " "),
                ("入库日期", "bad"),
                ("入库数量", "abc"),
            ],
        ));
        assert_eq!(row.get("drug_code"), None);
        assert_eq!(row.get("inbound_date"), Some("bad"));
        assert_eq!(row.get("quantity"), Some("abc"));
    }
}
