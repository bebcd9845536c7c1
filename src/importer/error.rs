// ==========================================
// 医院药品数据导入质控系统 - 导入模块错误类型
// ==========================================
// 工具: thiserror 派生宏
// 分类: 归类错误（快速失败）/ 结构错误（仅影响单个明细）/ 存储错误
// ==========================================

use crate::domain::types::TableType;
use crate::repository::error::RepositoryError;
use thiserror::Error;

/// 导入模块错误类型
#[derive(Error, Debug)]
pub enum ImportError {
    // ===== 压缩包/归类错误 =====
    #[error("文件格式不支持: {0}（仅支持 .zip/.7z 压缩包或 .xlsx/.xls/.csv 表格）")]
    UnsupportedFormat(String),

    #[error("文件过大: {size} 字节，上限 {limit} 字节")]
    Oversize { size: u64, limit: u64 },

    #[error("压缩包已加密，无法解压: {0}")]
    PasswordProtected(String),

    #[error("压缩包损坏: {0}")]
    Corrupted(String),

    #[error("压缩包为空: {0}")]
    EmptyArchive(String),

    #[error("不支持嵌套压缩包: {0}")]
    NestedArchive(String),

    #[error("缺少必需文件: {}", .0.display_name())]
    MissingMandatoryFile(TableType),

    #[error("无法识别文件类型: {0}")]
    UnrecognizedFile(String),

    // ===== 文件解析错误 =====
    #[error("文件不存在: {0}")]
    FileNotFound(String),

    #[error("文件读取失败: {0}")]
    FileReadError(String),

    #[error("Excel 解析失败: {0}")]
    ExcelParseError(String),

    #[error("CSV 解析失败: {0}")]
    CsvParseError(String),

    #[error("缺少必填列: {0}")]
    MissingRequiredColumns(String),

    // ===== 数据库错误 =====
    #[error("批次写入失败 (批次 {batch_no}): {message}")]
    BatchStorageError { batch_no: String, message: String },

    #[error("数据库查询失败: {0}")]
    DatabaseQueryError(String),

    // ===== 中止 =====
    #[error("{0}")]
    Interrupted(String),

    // ===== 通用错误 =====
    #[error("内部错误: {0}")]
    InternalError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ImportError {
    /// 归类错误：不产生任何明细，任务直接失败
    pub fn is_classification_error(&self) -> bool {
        matches!(
            self,
            ImportError::UnsupportedFormat(_)
                | ImportError::Oversize { .. }
                | ImportError::PasswordProtected(_)
                | ImportError::Corrupted(_)
                | ImportError::EmptyArchive(_)
                | ImportError::NestedArchive(_)
                | ImportError::MissingMandatoryFile(_)
                | ImportError::UnrecognizedFile(_)
        )
    }
}

// 实现 From<std::io::Error>
impl From<std::io::Error> for ImportError {
    fn from(err: std::io::Error) -> Self {
        ImportError::FileReadError(err.to_string())
    }
}

// 实现 From<csv::Error>
impl From<csv::Error> for ImportError {
    fn from(err: csv::Error) -> Self {
        ImportError::CsvParseError(err.to_string())
    }
}

// 实现 From<calamine::Error>
impl From<calamine::Error> for ImportError {
    fn from(err: calamine::Error) -> Self {
        ImportError::ExcelParseError(err.to_string())
    }
}

// 实现 From<zip::result::ZipError>
impl From<zip::result::ZipError> for ImportError {
    fn from(err: zip::result::ZipError) -> Self {
        use zip::result::ZipError;
        match err {
            ZipError::UnsupportedArchive(ZipError::PASSWORD_REQUIRED)
            | ZipError::InvalidPassword => ImportError::PasswordProtected(err.to_string()),
            other => ImportError::Corrupted(other.to_string()),
        }
    }
}

// 实现 From<rusqlite::Error>
impl From<rusqlite::Error> for ImportError {
    fn from(err: rusqlite::Error) -> Self {
        ImportError::DatabaseQueryError(err.to_string())
    }
}

// 实现 From<RepositoryError>（规则结果/行错误写入）
impl From<RepositoryError> for ImportError {
    fn from(err: RepositoryError) -> Self {
        ImportError::DatabaseQueryError(err.to_string())
    }
}

/// Result 类型别名
pub type ImportResult<T> = Result<T, ImportError>;
