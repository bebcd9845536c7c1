// ==========================================
// 医院药品数据导入质控系统 - 导入层
// ==========================================
// 职责: 压缩包解压归类 → 文件解析 → 字段映射/清洗 → 分批落库
// 支持: ZIP / 7z 压缩包，Excel (.xlsx/.xls)，CSV
// ==========================================

pub mod archive_extractor;
pub mod data_cleaner;
pub mod error;
pub mod field_mapper;
pub mod file_classifier;
pub mod file_parser;
pub mod row_importer;

// 重导出核心类型
pub use archive_extractor::{
    detect_import_type, ArchiveExtractor, ArchiveFormat, ArchiveLimits, ExtractedFile,
    ExtractionResult,
};
pub use data_cleaner::DataCleaner;
pub use error::{ImportError, ImportResult};
pub use field_mapper::FieldMapper;
pub use file_classifier::FileTypeClassifier;
pub use file_parser::{CsvParser, ExcelParser, FileParser, ParsedSheet, UniversalFileParser};
pub use row_importer::{
    BatchListener, FileImportReport, ImportJob, PreScan, RowFilter, RowImporter,
    RunProgress,
};
