// ==========================================
// 医院药品数据导入质控系统 - 压缩包解压与归类
// ==========================================
// 支持: ZIP / 7z 压缩包，或单个 .xlsx/.xls/.csv 表格
// 约束: 压缩包大小与解压总量上限；拒绝嵌套压缩包；每种表类型只取第一份文件
// 跳过: __MACOSX/、隐藏文件、目录
// ==========================================

use crate::domain::types::{ImportType, TableType};
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::file_classifier::{extension_of, FileTypeClassifier};
use crate::importer::file_parser::UniversalFileParser;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use tracing::{debug, info, warn};

/// 视为嵌套压缩包的扩展名
const NESTED_ARCHIVE_EXTENSIONS: [&str; 7] = ["zip", "7z", "rar", "tar", "gz", "tgz", "bz2"];

/// 压缩包格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    SevenZ,
}

impl ArchiveFormat {
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        match extension_of(file_name).as_str() {
            "zip" => Some(ArchiveFormat::Zip),
            "7z" => Some(ArchiveFormat::SevenZ),
            _ => None,
        }
    }
}

/// 按上传文件名判断导入类型
pub fn detect_import_type(file_name: &str) -> ImportResult<ImportType> {
    if ArchiveFormat::from_file_name(file_name).is_some() {
        Ok(ImportType::Archive)
    } else if FileTypeClassifier::is_spreadsheet(file_name) {
        Ok(ImportType::SingleFile)
    } else {
        Err(ImportError::UnsupportedFormat(file_name.to_string()))
    }
}

/// 大小上限
#[derive(Debug, Clone, Copy)]
pub struct ArchiveLimits {
    pub max_archive_bytes: u64,
    pub max_uncompressed_bytes: u64,
}

/// 已归类的文件
#[derive(Debug, Clone)]
pub struct ExtractedFile {
    pub table_type: TableType,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// 解压结果
#[derive(Debug, Clone, Default)]
pub struct ExtractionResult {
    pub files: Vec<ExtractedFile>, // 按表类型排序
    pub unrecognized: Vec<String>,
    pub duplicates: Vec<String>,
    pub missing_types: Vec<TableType>,
}

impl ExtractionResult {
    pub fn table_types(&self) -> Vec<TableType> {
        self.files.iter().map(|f| f.table_type).collect()
    }
}

// 解压出的原始条目
struct ArchiveEntry {
    name: String,
    bytes: Vec<u8>,
}

pub struct ArchiveExtractor {
    limits: ArchiveLimits,
    parser: UniversalFileParser,
}

impl ArchiveExtractor {
    pub fn new(limits: ArchiveLimits) -> Self {
        Self {
            limits,
            parser: UniversalFileParser,
        }
    }

    /// 解压并归类
    ///
    /// # 参数
    /// - file_name: 上传时声明的文件名（决定格式）
    /// - data: 文件内容
    ///
    /// # 错误
    /// 归类错误（格式/大小/加密/损坏/空包/嵌套/缺少药品目录），此时不产生任何明细
    pub fn extract(&self, file_name: &str, data: &[u8]) -> ImportResult<ExtractionResult> {
        let size = data.len() as u64;
        if size > self.limits.max_archive_bytes {
            return Err(ImportError::Oversize {
                size,
                limit: self.limits.max_archive_bytes,
            });
        }

        match detect_import_type(file_name)? {
            ImportType::SingleFile => self.classify_single(file_name, data),
            ImportType::Archive => {
                let entries = match ArchiveFormat::from_file_name(file_name) {
                    Some(ArchiveFormat::Zip) => self.read_zip(data)?,
                    Some(ArchiveFormat::SevenZ) => self.read_7z(data)?,
                    None => return Err(ImportError::UnsupportedFormat(file_name.to_string())),
                };
                self.classify_entries(file_name, entries)
            }
        }
    }

    /// 单文件导入：文件本身即整个任务，不做药品目录必需检查
    fn classify_single(&self, file_name: &str, data: &[u8]) -> ImportResult<ExtractionResult> {
        let headers = self.parser.sniff_headers(file_name, data).ok();
        let table_type = FileTypeClassifier::classify(file_name, headers.as_deref())
            .ok_or_else(|| ImportError::UnrecognizedFile(file_name.to_string()))?;

        let mut result = ExtractionResult {
            files: vec![ExtractedFile {
                table_type,
                file_name: file_name.to_string(),
                bytes: data.to_vec(),
            }],
            ..Default::default()
        };
        result.missing_types = missing_types(&result.files);
        Ok(result)
    }

    fn read_zip(&self, data: &[u8]) -> ImportResult<Vec<ArchiveEntry>> {
        let mut archive = zip::ZipArchive::new(Cursor::new(data))?;
        let mut entries = Vec::new();
        let mut total: u64 = 0;

        for i in 0..archive.len() {
            let entry = archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().replace('\\', "/");
            if should_skip(&name) {
                debug!(entry = %name, "跳过系统/隐藏文件");
                continue;
            }
            check_nested(&name)?;

            self.check_uncompressed(total.saturating_add(entry.size()))?;

            // 声明大小不可信，按实际读取字节累计，并按剩余额度限流
            let remaining = self.limits.max_uncompressed_bytes.saturating_sub(total);
            let mut bytes = Vec::new();
            let read = entry
                .take(remaining + 1)
                .read_to_end(&mut bytes)
                .map_err(|e| ImportError::Corrupted(e.to_string()))?;
            total = total.saturating_add(read as u64);
            self.check_uncompressed(total)?;

            entries.push(ArchiveEntry { name, bytes });
        }
        Ok(entries)
    }

    fn read_7z(&self, data: &[u8]) -> ImportResult<Vec<ArchiveEntry>> {
        let mut entries = Vec::new();
        let mut total: u64 = 0;
        let mut rejected: Option<ImportError> = None;
        let limit = self.limits.max_uncompressed_bytes;

        sevenz_rust::decompress_with_extract_fn(Cursor::new(data), ".", |entry, reader, _| {
            if rejected.is_some() || entry.is_directory() {
                return Ok(true);
            }
            let name = entry.name().replace('\\', "/");
            if should_skip(&name) {
                return Ok(true);
            }
            if let Err(e) = check_nested(&name) {
                rejected = Some(e);
                return Ok(true);
            }

            let declared = total.saturating_add(entry.size());
            if declared > limit {
                rejected = Some(ImportError::Oversize { size: declared, limit });
                return Ok(true);
            }

            let mut bytes = Vec::new();
            let read = reader
                .take(limit.saturating_sub(total) + 1)
                .read_to_end(&mut bytes)?;
            total = total.saturating_add(read as u64);
            if total > limit {
                rejected = Some(ImportError::Oversize { size: total, limit });
                return Ok(true);
            }
            entries.push(ArchiveEntry { name, bytes });
            Ok(true)
        })
        .map_err(|e| {
            let msg = e.to_string();
            if msg.contains("password") || msg.contains("Password") || msg.contains("decrypt") {
                ImportError::PasswordProtected(msg)
            } else {
                ImportError::Corrupted(msg)
            }
        })?;

        match rejected {
            Some(e) => Err(e),
            None => Ok(entries),
        }
    }

    fn check_uncompressed(&self, total: u64) -> ImportResult<()> {
        if total > self.limits.max_uncompressed_bytes {
            return Err(ImportError::Oversize {
                size: total,
                limit: self.limits.max_uncompressed_bytes,
            });
        }
        Ok(())
    }

    fn classify_entries(
        &self,
        archive_name: &str,
        entries: Vec<ArchiveEntry>,
    ) -> ImportResult<ExtractionResult> {
        let mut matched: BTreeMap<TableType, ExtractedFile> = BTreeMap::new();
        let mut result = ExtractionResult::default();

        for entry in entries {
            let file_name = base_name(&entry.name).to_string();
            if !FileTypeClassifier::is_spreadsheet(&file_name) {
                result.unrecognized.push(file_name);
                continue;
            }

            let headers = self.parser.sniff_headers(&file_name, &entry.bytes).ok();
            let Some(table_type) = FileTypeClassifier::classify(&file_name, headers.as_deref())
            else {
                warn!(file_name = %file_name, "无法识别文件类型");
                result.unrecognized.push(file_name);
                continue;
            };

            if matched.contains_key(&table_type) {
                warn!(file_name = %file_name, table_type = %table_type, "重复的表类型文件，已忽略");
                result.duplicates.push(file_name);
                continue;
            }
            matched.insert(
                table_type,
                ExtractedFile {
                    table_type,
                    file_name,
                    bytes: entry.bytes,
                },
            );
        }

        if matched.is_empty() {
            return Err(ImportError::EmptyArchive(archive_name.to_string()));
        }

        result.files = matched.into_values().collect();
        result.missing_types = missing_types(&result.files);

        if let Some(mandatory) = result
            .missing_types
            .iter()
            .copied()
            .find(TableType::is_mandatory)
        {
            return Err(ImportError::MissingMandatoryFile(mandatory));
        }

        info!(
            archive = %archive_name,
            files = result.files.len(),
            unrecognized = result.unrecognized.len(),
            duplicates = result.duplicates.len(),
            "压缩包归类完成"
        );
        Ok(result)
    }
}

fn missing_types(files: &[ExtractedFile]) -> Vec<TableType> {
    TableType::ALL
        .into_iter()
        .filter(|t| !files.iter().any(|f| f.table_type == *t))
        .collect()
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn should_skip(path: &str) -> bool {
    path.split('/').any(|part| part == "__MACOSX") || base_name(path).starts_with('.')
}

fn check_nested(path: &str) -> ImportResult<()> {
    let ext = extension_of(path);
    if NESTED_ARCHIVE_EXTENSIONS.contains(&ext.as_str()) {
        return Err(ImportError::NestedArchive(path.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    const LIMITS: ArchiveLimits = ArchiveLimits {
        max_archive_bytes: 1024 * 1024,
        max_uncompressed_bytes: 1024 * 1024,
    };

    fn build_zip(files: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in files {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    const CATALOG: &str = "医疗机构代码,药品编码,药品名称\nH001,D001,阿莫西林\n";
    const USAGE: &str = "医疗机构代码,药品编码,使用日期,使用数量\nH001,D001,2024-01-01,2\n";

    #[test]
    fn test_extract_zip_orders_by_table_type() {
        let data = build_zip(&[
            ("data/药品使用.csv", USAGE),
            ("data/药品目录.csv", CATALOG),
            ("__MACOSX/data/._药品目录.csv", "x"),
            ("readme.txt", "说明"),
        ]);

        let result = ArchiveExtractor::new(LIMITS).extract("upload.zip", &data).unwrap();
        assert_eq!(
            result.table_types(),
            vec![TableType::DrugCatalog, TableType::DrugUsage]
        );
        assert_eq!(result.unrecognized, vec!["readme.txt".to_string()]);
        assert!(result.missing_types.contains(&TableType::HospitalInfo));
    }

    #[test]
    fn test_extract_missing_catalog_is_error() {
        let data = build_zip(&[("药品使用.csv", USAGE)]);
        let result = ArchiveExtractor::new(LIMITS).extract("upload.zip", &data);
        assert!(matches!(
            result,
            Err(ImportError::MissingMandatoryFile(TableType::DrugCatalog))
        ));
    }

    #[test]
    fn test_extract_duplicate_type_reported() {
        let data = build_zip(&[("药品目录.csv", CATALOG), ("药品目录2.csv", CATALOG)]);
        let result = ArchiveExtractor::new(LIMITS).extract("upload.zip", &data).unwrap();
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.duplicates, vec!["药品目录2.csv".to_string()]);
    }

    #[test]
    fn test_extract_rejects_nested_archive() {
        let data = build_zip(&[("药品目录.csv", CATALOG), ("inner.zip", "PK")]);
        let result = ArchiveExtractor::new(LIMITS).extract("upload.zip", &data);
        assert!(matches!(result, Err(ImportError::NestedArchive(_))));
    }

    #[test]
    fn test_extract_oversize_and_corrupted() {
        let small = ArchiveLimits {
            max_archive_bytes: 10,
            max_uncompressed_bytes: 10,
        };
        let data = build_zip(&[("药品目录.csv", CATALOG)]);
        assert!(matches!(
            ArchiveExtractor::new(small).extract("upload.zip", &data),
            Err(ImportError::Oversize { .. })
        ));

        assert!(matches!(
            ArchiveExtractor::new(LIMITS).extract("upload.zip", b"not a zip"),
            Err(ImportError::Corrupted(_))
        ));
    }

    #[test]
    fn test_extract_empty_and_unsupported() {
        let data = build_zip(&[("readme.txt", "x")]);
        assert!(matches!(
            ArchiveExtractor::new(LIMITS).extract("upload.zip", &data),
            Err(ImportError::EmptyArchive(_))
        ));
        assert!(matches!(
            ArchiveExtractor::new(LIMITS).extract("upload.rar", b"x"),
            Err(ImportError::UnsupportedFormat(_))
        ));
    }

    /// 将本地头与中央目录中的解压大小改写为 0
    fn zero_declared_sizes(mut data: Vec<u8>) -> Vec<u8> {
        let mut i = 0;
        while i + 4 <= data.len() {
            let signature = [data[i], data[i + 1], data[i + 2], data[i + 3]];
            match signature {
                [0x50, 0x4b, 0x03, 0x04] => {
                    data[i + 22..i + 26].fill(0);
                    i += 30;
                }
                [0x50, 0x4b, 0x01, 0x02] => {
                    data[i + 24..i + 28].fill(0);
                    i += 46;
                }
                _ => i += 1,
            }
        }
        data
    }

    #[test]
    fn test_extract_counts_actual_bytes_not_declared_sizes() {
        let content = "x".repeat(900);
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for name in ["a.csv", "b.csv", "c.csv"] {
            writer.start_file(name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        let data = zero_declared_sizes(writer.finish().unwrap().into_inner());

        let limits = ArchiveLimits {
            max_archive_bytes: 1024 * 1024,
            max_uncompressed_bytes: 1000,
        };
        match ArchiveExtractor::new(limits).extract("upload.zip", &data) {
            Err(ImportError::Oversize { size, limit }) => {
                assert_eq!(limit, 1000);
                assert!(size > 1000);
            }
            other => panic!("应为 Oversize: {:?}", other.map(|r| r.files.len())),
        }
    }

    #[test]
    fn test_extract_encrypted_zip_is_password_protected() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().with_aes_encryption(zip::AesMode::Aes256, "secret");
        writer.start_file("药品目录.csv", options).unwrap();
        writer.write_all(CATALOG.as_bytes()).unwrap();
        let data = writer.finish().unwrap().into_inner();

        let err = ArchiveExtractor::new(LIMITS)
            .extract("upload.zip", &data)
            .unwrap_err();
        assert!(matches!(err, ImportError::PasswordProtected(_)), "{}", err);
        assert!(err.is_classification_error());
    }

    fn build_7z(files: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = sevenz_rust::SevenZWriter::new(Cursor::new(Vec::new())).unwrap();
        for (name, content) in files {
            let mut entry = sevenz_rust::SevenZArchiveEntry::new();
            entry.name = name.to_string();
            entry.has_stream = true;
            writer.push_archive_entry(entry, Some(content.as_bytes())).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_extract_7z_archive() {
        let data = build_7z(&[
            ("上报/药品使用.csv", USAGE),
            ("上报/药品目录.csv", CATALOG),
            ("上报/.DS_Store", "x"),
        ]);

        let result = ArchiveExtractor::new(LIMITS).extract("upload.7z", &data).unwrap();
        assert_eq!(
            result.table_types(),
            vec![TableType::DrugCatalog, TableType::DrugUsage]
        );
        assert_eq!(result.files[0].file_name, "药品目录.csv");
        assert_eq!(result.files[0].bytes, CATALOG.as_bytes());

        let small = ArchiveLimits {
            max_archive_bytes: 1024 * 1024,
            max_uncompressed_bytes: 40,
        };
        assert!(matches!(
            ArchiveExtractor::new(small).extract("upload.7z", &data),
            Err(ImportError::Oversize { .. })
        ));
    }

    #[test]
    fn test_single_file_classified_by_headers() {
        let result = ArchiveExtractor::new(LIMITS)
            .extract("export_01.csv", USAGE.as_bytes())
            .unwrap();
        // 单文件不要求药品目录
        assert_eq!(result.table_types(), vec![TableType::DrugUsage]);
    }
}
