// ==========================================
// 医院药品数据导入质控系统 - 文件解析器实现
// ==========================================
// 支持: Excel (.xlsx/.xls) / CSV (.csv)
// 约束: 逐行产出记录，CSV 从磁盘流式读取，不整体载入
// ==========================================

use crate::domain::record::RawRow;
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::file_classifier::extension_of;
use calamine::{Data, Range, Reader, Xls, Xlsx};
use csv::ReaderBuilder;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek};
use std::path::Path;

/// 行迭代器
pub type RowIter = Box<dyn Iterator<Item = ImportResult<RawRow>> + Send>;

/// 打开后的工作表：表头 + 行流
pub struct ParsedSheet {
    pub headers: Vec<String>,
    pub rows: RowIter,
}

// ==========================================
// FileParser Trait
// ==========================================
pub trait FileParser: Send + Sync {
    /// 打开文件，返回表头与行迭代器
    fn open(&self, file_path: &Path) -> ImportResult<ParsedSheet>;
}

// ==========================================
// CSV Parser 实现
// ==========================================
pub struct CsvParser;

impl CsvParser {
    fn sheet_from_reader<R: Read + Send + 'static>(reader: R) -> ImportResult<ParsedSheet> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true) // 允许行长度不一致
            .from_reader(reader);

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(clean_header)
            .collect();

        if headers.iter().all(|h| h.is_empty()) {
            return Err(ImportError::CsvParseError("CSV 文件无表头".to_string()));
        }

        let row_headers = headers.clone();
        let rows = reader
            .into_records()
            .enumerate()
            .filter_map(move |(idx, result)| match result {
                Ok(record) => {
                    let cells = zip_cells(&row_headers, record.iter());
                    // 跳过完全空白的行
                    if cells.values().all(|v| v.is_empty()) {
                        None
                    } else {
                        Some(Ok(RawRow {
                            row_number: idx + 1,
                            cells,
                        }))
                    }
                }
                Err(e) => Some(Err(ImportError::CsvParseError(format!(
                    "第 {} 行: {}",
                    idx + 1,
                    e
                )))),
            });

        Ok(ParsedSheet {
            headers,
            rows: Box::new(rows),
        })
    }
}

impl FileParser for CsvParser {
    fn open(&self, file_path: &Path) -> ImportResult<ParsedSheet> {
        if !file_path.exists() {
            return Err(ImportError::FileNotFound(file_path.display().to_string()));
        }
        let file = File::open(file_path)?;
        Self::sheet_from_reader(BufReader::new(file))
    }
}

// ==========================================
// Excel Parser 实现
// ==========================================
pub struct ExcelParser;

impl ExcelParser {
    fn sheet_from_reader<RS: Read + Seek>(reader: RS, ext: &str) -> ImportResult<ParsedSheet> {
        let range = match ext {
            "xls" => {
                let mut workbook: Xls<RS> =
                    Xls::new(reader).map_err(|e| ImportError::ExcelParseError(e.to_string()))?;
                first_sheet_range(&mut workbook)?
            }
            _ => {
                let mut workbook: Xlsx<RS> =
                    Xlsx::new(reader).map_err(|e| ImportError::ExcelParseError(e.to_string()))?;
                first_sheet_range(&mut workbook)?
            }
        };
        sheet_from_range(range)
    }
}

impl FileParser for ExcelParser {
    fn open(&self, file_path: &Path) -> ImportResult<ParsedSheet> {
        if !file_path.exists() {
            return Err(ImportError::FileNotFound(file_path.display().to_string()));
        }
        let ext = extension_of(&file_path.to_string_lossy());
        if ext != "xlsx" && ext != "xls" {
            return Err(ImportError::UnsupportedFormat(ext));
        }
        let file = BufReader::new(File::open(file_path)?);
        Self::sheet_from_reader(file, &ext)
    }
}

/// 读取第一个工作表
fn first_sheet_range<RS, R>(workbook: &mut R) -> ImportResult<Range<Data>>
where
    RS: Read + Seek,
    R: Reader<RS>,
    R::Error: std::fmt::Display,
{
    let sheet_names = workbook.sheet_names();
    let sheet_name = sheet_names
        .first()
        .cloned()
        .ok_or_else(|| ImportError::ExcelParseError("Excel 文件无工作表".to_string()))?;

    workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| ImportError::ExcelParseError(e.to_string()))
}

/// 工作表 → 行流（迭代器持有 Range，按行号逐行取值）
fn sheet_from_range(range: Range<Data>) -> ImportResult<ParsedSheet> {
    let (height, width) = range.get_size();
    if height == 0 {
        return Err(ImportError::ExcelParseError("Excel 文件无数据行".to_string()));
    }

    let headers: Vec<String> = (0..width)
        .map(|col| {
            range
                .get((0, col))
                .map(|cell| clean_header(&cell.to_string()))
                .unwrap_or_default()
        })
        .collect();

    let row_headers = headers.clone();
    let rows = (1..height).filter_map(move |row| {
        let mut cells = HashMap::new();
        for (col, header) in row_headers.iter().enumerate() {
            if header.is_empty() {
                continue;
            }
            let value = range
                .get((row, col))
                .map(|cell| cell.to_string().trim().to_string())
                .unwrap_or_default();
            cells.insert(header.clone(), value);
        }
        // 跳过完全空白的行
        if cells.values().all(|v| v.is_empty()) {
            None
        } else {
            Some(Ok(RawRow {
                row_number: row,
                cells,
            }))
        }
    });

    Ok(ParsedSheet {
        headers,
        rows: Box::new(rows),
    })
}

fn clean_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}').trim().to_string()
}

fn zip_cells<'a>(
    headers: &[String],
    values: impl Iterator<Item = &'a str>,
) -> HashMap<String, String> {
    let mut cells = HashMap::new();
    for (header, value) in headers.iter().zip(values) {
        if !header.is_empty() {
            cells.insert(header.clone(), value.trim().to_string());
        }
    }
    cells
}

// ==========================================
// 通用文件解析器（根据扩展名自动选择）
// ==========================================
pub struct UniversalFileParser;

impl UniversalFileParser {
    pub fn open<P: AsRef<Path>>(&self, file_path: P) -> ImportResult<ParsedSheet> {
        let path = file_path.as_ref();
        match extension_of(&path.to_string_lossy()).as_str() {
            "csv" => CsvParser.open(path),
            "xlsx" | "xls" => ExcelParser.open(path),
            ext => Err(ImportError::UnsupportedFormat(ext.to_string())),
        }
    }

    /// 从内存读取表头（压缩包内按表头识别文件类型时使用）
    pub fn sniff_headers(&self, file_name: &str, data: &[u8]) -> ImportResult<Vec<String>> {
        let ext = extension_of(file_name);
        let sheet = match ext.as_str() {
            "csv" => CsvParser::sheet_from_reader(Cursor::new(data.to_vec()))?,
            "xlsx" | "xls" => ExcelParser::sheet_from_reader(Cursor::new(data), &ext)?,
            _ => return Err(ImportError::UnsupportedFormat(ext)),
        };
        Ok(sheet.headers)
    }
}
