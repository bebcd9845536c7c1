// ==========================================
// 医院药品数据导入质控系统 - 领域类型定义
// ==========================================
// 对外契约: 所有状态枚举以整数编码持久化/输出
// ==========================================

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// 为整数编码枚举生成 serde 实现（序列化为 code）
macro_rules! impl_code_serde {
    ($($ty:ident),* $(,)?) => {
        $(
            impl Serialize for $ty {
                fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                    serializer.serialize_i32(self.code())
                }
            }

            impl<'de> Deserialize<'de> for $ty {
                fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                    let code = i32::deserialize(deserializer)?;
                    $ty::from_code(code).ok_or_else(|| {
                        serde::de::Error::custom(format!(
                            "{} 编码无效: {}",
                            stringify!($ty),
                            code
                        ))
                    })
                }
            }
        )*
    };
}

// ==========================================
// 表类型 (Table Type)
// ==========================================
// 固定五类目标数据集，顺序即处理顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableType {
    HospitalInfo, // 医院信息
    DrugCatalog,  // 药品目录
    DrugInbound,  // 药品入库
    DrugOutbound, // 药品出库
    DrugUsage,    // 药品使用
}

impl TableType {
    pub const ALL: [TableType; 5] = [
        TableType::HospitalInfo,
        TableType::DrugCatalog,
        TableType::DrugInbound,
        TableType::DrugOutbound,
        TableType::DrugUsage,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            TableType::HospitalInfo => "HOSPITAL_INFO",
            TableType::DrugCatalog => "DRUG_CATALOG",
            TableType::DrugInbound => "DRUG_INBOUND",
            TableType::DrugOutbound => "DRUG_OUTBOUND",
            TableType::DrugUsage => "DRUG_USAGE",
        }
    }

    /// 物理表名
    pub fn table_name(&self) -> &'static str {
        match self {
            TableType::HospitalInfo => "hospital_info",
            TableType::DrugCatalog => "drug_catalog",
            TableType::DrugInbound => "drug_inbound",
            TableType::DrugOutbound => "drug_outbound",
            TableType::DrugUsage => "drug_usage",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            TableType::HospitalInfo => "医院信息",
            TableType::DrugCatalog => "药品目录",
            TableType::DrugInbound => "药品入库",
            TableType::DrugOutbound => "药品出库",
            TableType::DrugUsage => "药品使用",
        }
    }

    /// 解析表类型（兼容 code 与物理表名，大小写不敏感）
    pub fn from_code(s: &str) -> Option<Self> {
        let normalized = s.trim().to_ascii_uppercase();
        TableType::ALL
            .into_iter()
            .find(|t| t.code() == normalized || t.table_name().eq_ignore_ascii_case(s.trim()))
    }

    /// 缺失即判定压缩包无效的必需类型
    pub fn is_mandatory(&self) -> bool {
        matches!(self, TableType::DrugCatalog)
    }

    /// 文件名关键字（按优先级匹配）
    pub fn file_name_keywords(&self) -> &'static [&'static str] {
        match self {
            TableType::HospitalInfo => &["医院信息", "机构信息", "医疗机构", "hospital_info", "hospital"],
            TableType::DrugCatalog => &["药品目录", "药品字典", "drug_catalog", "catalog"],
            TableType::DrugInbound => &["药品入库", "入库", "drug_inbound", "inbound"],
            TableType::DrugOutbound => &["药品出库", "出库", "drug_outbound", "outbound"],
            TableType::DrugUsage => &["药品使用", "用药", "使用", "drug_usage", "usage"],
        }
    }
}

impl fmt::Display for TableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ==========================================
// 任务总状态 (Task Status)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,        // 待处理
    Extracting,     // 解压中
    Importing,      // 导入中
    QcChecking,     // 质控中
    Completed,      // 全部成功
    Failed,         // 失败
    PartialSuccess, // 部分成功
}

impl TaskStatus {
    pub fn code(&self) -> i32 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Extracting => 1,
            TaskStatus::Importing => 2,
            TaskStatus::QcChecking => 3,
            TaskStatus::Completed => 4,
            TaskStatus::Failed => 5,
            TaskStatus::PartialSuccess => 6,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(TaskStatus::Pending),
            1 => Some(TaskStatus::Extracting),
            2 => Some(TaskStatus::Importing),
            3 => Some(TaskStatus::QcChecking),
            4 => Some(TaskStatus::Completed),
            5 => Some(TaskStatus::Failed),
            6 => Some(TaskStatus::PartialSuccess),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::PartialSuccess
        )
    }

    /// 允许取消的状态
    pub fn is_cancellable(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "PENDING"),
            TaskStatus::Extracting => write!(f, "EXTRACTING"),
            TaskStatus::Importing => write!(f, "IMPORTING"),
            TaskStatus::QcChecking => write!(f, "QC_CHECKING"),
            TaskStatus::Completed => write!(f, "COMPLETED"),
            TaskStatus::Failed => write!(f, "FAILED"),
            TaskStatus::PartialSuccess => write!(f, "PARTIAL_SUCCESS"),
        }
    }
}

// ==========================================
// 明细状态 (Detail Status)
// ==========================================
// 明细只有成功/失败两种终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetailStatus {
    Pending,
    Parsing,
    Importing,
    QcChecking,
    Success,
    Failed,
}

impl DetailStatus {
    pub fn code(&self) -> i32 {
        match self {
            DetailStatus::Pending => 0,
            DetailStatus::Parsing => 1,
            DetailStatus::Importing => 2,
            DetailStatus::QcChecking => 3,
            DetailStatus::Success => 4,
            DetailStatus::Failed => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(DetailStatus::Pending),
            1 => Some(DetailStatus::Parsing),
            2 => Some(DetailStatus::Importing),
            3 => Some(DetailStatus::QcChecking),
            4 => Some(DetailStatus::Success),
            5 => Some(DetailStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DetailStatus::Success | DetailStatus::Failed)
    }
}

impl fmt::Display for DetailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetailStatus::Pending => write!(f, "PENDING"),
            DetailStatus::Parsing => write!(f, "PARSING"),
            DetailStatus::Importing => write!(f, "IMPORTING"),
            DetailStatus::QcChecking => write!(f, "QC_CHECKING"),
            DetailStatus::Success => write!(f, "SUCCESS"),
            DetailStatus::Failed => write!(f, "FAILED"),
        }
    }
}

// ==========================================
// 子阶段状态 (Stage Status)
// ==========================================
// 用于 extract/parse/import/qc 子状态字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl StageStatus {
    pub fn code(&self) -> i32 {
        match self {
            StageStatus::Pending => 0,
            StageStatus::Processing => 1,
            StageStatus::Success => 2,
            StageStatus::Failed => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(StageStatus::Pending),
            1 => Some(StageStatus::Processing),
            2 => Some(StageStatus::Success),
            3 => Some(StageStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::Success | StageStatus::Failed)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "PENDING"),
            StageStatus::Processing => write!(f, "PROCESSING"),
            StageStatus::Success => write!(f, "SUCCESS"),
            StageStatus::Failed => write!(f, "FAILED"),
        }
    }
}

// ==========================================
// 导入类型 (Import Type)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportType {
    SingleFile, // 单个表格文件
    Archive,    // 压缩包
}

impl ImportType {
    pub fn code(&self) -> i32 {
        match self {
            ImportType::SingleFile => 1,
            ImportType::Archive => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(ImportType::SingleFile),
            2 => Some(ImportType::Archive),
            _ => None,
        }
    }
}

// ==========================================
// 质控规则类型 / 分类 / 级别
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleType {
    PreImport,  // 导入前（结构/全局校验）
    PostImport, // 导入后（跨表/逻辑校验）
}

impl RuleType {
    pub fn code(&self) -> i32 {
        match self {
            RuleType::PreImport => 1,
            RuleType::PostImport => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(RuleType::PreImport),
            2 => Some(RuleType::PostImport),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleCategory {
    Global, // 表级阈值
    Field,  // 字段级
    Logic,  // 逻辑/跨表
}

impl RuleCategory {
    pub fn code(&self) -> i32 {
        match self {
            RuleCategory::Global => 1,
            RuleCategory::Field => 2,
            RuleCategory::Logic => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(RuleCategory::Global),
            2 => Some(RuleCategory::Field),
            3 => Some(RuleCategory::Logic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorLevel {
    Error,   // 错误（判定明细质控失败）
    Warning, // 警告（仅记录）
}

impl ErrorLevel {
    pub fn code(&self) -> i32 {
        match self {
            ErrorLevel::Error => 1,
            ErrorLevel::Warning => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(ErrorLevel::Error),
            2 => Some(ErrorLevel::Warning),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorLevel::Error => write!(f, "ERROR"),
            ErrorLevel::Warning => write!(f, "WARNING"),
        }
    }
}

impl_code_serde!(
    TaskStatus,
    DetailStatus,
    StageStatus,
    ImportType,
    RuleType,
    RuleCategory,
    ErrorLevel,
);
