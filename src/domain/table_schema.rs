// ==========================================
// 医院药品数据导入质控系统 - 目标表结构目录
// ==========================================
// 职责: 五类目标表的列定义（规范列名/表头别名/必填/类型）
// 用途: 表头映射、基础格式校验、建表 DDL、按表头识别文件类型
// ==========================================

use crate::domain::types::TableType;

/// 列类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Decimal,
    Date, // 统一存储为 YYYY-MM-DD
}

impl ColumnKind {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnKind::Text | ColumnKind::Date => "TEXT",
            ColumnKind::Integer => "INTEGER",
            ColumnKind::Decimal => "REAL",
        }
    }
}

/// 列定义
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub required: bool,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    const fn new(
        name: &'static str,
        aliases: &'static [&'static str],
        required: bool,
        kind: ColumnKind,
    ) -> Self {
        Self {
            name,
            aliases,
            required,
            kind,
        }
    }

    /// 表头是否命中本列（规范名或任一别名，忽略首尾空白与大小写）
    pub fn matches_header(&self, header: &str) -> bool {
        let header = header.trim();
        header.eq_ignore_ascii_case(self.name) || self.aliases.iter().any(|a| *a == header)
    }
}

/// 表结构
#[derive(Debug)]
pub struct TableSchema {
    pub table_type: TableType,
    pub columns: &'static [ColumnSpec],
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn required_columns(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns.iter().filter(|c| c.required)
    }

    /// 表头 → 规范列名
    pub fn resolve_header(&self, header: &str) -> Option<&'static str> {
        self.columns
            .iter()
            .find(|c| c.matches_header(header))
            .map(|c| c.name)
    }
}

use ColumnKind::{Date, Decimal, Integer, Text};

const HOSPITAL_CODE: ColumnSpec = ColumnSpec::new(
    "hospital_code",
    &["医疗机构代码", "机构代码", "医院编码", "医院代码"],
    true,
    Text,
);
const DRUG_CODE: ColumnSpec =
    ColumnSpec::new("drug_code", &["药品编码", "药品代码", "院内药品编码"], true, Text);

static HOSPITAL_INFO_COLUMNS: [ColumnSpec; 6] = [
    HOSPITAL_CODE,
    ColumnSpec::new("hospital_name", &["医疗机构名称", "机构名称", "医院名称"], true, Text),
    ColumnSpec::new("hospital_level", &["医院等级", "机构等级"], false, Text),
    ColumnSpec::new("region_code", &["行政区划代码", "区划代码"], false, Text),
    ColumnSpec::new("bed_count", &["床位数", "编制床位数"], false, Integer),
    ColumnSpec::new("report_date", &["上报日期", "填报日期"], false, Date),
];

static DRUG_CATALOG_COLUMNS: [ColumnSpec; 10] = [
    HOSPITAL_CODE,
    DRUG_CODE,
    ColumnSpec::new("drug_name", &["药品名称", "药品商品名"], true, Text),
    ColumnSpec::new("generic_name", &["通用名", "药品通用名"], false, Text),
    ColumnSpec::new("specification", &["规格", "药品规格"], false, Text),
    ColumnSpec::new("dosage_form", &["剂型"], false, Text),
    ColumnSpec::new("manufacturer", &["生产企业", "生产厂家"], false, Text),
    ColumnSpec::new("unit", &["单位", "包装单位"], false, Text),
    ColumnSpec::new("unit_price", &["单价", "零售价"], false, Decimal),
    ColumnSpec::new("national_code", &["国家药品编码", "国家医保编码"], false, Text),
];

static DRUG_INBOUND_COLUMNS: [ColumnSpec; 8] = [
    HOSPITAL_CODE,
    DRUG_CODE,
    ColumnSpec::new("inbound_date", &["入库日期", "入库时间"], true, Date),
    ColumnSpec::new("quantity", &["入库数量", "数量"], true, Decimal),
    ColumnSpec::new("batch_number", &["批号", "生产批号"], false, Text),
    ColumnSpec::new("unit_price", &["单价", "进价"], false, Decimal),
    ColumnSpec::new("amount", &["金额", "入库金额"], false, Decimal),
    ColumnSpec::new("supplier", &["供应商", "配送企业"], false, Text),
];

static DRUG_OUTBOUND_COLUMNS: [ColumnSpec; 6] = [
    HOSPITAL_CODE,
    DRUG_CODE,
    ColumnSpec::new("outbound_date", &["出库日期", "出库时间"], true, Date),
    ColumnSpec::new("quantity", &["出库数量", "数量"], true, Decimal),
    ColumnSpec::new("department", &["领用科室", "科室"], false, Text),
    ColumnSpec::new("amount", &["金额", "出库金额"], false, Decimal),
];

static DRUG_USAGE_COLUMNS: [ColumnSpec; 8] = [
    HOSPITAL_CODE,
    DRUG_CODE,
    ColumnSpec::new("usage_date", &["使用日期", "用药日期"], true, Date),
    ColumnSpec::new("quantity", &["使用数量", "数量"], true, Decimal),
    ColumnSpec::new("department", &["科室", "开单科室"], false, Text),
    ColumnSpec::new("patient_type", &["患者类型", "就诊类型"], false, Text),
    ColumnSpec::new("prescription_no", &["处方号", "处方编号"], false, Text),
    ColumnSpec::new("amount", &["金额", "使用金额"], false, Decimal),
];

static HOSPITAL_INFO_SCHEMA: TableSchema = TableSchema {
    table_type: TableType::HospitalInfo,
    columns: &HOSPITAL_INFO_COLUMNS,
};
static DRUG_CATALOG_SCHEMA: TableSchema = TableSchema {
    table_type: TableType::DrugCatalog,
    columns: &DRUG_CATALOG_COLUMNS,
};
static DRUG_INBOUND_SCHEMA: TableSchema = TableSchema {
    table_type: TableType::DrugInbound,
    columns: &DRUG_INBOUND_COLUMNS,
};
static DRUG_OUTBOUND_SCHEMA: TableSchema = TableSchema {
    table_type: TableType::DrugOutbound,
    columns: &DRUG_OUTBOUND_COLUMNS,
};
static DRUG_USAGE_SCHEMA: TableSchema = TableSchema {
    table_type: TableType::DrugUsage,
    columns: &DRUG_USAGE_COLUMNS,
};

impl TableType {
    pub fn schema(&self) -> &'static TableSchema {
        match self {
            TableType::HospitalInfo => &HOSPITAL_INFO_SCHEMA,
            TableType::DrugCatalog => &DRUG_CATALOG_SCHEMA,
            TableType::DrugInbound => &DRUG_INBOUND_SCHEMA,
            TableType::DrugOutbound => &DRUG_OUTBOUND_SCHEMA,
            TableType::DrugUsage => &DRUG_USAGE_SCHEMA,
        }
    }
}
