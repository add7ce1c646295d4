//! INFORMATION_SCHEMA queries for the two generations of H2 metadata.
//!
//! 1.x exposes H2 specific views (`TYPE_NAME`, `INDEXES.PRIMARY_KEY`), 2.x the
//! standard ones (`DATA_TYPE`, `INDEX_COLUMNS`, `KEY_COLUMN_USAGE`). Every query
//! returns its columns in the order the row converters below expect.

use crate::engine::sql_literal;
use crate::error::MigrateError;
use crate::metadata::{ColumnInfo, IndexColumnInfo, KeyColumnInfo, TableInfo, TableRef};
use crate::version::VersionRecord;

type Row = Vec<Option<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataDialect {
    Legacy,
    Modern,
}

impl MetadataDialect {
    pub fn for_version(record: &VersionRecord) -> Self {
        if record.major() >= 2 {
            MetadataDialect::Modern
        } else {
            MetadataDialect::Legacy
        }
    }

    pub fn catalogs_sql(&self) -> String {
        "SELECT DISTINCT CATALOG_NAME FROM INFORMATION_SCHEMA.SCHEMATA ORDER BY CATALOG_NAME".into()
    }

    pub fn schemas_sql(&self, catalog: &str) -> String {
        format!(
            "SELECT SCHEMA_NAME FROM INFORMATION_SCHEMA.SCHEMATA WHERE CATALOG_NAME = {} ORDER BY SCHEMA_NAME",
            sql_literal(catalog)
        )
    }

    pub fn tables_sql(&self, catalog: &str, schema: &str) -> String {
        format!(
            "SELECT TABLE_NAME, TABLE_TYPE, REMARKS FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_CATALOG = {} AND TABLE_SCHEMA = {} ORDER BY TABLE_NAME",
            sql_literal(catalog),
            sql_literal(schema)
        )
    }

    pub fn columns_sql(&self, table: &TableRef) -> String {
        let type_column = match self {
            MetadataDialect::Legacy => "TYPE_NAME",
            MetadataDialect::Modern => "DATA_TYPE",
        };
        format!(
            "SELECT COLUMN_NAME, ORDINAL_POSITION, {}, NUMERIC_PRECISION, NUMERIC_SCALE, IS_NULLABLE, COLUMN_DEFAULT \
             FROM INFORMATION_SCHEMA.COLUMNS WHERE {} ORDER BY ORDINAL_POSITION",
            type_column,
            table_filter("", table)
        )
    }

    pub fn index_columns_sql(&self, table: &TableRef) -> String {
        match self {
            MetadataDialect::Legacy => format!(
                "SELECT INDEX_NAME, NON_UNIQUE, ORDINAL_POSITION, COLUMN_NAME, ASC_OR_DESC \
                 FROM INFORMATION_SCHEMA.INDEXES WHERE {} ORDER BY INDEX_NAME, ORDINAL_POSITION",
                table_filter("", table)
            ),
            MetadataDialect::Modern => format!(
                "SELECT I.INDEX_NAME, \
                 CASE WHEN I.INDEX_TYPE_NAME IN ('PRIMARY KEY', 'UNIQUE INDEX') THEN FALSE ELSE TRUE END, \
                 C.ORDINAL_POSITION, C.COLUMN_NAME, \
                 CASE WHEN C.ORDERING_SPECIFICATION = 'DESC' THEN 'D' ELSE 'A' END \
                 FROM INFORMATION_SCHEMA.INDEXES I JOIN INFORMATION_SCHEMA.INDEX_COLUMNS C \
                 ON C.INDEX_CATALOG = I.INDEX_CATALOG AND C.INDEX_SCHEMA = I.INDEX_SCHEMA AND C.INDEX_NAME = I.INDEX_NAME \
                 WHERE {} ORDER BY I.INDEX_NAME, C.ORDINAL_POSITION",
                table_filter("I.", table)
            ),
        }
    }

    pub fn primary_key_sql(&self, table: &TableRef) -> String {
        match self {
            MetadataDialect::Legacy => format!(
                "SELECT INDEX_NAME, ORDINAL_POSITION, COLUMN_NAME FROM INFORMATION_SCHEMA.INDEXES \
                 WHERE {} AND PRIMARY_KEY = TRUE ORDER BY ORDINAL_POSITION",
                table_filter("", table)
            ),
            MetadataDialect::Modern => format!(
                "SELECT TC.CONSTRAINT_NAME, K.ORDINAL_POSITION, K.COLUMN_NAME \
                 FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS TC JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE K \
                 ON K.CONSTRAINT_CATALOG = TC.CONSTRAINT_CATALOG AND K.CONSTRAINT_SCHEMA = TC.CONSTRAINT_SCHEMA \
                 AND K.CONSTRAINT_NAME = TC.CONSTRAINT_NAME \
                 WHERE TC.CONSTRAINT_TYPE = 'PRIMARY KEY' AND {} ORDER BY K.ORDINAL_POSITION",
                table_filter("TC.", table)
            ),
        }
    }

    /// Maps the reported table type onto the JDBC names
    pub fn normalize_table_type(&self, schema: &str, reported: &str) -> String {
        let reported = reported.trim().to_ascii_uppercase();
        match (self, reported.as_str()) {
            (MetadataDialect::Modern, "BASE TABLE") if schema.eq_ignore_ascii_case("INFORMATION_SCHEMA") => {
                "SYSTEM TABLE".into()
            }
            (MetadataDialect::Modern, "BASE TABLE") => "TABLE".into(),
            _ => reported,
        }
    }

    pub fn to_tables(&self, schema: &str, rows: &[Row]) -> Result<Vec<TableInfo>, MigrateError> {
        rows.iter()
            .map(|row| {
                Ok(TableInfo {
                    name: required(row, 0, "TABLE_NAME")?,
                    table_type: self.normalize_table_type(schema, &required(row, 1, "TABLE_TYPE")?),
                    remarks: optional(row, 2).filter(|r| !r.is_empty()),
                })
            })
            .collect()
    }
}

fn table_filter(alias: &str, table: &TableRef) -> String {
    format!(
        "{a}TABLE_CATALOG = {} AND {a}TABLE_SCHEMA = {} AND {a}TABLE_NAME = {}",
        sql_literal(&table.catalog),
        sql_literal(&table.schema),
        sql_literal(&table.name),
        a = alias
    )
}

pub fn to_names(rows: &[Row]) -> Result<Vec<String>, MigrateError> {
    rows.iter().map(|row| required(row, 0, "NAME")).collect()
}

pub fn to_columns(rows: &[Row]) -> Result<Vec<ColumnInfo>, MigrateError> {
    rows.iter()
        .map(|row| {
            Ok(ColumnInfo {
                name: required(row, 0, "COLUMN_NAME")?,
                ordinal: parse_number(&required(row, 1, "ORDINAL_POSITION")?)?,
                type_name: required(row, 2, "DATA_TYPE")?,
                precision: optional(row, 3).map(|p| parse_number(&p)).transpose()?,
                scale: optional(row, 4).map(|s| parse_number(&s)).transpose()?,
                nullable: optional(row, 5).is_none_or(|n| n.eq_ignore_ascii_case("YES")),
                default: optional(row, 6),
            })
        })
        .collect()
}

pub fn to_index_columns(rows: &[Row]) -> Result<Vec<IndexColumnInfo>, MigrateError> {
    rows.iter()
        .map(|row| {
            Ok(IndexColumnInfo {
                index_name: required(row, 0, "INDEX_NAME")?,
                non_unique: parse_bool(&required(row, 1, "NON_UNIQUE")?)?,
                ordinal: parse_number(&required(row, 2, "ORDINAL_POSITION")?)?,
                column_name: required(row, 3, "COLUMN_NAME")?,
                ascending: optional(row, 4).and_then(|a| match a.to_ascii_uppercase().as_str() {
                    "A" => Some(true),
                    "D" => Some(false),
                    _ => None,
                }),
            })
        })
        .collect()
}

pub fn to_key_columns(rows: &[Row]) -> Result<Vec<KeyColumnInfo>, MigrateError> {
    rows.iter()
        .map(|row| {
            Ok(KeyColumnInfo {
                key_name: required(row, 0, "CONSTRAINT_NAME")?,
                ordinal: parse_number(&required(row, 1, "ORDINAL_POSITION")?)?,
                column_name: required(row, 2, "COLUMN_NAME")?,
            })
        })
        .collect()
}

fn optional(row: &Row, index: usize) -> Option<String> {
    row.get(index).cloned().flatten()
}

fn required(row: &Row, index: usize, name: &str) -> Result<String, MigrateError> {
    optional(row, index)
        .ok_or_else(|| MigrateError::Engine(format!("Metadata row is missing {name}")))
}

fn parse_number<T: std::str::FromStr>(text: &str) -> Result<T, MigrateError> {
    text.trim()
        .parse::<T>()
        .map_err(|_| MigrateError::Engine(format!("Expected a number in metadata, found '{text}'")))
}

fn parse_bool(text: &str) -> Result<bool, MigrateError> {
    match text.trim().to_ascii_uppercase().as_str() {
        "TRUE" | "1" => Ok(true),
        "FALSE" | "0" => Ok(false),
        other => Err(MigrateError::Engine(format!(
            "Expected a boolean in metadata, found '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::{BuildTags, Locator};

    fn s(v: &str) -> Option<String> {
        Some(v.to_owned())
    }

    #[test]
    fn test_dialect_for_version() {
        let tags = BuildTags::default();
        let legacy = VersionRecord::new(1, 4, 200, "", Locator::Bundled("a".into()), &tags).unwrap();
        let modern = VersionRecord::new(2, 0, 201, "", Locator::Bundled("b".into()), &tags).unwrap();
        assert_eq!(MetadataDialect::for_version(&legacy), MetadataDialect::Legacy);
        assert_eq!(MetadataDialect::for_version(&modern), MetadataDialect::Modern);
    }

    #[test]
    fn test_queries_differ_by_generation() {
        let table = TableRef::new("TEST", "PUBLIC", "O'Brien");
        let legacy = MetadataDialect::Legacy.columns_sql(&table);
        let modern = MetadataDialect::Modern.columns_sql(&table);
        assert!(legacy.contains("TYPE_NAME"));
        assert!(modern.contains("DATA_TYPE"));
        assert!(legacy.contains("TABLE_NAME = 'O''Brien'"));

        assert!(MetadataDialect::Legacy
            .primary_key_sql(&table)
            .contains("PRIMARY_KEY = TRUE"));
        assert!(MetadataDialect::Modern
            .index_columns_sql(&table)
            .contains("INDEX_COLUMNS"));
    }

    #[test]
    fn test_table_type_normalization() {
        let modern = MetadataDialect::Modern;
        assert_eq!(modern.normalize_table_type("PUBLIC", "BASE TABLE"), "TABLE");
        assert_eq!(
            modern.normalize_table_type("INFORMATION_SCHEMA", "BASE TABLE"),
            "SYSTEM TABLE"
        );
        assert_eq!(modern.normalize_table_type("PUBLIC", "VIEW"), "VIEW");
        assert_eq!(
            MetadataDialect::Legacy.normalize_table_type("PUBLIC", "system table"),
            "SYSTEM TABLE"
        );
    }

    #[test]
    fn test_row_conversion() {
        let columns = to_columns(&[vec![
            s("AMOUNT"),
            s("2"),
            s("DECIMAL"),
            s("65535"),
            s("32767"),
            s("NO"),
            None,
        ]])
        .unwrap();
        assert_eq!(columns[0].precision, Some(65535));
        assert_eq!(columns[0].scale, Some(32767));
        assert!(!columns[0].nullable);

        let index = to_index_columns(&[vec![s("IDX"), s("TRUE"), s("1"), s("A"), s("D")]]).unwrap();
        assert!(index[0].non_unique);
        assert_eq!(index[0].ascending, Some(false));

        assert!(to_columns(&[vec![s("X"), s("one")]]).is_err());
    }
}
