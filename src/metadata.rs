//! Point-in-time snapshot of a database's structure:
//! catalog → schema → table → columns, indexes and primary key.

use std::collections::BTreeMap;

use log::{debug, trace, Level};
use logging_timer::timer;
use serde::Serialize;

use crate::error::MigrateError;

// ==================================================================================
// Raw metadata as reported by a connection
// ==================================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRef {
    pub catalog: String,
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(catalog: &str, schema: &str, name: &str) -> Self {
        TableRef {
            catalog: catalog.to_owned(),
            schema: schema.to_owned(),
            name: name.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    /// Normalized to the JDBC names: `TABLE`, `SYSTEM TABLE`, `VIEW`, ...
    pub table_type: String,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub ordinal: u32,
    pub type_name: String,
    pub precision: Option<u64>,
    pub scale: Option<u64>,
    pub nullable: bool,
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexColumnInfo {
    pub index_name: String,
    pub non_unique: bool,
    pub ordinal: u32,
    pub column_name: String,
    pub ascending: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyColumnInfo {
    pub key_name: String,
    pub ordinal: u32,
    pub column_name: String,
}

/// Structural queries a connection answers, in the spirit of JDBC's
/// `DatabaseMetaData`. Index information may be approximate.
pub trait MetadataSource {
    fn catalogs(&mut self) -> Result<Vec<String>, MigrateError>;
    fn schemas(&mut self, catalog: &str) -> Result<Vec<String>, MigrateError>;
    fn tables(&mut self, catalog: &str, schema: &str) -> Result<Vec<TableInfo>, MigrateError>;
    fn columns(&mut self, table: &TableRef) -> Result<Vec<ColumnInfo>, MigrateError>;
    fn index_columns(&mut self, table: &TableRef) -> Result<Vec<IndexColumnInfo>, MigrateError>;
    fn primary_key(&mut self, table: &TableRef) -> Result<Vec<KeyColumnInfo>, MigrateError>;
}

// ==================================================================================
// The schema tree
// ==================================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Catalog {
    pub name: String,
    /// Keyed by upper case schema name
    pub schemas: BTreeMap<String, Schema>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Schema {
    pub name: String,
    /// Keyed by upper case table name
    pub tables: BTreeMap<String, Table>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Table {
    pub table: TableRef,
    pub table_type: String,
    pub remarks: Option<String>,
    /// In ordinal order
    pub columns: Vec<ColumnInfo>,
    /// Keyed by upper case index name
    pub indexes: BTreeMap<String, Index>,
    pub primary_key: Option<PrimaryKey>,
}

impl Table {
    /// Ordinary and system tables carry indexes and keys; views, temporary
    /// tables, aliases and synonyms don't.
    pub fn has_indexes(table_type: &str) -> bool {
        matches!(table_type.to_ascii_uppercase().as_str(), "TABLE" | "SYSTEM TABLE")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Index {
    pub name: String,
    pub non_unique: bool,
    /// Keyed by position within the index
    pub columns: BTreeMap<u32, IndexColumn>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexColumn {
    pub name: String,
    pub ascending: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrimaryKey {
    pub name: String,
    /// Column names in key order
    pub columns: Vec<String>,
}

/// The whole snapshot, keyed by upper case catalog name
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetaData {
    pub catalogs: BTreeMap<String, Catalog>,
}

impl MetaData {
    /// Walks catalogs, their schemas, their tables and each table's columns.
    /// Indexes and the primary key are read only for ordinary and system tables.
    pub fn build<S: MetadataSource + ?Sized>(source: &mut S) -> Result<Self, MigrateError> {
        let _tmr = timer!(Level::Debug; "MetaData.build");

        let mut catalog_names = source.catalogs()?;
        if catalog_names.is_empty() {
            // Databases without catalog support report their objects under ""
            catalog_names.push(String::new());
        }

        let mut meta = MetaData::default();
        for catalog_name in catalog_names {
            let mut catalog = Catalog {
                name: catalog_name.clone(),
                schemas: BTreeMap::new(),
            };

            for schema_name in source.schemas(&catalog_name)? {
                let mut schema = Schema {
                    name: schema_name.clone(),
                    tables: BTreeMap::new(),
                };

                for info in source.tables(&catalog_name, &schema_name)? {
                    let table = Self::build_table(source, &catalog_name, &schema_name, info)?;
                    schema.tables.insert(table.table.name.to_uppercase(), table);
                }

                debug!(
                    "Schema {}.{}: {} tables",
                    catalog_name,
                    schema_name,
                    schema.tables.len()
                );
                catalog.schemas.insert(schema_name.to_uppercase(), schema);
            }

            meta.catalogs.insert(catalog_name.to_uppercase(), catalog);
        }

        Ok(meta)
    }

    fn build_table<S: MetadataSource + ?Sized>(
        source: &mut S,
        catalog: &str,
        schema: &str,
        info: TableInfo,
    ) -> Result<Table, MigrateError> {
        let table_ref = TableRef::new(catalog, schema, &info.name);
        trace!("Reading table {}.{}.{}", catalog, schema, info.name);

        let mut columns = source.columns(&table_ref)?;
        columns.sort_by_key(|c| c.ordinal);

        let mut indexes = BTreeMap::new();
        let mut primary_key = None;

        if Table::has_indexes(&info.table_type) {
            for ic in source.index_columns(&table_ref)? {
                let index = indexes
                    .entry(ic.index_name.to_uppercase())
                    .or_insert_with(|| Index {
                        name: ic.index_name.clone(),
                        non_unique: ic.non_unique,
                        columns: BTreeMap::new(),
                    });
                index.columns.insert(
                    ic.ordinal,
                    IndexColumn {
                        name: ic.column_name,
                        ascending: ic.ascending,
                    },
                );
            }

            let mut key_columns = source.primary_key(&table_ref)?;
            if !key_columns.is_empty() {
                key_columns.sort_by_key(|k| k.ordinal);
                primary_key = Some(PrimaryKey {
                    name: key_columns[0].key_name.clone(),
                    columns: key_columns.into_iter().map(|k| k.column_name).collect(),
                });
            }
        }

        Ok(Table {
            table: table_ref,
            table_type: info.table_type,
            remarks: info.remarks,
            columns,
            indexes,
            primary_key,
        })
    }

    /// All tables in catalog, schema, table name order
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.catalogs
            .values()
            .flat_map(|c| c.schemas.values())
            .flat_map(|s| s.tables.values())
    }
}
