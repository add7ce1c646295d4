use std::fmt;

use log::{debug, warn};
use serde::Serialize;

use crate::engine::{sql_identifier, Connection};
use crate::error::MigrateError;
use crate::metadata::{ColumnInfo, MetaData, Table};

/// Declared precision or scale above this is suspicious
pub const DEFAULT_DECIMAL_THRESHOLD: u64 = 128;

/// A flagged column definition and the statement that would fix it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recommendation {
    pub issue: String,
    pub corrective_statement: String,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.issue)?;
        write!(f, "{}", self.corrective_statement)
    }
}

/// Flags fixed-point columns whose declared precision or scale exceeds
/// `threshold`. The live values of each flagged column are read to work out
/// the precision and scale they actually need. Never modifies the database.
pub fn verify(conn: &mut dyn Connection, threshold: u64) -> Result<Vec<Recommendation>, MigrateError> {
    let meta = MetaData::build(conn)?;
    let mut recommendations = Vec::new();

    for table in meta.tables().filter(|t| t.table_type == "TABLE") {
        for column in table.columns.iter().filter(|c| is_suspicious(c, threshold)) {
            warn!(
                "Found suspicious column {}.{}.{} {}({}, {})",
                table.table.schema,
                table.table.name,
                column.name,
                column.type_name,
                column.precision.unwrap_or_default(),
                column.scale.unwrap_or_default()
            );
            recommendations.push(recommend(conn, table, column)?);
        }
    }

    Ok(recommendations)
}

fn is_suspicious(column: &ColumnInfo, threshold: u64) -> bool {
    let fixed_point = matches!(
        column.type_name.to_ascii_uppercase().as_str(),
        "DECIMAL" | "NUMERIC" | "DEC" | "NUMBER"
    );
    fixed_point
        && (column.precision.unwrap_or_default() > threshold || column.scale.unwrap_or_default() > threshold)
}

fn recommend(conn: &mut dyn Connection, table: &Table, column: &ColumnInfo) -> Result<Recommendation, MigrateError> {
    let qualified_table = format!(
        "{}.{}",
        sql_identifier(&table.table.schema),
        sql_identifier(&table.table.name)
    );
    let sql = format!("SELECT {} FROM {}", sql_identifier(&column.name), qualified_table);

    let mut precision = 0;
    let mut scale = 0;
    for value in conn.execute(&sql)?.first_column() {
        if let Some((p, s)) = precision_and_scale(&value) {
            precision = precision.max(p);
            scale = scale.max(s);
        }
    }
    // Room for the integer digits of the widest value
    let precision = precision.max(scale + 1);

    debug!(
        "Suggest: {} {}({}, {})",
        column.name, column.type_name, precision, scale
    );

    Ok(Recommendation {
        issue: format!(
            "Invalid Decimal Precision/Scale: {}.{}.{}    {} ({}.{})",
            table.table.schema,
            table.table.name,
            column.name,
            column.type_name,
            column.precision.unwrap_or_default(),
            column.scale.unwrap_or_default()
        ),
        corrective_statement: format!(
            "ALTER TABLE {}\nMODIFY COLUMN {} {}({},{});\n",
            qualified_table,
            sql_identifier(&column.name),
            column.type_name,
            precision,
            scale
        ),
    })
}

/// Precision and scale of a decimal literal, the way a `BigDecimal` counts
/// them: `23.456` → (5, 3), `0.001` → (1, 3), `1E+3` → (4, 0).
pub fn precision_and_scale(text: &str) -> Option<(u64, u64)> {
    let text = text.trim();
    let text = text.strip_prefix(['-', '+']).unwrap_or(text);

    let (mantissa, exponent) = match text.split_once(['e', 'E']) {
        Some((m, e)) => (m, e.parse::<i64>().ok()?),
        None => (text, 0),
    };
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));

    let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if (int_part.is_empty() && frac_part.is_empty()) || !all_digits(int_part) || !all_digits(frac_part) {
        return None;
    }

    let digits = format!("{int_part}{frac_part}");
    let significant = digits.trim_start_matches('0').len().max(1) as i64;
    let scale = frac_part.len() as i64 - exponent;

    if scale < 0 {
        Some(((significant - scale) as u64, 0))
    } else {
        Some((significant as u64, scale as u64))
    }
}
