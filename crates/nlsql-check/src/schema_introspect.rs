//! `information_schema` / `pg_catalog` introspection.

use crate::client::{CheckClient, RowExt};
use crate::error::CheckResult;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Table,
    PartitionedTable,
    View,
    MaterializedView,
    ForeignTable,
    Other,
}

impl RelationKind {
    fn from_relkind(relkind: i8) -> Self {
        // Postgres stores `relkind` as a "char" internally; tokio-postgres exposes it as i8.
        match relkind as u8 as char {
            'r' => Self::Table,
            'p' => Self::PartitionedTable,
            'v' => Self::View,
            'm' => Self::MaterializedView,
            'f' => Self::ForeignTable,
            _ => Self::Other,
        }
    }
}

/// A single column, matching the `ColumnMeta` entity of the core's schema model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub is_primary_key: bool,
    pub ordinal: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub kind: RelationKind,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbSchema {
    pub schemas: Vec<String>,
    pub tables: Vec<TableInfo>,
}

impl DbSchema {
    pub fn find_table(&self, schema: &str, table: &str) -> Option<&TableInfo> {
        self.tables
            .iter()
            .find(|t| t.schema == schema && t.name == table)
    }
}

/// Fetch table/column metadata for `schemas` from `pg_catalog`, including
/// primary-key membership via `pg_index`'s `indkey`.
pub async fn load_schema_from_db<C: CheckClient>(client: &C, schemas: &[String]) -> CheckResult<DbSchema> {
    let rows = client
        .query(
            r#"
SELECT
  n.nspname AS schema_name,
  c.relname AS table_name,
  c.relkind AS relkind,
  a.attname AS column_name,
  a.attnum AS ordinal,
  pg_catalog.format_type(a.atttypid, a.atttypmod) AS data_type,
  a.attnotnull AS not_null,
  COALESCE(
    (SELECT true
       FROM pg_catalog.pg_index i
      WHERE i.indrelid = c.oid
        AND i.indisprimary
        AND a.attnum = ANY(i.indkey)),
    false
  ) AS is_primary_key
FROM pg_catalog.pg_class c
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
JOIN pg_catalog.pg_attribute a ON a.attrelid = c.oid
WHERE c.relkind IN ('r', 'p', 'v', 'm', 'f')
  AND a.attnum > 0
  AND NOT a.attisdropped
  AND n.nspname = ANY($1::text[])
ORDER BY n.nspname, c.relname, a.attnum
"#,
            &[&schemas],
        )
        .await?;

    use std::collections::BTreeMap;
    let mut tables: BTreeMap<(String, String), TableInfo> = BTreeMap::new();

    for row in &rows {
        let schema_name: String = row.try_get_column("schema_name")?;
        let table_name: String = row.try_get_column("table_name")?;
        let relkind: i8 = row.try_get_column("relkind")?;

        let column_name: String = row.try_get_column("column_name")?;
        let ordinal: i32 = row.try_get_column("ordinal")?;
        let data_type: String = row.try_get_column("data_type")?;
        let not_null: bool = row.try_get_column("not_null")?;
        let is_primary_key: bool = row.try_get_column("is_primary_key")?;

        let key = (schema_name.clone(), table_name.clone());

        let table = tables.entry(key).or_insert_with(|| TableInfo {
            schema: schema_name,
            name: table_name,
            kind: RelationKind::from_relkind(relkind),
            columns: Vec::new(),
        });

        table.columns.push(ColumnInfo {
            name: column_name,
            data_type,
            is_nullable: !not_null,
            is_primary_key,
            ordinal,
        });
    }

    Ok(DbSchema {
        schemas: schemas.to_vec(),
        tables: tables.into_values().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relkind_maps_table_and_view() {
        assert_eq!(RelationKind::from_relkind(b'r' as i8), RelationKind::Table);
        assert_eq!(RelationKind::from_relkind(b'v' as i8), RelationKind::View);
        assert_eq!(RelationKind::from_relkind(b'?' as i8), RelationKind::Other);
    }

    #[test]
    fn find_table_matches_schema_and_name() {
        let db = DbSchema {
            schemas: vec!["public".into()],
            tables: vec![TableInfo {
                schema: "public".into(),
                name: "users".into(),
                kind: RelationKind::Table,
                columns: vec![],
            }],
        };
        assert!(db.find_table("public", "users").is_some());
        assert!(db.find_table("public", "orders").is_none());
    }
}
