//! Parameterised single-table helpers on an open database. Values always travel
//! as bound parameters; table and column names are quoted as identifiers.

use std::{collections::BTreeMap, fmt};

use dbseal_core::StoreError;
use rusqlite::{params_from_iter, types::Value};

use crate::manager::DatabaseHandle;

/// One result row keyed by column name.
pub type Row = BTreeMap<String, Value>;

impl DatabaseHandle {
    /// Insert one row and return its rowid.
    pub fn insert(&self, table: &str, values: &[(&str, Value)]) -> Result<i64, StoreError> {
        if values.is_empty() {
            return Err(self.engine_error("insert needs at least one column"));
        }
        let columns = values
            .iter()
            .map(|(column, _)| self.quote(column))
            .collect::<Result<Vec<_>, _>>()?;
        let placeholders = vec!["?"; values.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            self.quote(table)?,
            columns.join(", ")
        );
        self.execute(&sql, params_from_iter(values.iter().map(|(_, v)| v)))
            .map_err(|e| self.engine_error(e))?;
        Ok(self.last_insert_rowid())
    }

    /// All rows of `table` matching every `column = value` pair in `filter`.
    pub fn select(&self, table: &str, filter: &[(&str, Value)]) -> Result<Vec<Row>, StoreError> {
        let sql = format!(
            "SELECT * FROM {}{}",
            self.quote(table)?,
            self.where_clause(filter)?
        );
        let mut stmt = self.prepare(&sql).map_err(|e| self.engine_error(e))?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let rows = stmt
            .query_map(params_from_iter(filter.iter().map(|(_, v)| v)), |row| {
                names
                    .iter()
                    .enumerate()
                    .map(|(i, name)| Ok((name.clone(), row.get::<_, Value>(i)?)))
                    .collect::<rusqlite::Result<Row>>()
            })
            .map_err(|e| self.engine_error(e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| self.engine_error(e))
    }

    /// Set `values` on rows matching `filter` (all rows when it is empty).
    /// Returns the number of rows changed.
    pub fn update(
        &self,
        table: &str,
        values: &[(&str, Value)],
        filter: &[(&str, Value)],
    ) -> Result<usize, StoreError> {
        if values.is_empty() {
            return Err(self.engine_error("update needs at least one column"));
        }
        let assignments = values
            .iter()
            .map(|(column, _)| Ok(format!("{} = ?", self.quote(column)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        let sql = format!(
            "UPDATE {} SET {}{}",
            self.quote(table)?,
            assignments.join(", "),
            self.where_clause(filter)?
        );
        let params = values.iter().chain(filter).map(|(_, v)| v);
        self.execute(&sql, params_from_iter(params))
            .map_err(|e| self.engine_error(e))
    }

    /// Delete rows matching `filter`. An empty filter is refused rather than
    /// clearing the table.
    pub fn delete(&self, table: &str, filter: &[(&str, Value)]) -> Result<usize, StoreError> {
        if filter.is_empty() {
            return Err(self.engine_error("delete needs at least one filter column"));
        }
        let sql = format!(
            "DELETE FROM {}{}",
            self.quote(table)?,
            self.where_clause(filter)?
        );
        self.execute(&sql, params_from_iter(filter.iter().map(|(_, v)| v)))
            .map_err(|e| self.engine_error(e))
    }

    fn where_clause(&self, filter: &[(&str, Value)]) -> Result<String, StoreError> {
        if filter.is_empty() {
            return Ok(String::new());
        }
        let conditions = filter
            .iter()
            .map(|(column, _)| Ok(format!("{} = ?", self.quote(column)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        Ok(format!(" WHERE {}", conditions.join(" AND ")))
    }

    fn quote(&self, ident: &str) -> Result<String, StoreError> {
        if ident.is_empty() || ident.contains('\0') {
            return Err(self.engine_error(format!("invalid identifier {ident:?}")));
        }
        Ok(format!("\"{}\"", ident.replace('"', "\"\"")))
    }

    fn engine_error(&self, reason: impl fmt::Display) -> StoreError {
        StoreError::Engine {
            path: self.path().to_path_buf(),
            reason: reason.to_string(),
        }
    }
}
