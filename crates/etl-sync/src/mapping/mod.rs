//! Column mapping between source and target tables.
//!
//! A [`ColumnProjection`] is planned once per run from the job's mapping rules
//! and the inspected metadata of both tables. Source rows are read in
//! [`ColumnProjection::source_columns`] order and projected into
//! [`ColumnProjection::target_columns`] order, the shape used for upserts and
//! for bucket hashing on both sides.

use tracing::warn;

use crate::config::{ColumnMappingRule, MappingAction};
use crate::core::schema::{ColumnMetadata, TableSchemaMetadata};
use crate::core::value::{Row, SqlValue};
use crate::error::{Result, SyncError};

/// Type used when a CONSTANT rule targets a column that must be created.
const CONSTANT_COLUMN_TYPE: &str = "VARCHAR(255)";

/// Where a target column's value comes from.
#[derive(Debug, Clone, PartialEq)]
enum Slot {
    /// Index into the source read list.
    Source(usize),
    Constant(SqlValue),
}

/// A target column to create before extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnAddition {
    pub name: String,
    pub type_def: String,
}

/// Planned source → target column projection.
#[derive(Debug, Clone)]
pub struct ColumnProjection {
    source_columns: Vec<String>,
    target_columns: Vec<String>,
    slots: Vec<Slot>,
    source_primary_key: Vec<String>,
    primary_key: Vec<String>,
    type_mismatches: Vec<String>,
    additions: Vec<ColumnAddition>,
}

impl ColumnProjection {
    /// Plan the projection.
    ///
    /// Enabled rules apply in ordinal order. With none, every source column
    /// is copied to the target column of the same name (ignoring case);
    /// source columns without a counterpart are dropped with a warning unless
    /// `auto_add` is set.
    pub fn plan(
        rules: &[ColumnMappingRule],
        source: &TableSchemaMetadata,
        target: &TableSchemaMetadata,
        auto_add: bool,
    ) -> Result<Self> {
        let mut rules: Vec<&ColumnMappingRule> = rules.iter().filter(|r| r.enabled).collect();
        rules.sort_by_key(|r| r.ordinal);

        let mut projection = Self {
            source_columns: Vec::new(),
            target_columns: Vec::new(),
            slots: Vec::new(),
            source_primary_key: source.primary_key_columns.clone(),
            primary_key: Vec::new(),
            type_mismatches: Vec::new(),
            additions: Vec::new(),
        };

        if rules.is_empty() {
            for column in &source.columns {
                match target.column(&column.name) {
                    Some(t) => projection.copy(column, t.name.clone(), Some(t)),
                    None if auto_add => projection.add_copy(column, column.name.clone()),
                    None => warn!(
                        "Column {} has no counterpart in {}; not synchronized",
                        column.name, target.table
                    ),
                }
            }
        } else {
            for rule in rules {
                projection.apply_rule(rule, source, target, auto_add)?;
            }
        }

        for key in &source.primary_key_columns {
            let Some(idx) = projection.source_index(key) else {
                return Err(SyncError::SchemaDrift(format!(
                    "primary key column {} of {} is not mapped to {}",
                    key, source.table, target.table
                )));
            };
            let target_name = projection
                .slots
                .iter()
                .position(|s| *s == Slot::Source(idx))
                .map(|pos| projection.target_columns[pos].clone());
            match target_name {
                Some(name) => projection.primary_key.push(name),
                None => {
                    return Err(SyncError::SchemaDrift(format!(
                        "primary key column {} of {} is not mapped to {}",
                        key, source.table, target.table
                    )))
                }
            }
        }

        if projection.target_columns.is_empty() {
            return Err(SyncError::SchemaDrift(format!(
                "no columns of {} map to {}",
                source.table, target.table
            )));
        }
        Ok(projection)
    }

    fn apply_rule(
        &mut self,
        rule: &ColumnMappingRule,
        source: &TableSchemaMetadata,
        target: &TableSchemaMetadata,
        auto_add: bool,
    ) -> Result<()> {
        match rule.action {
            MappingAction::Copy | MappingAction::Skip => {
                let name = rule.source_column.as_deref().unwrap_or_default();
                let column = source.column(name).ok_or_else(|| {
                    SyncError::SchemaDrift(format!(
                        "mapped source column {} no longer exists in {}",
                        name, source.table
                    ))
                })?;
                if rule.action == MappingAction::Skip {
                    return Ok(());
                }
                let target_name = rule.target_column.as_deref().unwrap_or(&column.name);
                match target.column(target_name) {
                    Some(t) => self.copy(column, t.name.clone(), Some(t)),
                    None if auto_add => self.add_copy(column, target_name.to_string()),
                    None => {
                        return Err(SyncError::SchemaDrift(format!(
                            "mapped target column {} does not exist in {}",
                            target_name, target.table
                        )))
                    }
                }
            }
            MappingAction::Constant => {
                let target_name = rule.target_column.as_deref().unwrap_or_default();
                let literal = rule.constant_value.as_deref().unwrap_or_default();
                let (name, value) = match target.column(target_name) {
                    Some(t) => (
                        t.name.clone(),
                        SqlValue::parse_as(literal, t.family())
                            .unwrap_or_else(|_| SqlValue::Text(literal.to_string())),
                    ),
                    None if auto_add => {
                        self.additions.push(ColumnAddition {
                            name: target_name.to_string(),
                            type_def: CONSTANT_COLUMN_TYPE.to_string(),
                        });
                        (target_name.to_string(), SqlValue::Text(literal.to_string()))
                    }
                    None => {
                        return Err(SyncError::SchemaDrift(format!(
                            "constant target column {} does not exist in {}",
                            target_name, target.table
                        )))
                    }
                };
                self.target_columns.push(name);
                self.slots.push(Slot::Constant(value));
            }
        }
        Ok(())
    }

    fn copy(&mut self, column: &ColumnMetadata, target_name: String, target: Option<&ColumnMetadata>) {
        if let Some(t) = target {
            if !column.family().compatible_with(t.family()) {
                self.type_mismatches.push(format!(
                    "{} ({}) -> {} ({})",
                    column.name, column.type_name, t.name, t.type_name
                ));
            }
        }
        let idx = self.ensure_source_column(&column.name);
        self.target_columns.push(target_name);
        self.slots.push(Slot::Source(idx));
    }

    fn add_copy(&mut self, column: &ColumnMetadata, target_name: String) {
        self.additions.push(ColumnAddition {
            name: target_name.clone(),
            type_def: column.type_definition(),
        });
        self.copy(column, target_name, None);
    }

    /// Index of `name` in the source read list, adding it when absent.
    pub fn ensure_source_column(&mut self, name: &str) -> usize {
        match self.source_index(name) {
            Some(idx) => idx,
            None => {
                self.source_columns.push(name.to_string());
                self.source_columns.len() - 1
            }
        }
    }

    /// Index of `name` (ignoring case) in the source read list.
    pub fn source_index(&self, name: &str) -> Option<usize> {
        self.source_columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Columns to select from the source.
    pub fn source_columns(&self) -> &[String] {
        &self.source_columns
    }

    /// Columns written to the target, in projected row order.
    pub fn target_columns(&self) -> &[String] {
        &self.target_columns
    }

    /// Source primary key columns.
    pub fn source_primary_key(&self) -> &[String] {
        &self.source_primary_key
    }

    /// Target names of the source primary key columns; the upsert key.
    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    /// Positions of every key column in projected rows, in key order.
    pub fn key_indices(&self) -> Option<Vec<usize>> {
        self.primary_key
            .iter()
            .map(|key| {
                self.target_columns
                    .iter()
                    .position(|c| c.eq_ignore_ascii_case(key))
            })
            .collect()
    }

    /// Source column of every target column, in target order; `None` when
    /// any target column carries a constant.
    pub fn copied_source_columns(&self) -> Option<Vec<String>> {
        self.slots
            .iter()
            .map(|slot| match slot {
                Slot::Source(idx) => self.source_columns.get(*idx).cloned(),
                Slot::Constant(_) => None,
            })
            .collect()
    }

    /// Copied columns whose source and target types hash differently.
    pub fn type_mismatches(&self) -> &[String] {
        &self.type_mismatches
    }

    /// Target columns that must be created first.
    pub fn additions(&self) -> &[ColumnAddition] {
        &self.additions
    }

    /// Whether the projected column at `target_idx` carries a constant.
    pub fn is_constant(&self, target_idx: usize) -> bool {
        matches!(self.slots.get(target_idx), Some(Slot::Constant(_)))
    }

    /// Project a source row into target column order.
    pub fn project(&self, row: &Row) -> Result<Row> {
        self.slots
            .iter()
            .map(|slot| match slot {
                Slot::Source(idx) => row.get(*idx).cloned().ok_or_else(|| {
                    SyncError::Query(format!(
                        "source row has {} value(s), expected at least {}",
                        row.len(),
                        idx + 1
                    ))
                }),
                Slot::Constant(value) => Ok(value.clone()),
            })
            .collect()
    }

    /// Project a batch of rows.
    pub fn project_all(&self, rows: &[Row]) -> Result<Vec<Row>> {
        rows.iter().map(|r| self.project(r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::TableRef;

    fn meta(name: &str, columns: Vec<ColumnMetadata>) -> TableSchemaMetadata {
        let primary_key_columns = columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect();
        TableSchemaMetadata {
            table: TableRef::new(None, name),
            columns,
            primary_key_columns,
            structure_digest: String::new(),
        }
    }

    fn source() -> TableSchemaMetadata {
        meta(
            "src",
            vec![
                ColumnMetadata::new("id", "bigint", 1).with_primary_key(1),
                ColumnMetadata::new("name", "varchar", 2),
                ColumnMetadata::new("secret", "varchar", 3),
            ],
        )
    }

    fn rule(action: MappingAction, src: Option<&str>, dst: Option<&str>, ordinal: i32) -> ColumnMappingRule {
        ColumnMappingRule {
            source_column: src.map(String::from),
            target_column: dst.map(String::from),
            action,
            constant_value: None,
            ordinal,
            enabled: true,
        }
    }

    #[test]
    fn test_identity_matches_case_insensitively() {
        let target = meta(
            "dst",
            vec![
                ColumnMetadata::new("ID", "bigint", 1).with_primary_key(1),
                ColumnMetadata::new("Name", "text", 2),
            ],
        );
        let p = ColumnProjection::plan(&[], &source(), &target, false).unwrap();
        assert_eq!(p.target_columns(), &["ID".to_string(), "Name".to_string()]);
        assert_eq!(p.source_columns(), &["id".to_string(), "name".to_string()]);
        assert_eq!(p.primary_key(), &["ID".to_string()]);
        assert_eq!(p.key_indices(), Some(vec![0]));
        assert_eq!(
            p.copied_source_columns(),
            Some(vec!["id".to_string(), "name".to_string()])
        );
        assert!(p.additions().is_empty());
    }

    #[test]
    fn test_identity_auto_add_missing_columns() {
        let target = meta("dst", vec![ColumnMetadata::new("id", "bigint", 1).with_primary_key(1)]);
        let p = ColumnProjection::plan(&[], &source(), &target, true).unwrap();
        assert_eq!(p.additions().len(), 2);
        assert_eq!(p.additions()[0].name, "name");
        assert_eq!(p.target_columns().len(), 3);
    }

    #[test]
    fn test_rules_rename_skip_and_constant_in_ordinal_order() {
        let target = meta(
            "dst",
            vec![
                ColumnMetadata::new("id", "bigint", 1).with_primary_key(1),
                ColumnMetadata::new("full_name", "varchar", 2),
                ColumnMetadata::new("origin", "int", 3),
            ],
        );
        let mut constant = rule(MappingAction::Constant, None, Some("origin"), 3);
        constant.constant_value = Some("7".into());
        let mut disabled = rule(MappingAction::Copy, Some("secret"), Some("full_name"), 0);
        disabled.enabled = false;
        let rules = vec![
            constant,
            rule(MappingAction::Copy, Some("name"), Some("full_name"), 2),
            rule(MappingAction::Skip, Some("secret"), None, 1),
            rule(MappingAction::Copy, Some("id"), None, 0),
            disabled,
        ];

        let p = ColumnProjection::plan(&rules, &source(), &target, false).unwrap();
        assert_eq!(
            p.target_columns(),
            &["id".to_string(), "full_name".to_string(), "origin".to_string()]
        );
        let row = vec![
            SqlValue::I64(1),
            SqlValue::Text("Ada".into()),
        ];
        assert_eq!(
            p.project(&row).unwrap(),
            vec![SqlValue::I64(1), SqlValue::Text("Ada".into()), SqlValue::I64(7)]
        );
        assert!(p.is_constant(2));
        assert_eq!(p.copied_source_columns(), None);
    }

    #[test]
    fn test_missing_mapped_source_column_is_drift() {
        let target = meta("dst", vec![ColumnMetadata::new("id", "bigint", 1).with_primary_key(1)]);
        let rules = vec![
            rule(MappingAction::Copy, Some("id"), None, 0),
            rule(MappingAction::Copy, Some("vanished"), None, 1),
        ];
        let err = ColumnProjection::plan(&rules, &source(), &target, false).unwrap_err();
        assert!(matches!(err, SyncError::SchemaDrift(_)));
    }

    #[test]
    fn test_missing_mapped_target_column_is_drift_without_auto_add() {
        let target = meta("dst", vec![ColumnMetadata::new("id", "bigint", 1).with_primary_key(1)]);
        let rules = vec![
            rule(MappingAction::Copy, Some("id"), None, 0),
            rule(MappingAction::Copy, Some("name"), None, 1),
        ];
        assert!(ColumnProjection::plan(&rules, &source(), &target, false).is_err());
        let p = ColumnProjection::plan(&rules, &source(), &target, true).unwrap();
        assert_eq!(p.additions()[0].type_def, "varchar");
    }

    #[test]
    fn test_unmapped_primary_key_is_drift() {
        let target = meta("dst", vec![ColumnMetadata::new("name", "varchar", 1)]);
        let rules = vec![rule(MappingAction::Copy, Some("name"), None, 0)];
        let err = ColumnProjection::plan(&rules, &source(), &target, false).unwrap_err();
        assert!(err.to_string().contains("primary key column id"));
    }

    #[test]
    fn test_type_mismatch_recorded() {
        let target = meta(
            "dst",
            vec![
                ColumnMetadata::new("id", "bigint", 1).with_primary_key(1),
                ColumnMetadata::new("name", "timestamp", 2),
            ],
        );
        let p = ColumnProjection::plan(&[], &source(), &target, false).unwrap();
        assert_eq!(p.type_mismatches().len(), 1);
    }

    #[test]
    fn test_ensure_source_column_extends_read_list() {
        let target = meta("dst", vec![ColumnMetadata::new("id", "bigint", 1).with_primary_key(1)]);
        let mut p = ColumnProjection::plan(&[], &source(), &target, false).unwrap();
        assert_eq!(p.ensure_source_column("ID"), 0);
        assert_eq!(p.ensure_source_column("secret"), 1);
        assert_eq!(p.source_columns().len(), 2);
        assert_eq!(p.target_columns().len(), 1);
    }
}
