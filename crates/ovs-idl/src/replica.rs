//! In-memory mirror of the monitored tables

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::datum::Datum;
use crate::error::{IdlError, Result};
use crate::schema::DatabaseSchema;

/// One replicated row
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub uuid: Uuid,
    pub columns: BTreeMap<String, Datum>,
}

impl Row {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            columns: BTreeMap::new(),
        }
    }

    /// Decode a `<row>` object
    pub fn from_json(uuid: Uuid, value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| IdlError::protocol(format!("row {} is not an object", uuid)))?;
        let mut row = Row::new(uuid);
        for (column, datum) in obj {
            row.columns.insert(column.clone(), Datum::from_json(datum)?);
        }
        Ok(row)
    }

    /// Encode as a `<row>` object
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        for (column, datum) in &self.columns {
            obj.insert(column.clone(), datum.to_json());
        }
        Value::Object(obj)
    }

    pub fn get(&self, column: &str) -> Option<&Datum> {
        self.columns.get(column)
    }

    /// Value of the `name` column, which most vswitch tables carry
    pub fn name(&self) -> Option<&str> {
        self.get("name").and_then(Datum::as_str)
    }

    /// Row references held by a set column
    pub fn uuids(&self, column: &str) -> Vec<Uuid> {
        self.get(column).map(Datum::uuids).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    pub rows: HashMap<Uuid, Row>,
}

impl Table {
    pub fn get(&self, uuid: &Uuid) -> Option<&Row> {
        self.rows.get(uuid)
    }

    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Replica of the monitored tables, with a change-sequence counter that
/// advances on every applied update
#[derive(Debug, Clone, Default)]
pub struct Replica {
    seqno: u64,
    tables: HashMap<String, Table>,
}

impl Replica {
    /// Empty replica holding one table per schema table
    pub fn new(schema: &DatabaseSchema) -> Self {
        Self {
            seqno: 0,
            tables: schema
                .tables
                .keys()
                .map(|name| (name.clone(), Table::default()))
                .collect(),
        }
    }

    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    pub fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| IdlError::UnknownTable(name.to_string()))
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn row(&self, table: &str, uuid: &Uuid) -> Option<&Row> {
        self.tables.get(table).and_then(|t| t.get(uuid))
    }

    /// Install the reply to `monitor`; always counts as a change
    pub fn install_snapshot(&mut self, updates: &Value) -> Result<()> {
        for table in self.tables.values_mut() {
            table.rows.clear();
        }
        self.apply_rows(updates)?;
        self.seqno += 1;
        debug!(seqno = self.seqno, "Installed initial replica snapshot");
        Ok(())
    }

    /// Apply a `<table-updates>` object. Returns whether anything changed.
    pub fn apply_update(&mut self, updates: &Value) -> Result<bool> {
        let changed = self.apply_rows(updates)?;
        if changed {
            self.seqno += 1;
            trace!(seqno = self.seqno, "Applied replica update");
        }
        Ok(changed)
    }

    fn apply_rows(&mut self, updates: &Value) -> Result<bool> {
        let updates = updates
            .as_object()
            .ok_or_else(|| IdlError::protocol(format!("bad table-updates: {}", updates)))?;

        let mut changed = false;
        for (table_name, rows) in updates {
            let Some(table) = self.tables.get_mut(table_name) else {
                debug!("Ignoring update for unmonitored table {}", table_name);
                continue;
            };
            let rows = rows
                .as_object()
                .ok_or_else(|| IdlError::protocol(format!("bad table-update for {}", table_name)))?;

            for (uuid, row_update) in rows {
                let uuid = Uuid::parse_str(uuid)
                    .map_err(|e| IdlError::protocol(format!("bad row uuid {}: {}", uuid, e)))?;
                match row_update.get("new") {
                    Some(new) if !new.is_null() => {
                        let incoming = Row::from_json(uuid, new)?;
                        let row = table.rows.entry(uuid).or_insert_with(|| Row::new(uuid));
                        row.columns.extend(incoming.columns);
                    }
                    _ => {
                        table.rows.remove(&uuid);
                    }
                }
                changed = true;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::vswitch_schema_json;
    use serde_json::json;

    fn replica() -> Replica {
        Replica::new(&DatabaseSchema::from_json(vswitch_schema_json()).unwrap())
    }

    #[test]
    fn test_snapshot_then_updates() {
        let mut r = replica();
        let root = Uuid::new_v4();
        let br = Uuid::new_v4();

        r.install_snapshot(&json!({
            "Open_vSwitch": {root.to_string(): {"new": {"bridges": ["set", []]}}}
        }))
        .unwrap();
        assert_eq!(r.seqno(), 1);
        assert_eq!(r.table("Open_vSwitch").unwrap().len(), 1);

        let changed = r
            .apply_update(&json!({
                "Bridge": {br.to_string(): {"new": {"name": "br0", "ports": ["set", []]}}},
                "Open_vSwitch": {root.to_string(): {
                    "old": {"bridges": ["set", []]},
                    "new": {"bridges": ["uuid", br.to_string()]}
                }}
            }))
            .unwrap();
        assert!(changed);
        assert_eq!(r.seqno(), 2);
        assert_eq!(r.row("Bridge", &br).unwrap().name(), Some("br0"));
        assert_eq!(r.row("Open_vSwitch", &root).unwrap().uuids("bridges"), vec![br]);

        r.apply_update(&json!({"Bridge": {br.to_string(): {"old": {"name": "br0"}}}}))
            .unwrap();
        assert_eq!(r.seqno(), 3);
        assert!(r.row("Bridge", &br).is_none());
    }

    #[test]
    fn test_empty_update_keeps_seqno() {
        let mut r = replica();
        r.install_snapshot(&json!({})).unwrap();
        assert!(!r.apply_update(&json!({})).unwrap());
        assert!(!r.apply_update(&json!({"Unmonitored": {}})).unwrap());
        assert_eq!(r.seqno(), 1);
    }

    #[test]
    fn test_bad_update_is_rejected() {
        let mut r = replica();
        assert!(r.apply_update(&json!([])).is_err());
        assert!(r
            .apply_update(&json!({"Bridge": {"not-a-uuid": {"new": {}}}}))
            .is_err());
        assert!(r.table("Nope").is_err());
    }
}
