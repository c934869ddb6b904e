//! Column overrides applied to freshly created rows

use std::fmt;

use ovs_idl::schema::TableSchema;
use ovs_idl::Datum;
use serde_json::Value;

use crate::error::{Result, VsctlError};
use crate::view::{BRIDGE_TABLE, PORT_TABLE, ROOT_TABLE};

/// Columns no override may touch; the edit operations own them
const RESERVED: &[&str] = &["_uuid", "_version", "name"];

/// Link columns the edit operations write for each table
fn link_columns(table: &str) -> &'static [&'static str] {
    match table {
        ROOT_TABLE => &["bridges"],
        BRIDGE_TABLE => &["ports"],
        PORT_TABLE => &["interfaces"],
        _ => &[],
    }
}

/// Ordered column → value overrides for one row.
///
/// Validated against the target table when applied: unknown columns,
/// reserved columns, link columns and ill-typed values are rejected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attrs {
    entries: Vec<(String, Datum)>,
}

impl Attrs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Attrs::set`]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Datum>) -> Self {
        self.set(column, value);
        self
    }

    /// Set a column, replacing an earlier value for it
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Datum>) {
        let column = column.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(c, _)| *c == column) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((column, value)),
        }
    }

    /// Parse a `COLUMN=VALUE` assignment. `VALUE` is read as an OVSDB
    /// datum in JSON notation when it parses as one, otherwise as a string.
    pub fn parse_assignment(assignment: &str) -> Result<(String, Datum)> {
        let (column, value) = assignment.split_once('=').ok_or_else(|| {
            VsctlError::invalid_attribute("", assignment, "expected COLUMN=VALUE")
        })?;
        let column = column.trim();
        if column.is_empty() {
            return Err(VsctlError::invalid_attribute("", assignment, "empty column name"));
        }

        let datum = serde_json::from_str::<Value>(value)
            .ok()
            .and_then(|json| Datum::from_json(&json).ok())
            .unwrap_or_else(|| Datum::from(value));
        Ok((column.to_string(), datum))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Datum)> {
        self.entries.iter().map(|(c, d)| (c.as_str(), d))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check every override against `table`
    pub fn validate(&self, table: &TableSchema) -> Result<()> {
        for (column, datum) in &self.entries {
            if RESERVED.contains(&column.as_str())
                || link_columns(&table.name).contains(&column.as_str())
            {
                return Err(VsctlError::invalid_attribute(
                    &table.name,
                    column,
                    "column is managed by the edit operation",
                ));
            }
            let schema = table
                .columns
                .get(column)
                .ok_or_else(|| VsctlError::UnknownColumn {
                    table: table.name.clone(),
                    column: column.clone(),
                })?;
            schema
                .column_type
                .check(datum)
                .map_err(|e| VsctlError::invalid_attribute(&table.name, column, e))?;
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<Datum>> FromIterator<(K, V)> for Attrs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attrs = Attrs::new();
        for (column, value) in iter {
            attrs.set(column, value);
        }
        attrs
    }
}

impl fmt::Display for Attrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (column, datum)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}={}", column, datum)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::schema;

    #[test]
    fn test_set_replaces() {
        let mut attrs = Attrs::new().with("stp_enable", true).with("datapath_type", "netdev");
        attrs.set("stp_enable", false);
        assert_eq!(attrs.len(), 2);
        let columns: Vec<&str> = attrs.iter().map(|(c, _)| c).collect();
        assert_eq!(columns, vec!["stp_enable", "datapath_type"]);
        assert_eq!(attrs.iter().next().unwrap().1, &Datum::from(false));
    }

    #[test]
    fn test_parse_assignment() {
        let (column, datum) = Attrs::parse_assignment("tag=10").unwrap();
        assert_eq!(column, "tag");
        assert_eq!(datum, Datum::from(10i64));

        let (_, datum) = Attrs::parse_assignment("datapath_type=netdev").unwrap();
        assert_eq!(datum, Datum::from("netdev"));

        let (_, datum) =
            Attrs::parse_assignment(r#"external_ids=["map",[["owner","ci"]]]"#).unwrap();
        assert_eq!(datum, Datum::string_map([("owner", "ci")]));

        assert!(Attrs::parse_assignment("novalue").is_err());
        assert!(Attrs::parse_assignment("=x").is_err());
    }

    #[test]
    fn test_validate() {
        let schema = schema();
        let bridge = schema.table("Bridge").unwrap();

        assert!(Attrs::new()
            .with("stp_enable", true)
            .with("fail_mode", "secure")
            .validate(bridge)
            .is_ok());

        let err = Attrs::new().with("no_such_column", 1i64).validate(bridge).unwrap_err();
        assert!(matches!(err, VsctlError::UnknownColumn { .. }));

        for reserved in ["name", "_uuid", "_version"] {
            let err = Attrs::new().with(reserved, "x").validate(bridge).unwrap_err();
            assert!(matches!(err, VsctlError::InvalidAttribute { .. }), "{}", reserved);
        }

        let err = Attrs::new()
            .with("ports", Datum::empty_set())
            .validate(bridge)
            .unwrap_err();
        assert!(matches!(err, VsctlError::InvalidAttribute { ref column, .. } if column == "ports"));
        let port = schema.table("Port").unwrap();
        let err = Attrs::new()
            .with("interfaces", Datum::empty_set())
            .validate(port)
            .unwrap_err();
        assert!(matches!(err, VsctlError::InvalidAttribute { ref column, .. } if column == "interfaces"));
        assert!(Attrs::new().with("tag", 10i64).validate(port).is_ok());

        let err = Attrs::new().with("fail_mode", "sometimes").validate(bridge).unwrap_err();
        assert!(matches!(err, VsctlError::InvalidAttribute { .. }));

        let err = Attrs::new().with("stp_enable", "yes").validate(bridge).unwrap_err();
        assert!(matches!(err, VsctlError::InvalidAttribute { .. }));
    }
}
