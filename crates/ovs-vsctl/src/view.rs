//! Read-side queries over the bridge/port/interface graph
//!
//! Queries run against anything that can hand out rows: the replica
//! itself, or an open transaction that overlays its pending edits.

use ovs_idl::{Replica, Row, Transaction};
use uuid::Uuid;

use crate::error::{Result, VsctlError};

pub const ROOT_TABLE: &str = "Open_vSwitch";
pub const BRIDGE_TABLE: &str = "Bridge";
pub const PORT_TABLE: &str = "Port";
pub const INTERFACE_TABLE: &str = "Interface";

/// A consistent set of rows to query
pub trait RowSource {
    /// All rows of `table`, in no particular order
    fn rows(&self, table: &str) -> Result<Vec<Row>>;

    fn row(&self, table: &str, uuid: &Uuid) -> Option<Row>;

    /// First row of `table` satisfying `predicate`
    fn find_row(&self, table: &str, predicate: impl Fn(&Row) -> bool) -> Result<Option<Row>>
    where
        Self: Sized,
    {
        Ok(self.rows(table)?.into_iter().find(|row| predicate(row)))
    }

    /// Row of `table` whose `name` column equals `name`
    fn find_by_name(&self, table: &str, name: &str) -> Result<Option<Row>>
    where
        Self: Sized,
    {
        self.find_row(table, |row| row.name() == Some(name))
    }
}

impl RowSource for Replica {
    fn rows(&self, table: &str) -> Result<Vec<Row>> {
        Ok(self.table(table)?.rows().cloned().collect())
    }

    fn row(&self, table: &str, uuid: &Uuid) -> Option<Row> {
        Replica::row(self, table, uuid).cloned()
    }
}

impl RowSource for Transaction<'_> {
    fn rows(&self, table: &str) -> Result<Vec<Row>> {
        Ok(Transaction::rows(self, table)?)
    }

    fn row(&self, table: &str, uuid: &Uuid) -> Option<Row> {
        Transaction::row(self, table, uuid)
    }
}

/// The single `Open_vSwitch` row
pub fn root(source: &impl RowSource) -> Result<Row> {
    let mut rows = source.rows(ROOT_TABLE)?;
    match rows.len() {
        1 => Ok(rows.remove(0)),
        n => Err(VsctlError::InvariantViolation(format!(
            "expected exactly one {} row, found {}",
            ROOT_TABLE, n
        ))),
    }
}

pub(crate) fn bridge(source: &impl RowSource, name: &str) -> Result<Row> {
    source
        .find_by_name(BRIDGE_TABLE, name)?
        .ok_or_else(|| VsctlError::not_found("bridge", name))
}

pub fn br_exists(source: &impl RowSource, name: &str) -> Result<bool> {
    Ok(source.find_by_name(BRIDGE_TABLE, name)?.is_some())
}

/// Names of all bridges, sorted
pub fn list_br(source: &impl RowSource) -> Result<Vec<String>> {
    let mut names: Vec<String> = source
        .rows(BRIDGE_TABLE)?
        .iter()
        .filter_map(|row| row.name().map(str::to_string))
        .collect();
    names.sort();
    Ok(names)
}

/// Ports of a bridge other than its implicit local port
fn user_ports(source: &impl RowSource, bridge: &Row) -> Vec<Row> {
    let own_name = bridge.name().unwrap_or_default();
    bridge
        .uuids("ports")
        .iter()
        .filter_map(|uuid| source.row(PORT_TABLE, uuid))
        .filter(|port| port.name() != Some(own_name))
        .collect()
}

/// Names of the bridge's ports, excluding the one named after the bridge
pub fn list_ports(source: &impl RowSource, bridge_name: &str) -> Result<Vec<String>> {
    let bridge = bridge(source, bridge_name)?;
    let mut names: Vec<String> = user_ports(source, &bridge)
        .iter()
        .filter_map(|port| port.name().map(str::to_string))
        .collect();
    names.sort();
    Ok(names)
}

/// Names of the interfaces of every port listed by [`list_ports`]
pub fn list_ifaces(source: &impl RowSource, bridge_name: &str) -> Result<Vec<String>> {
    let bridge = bridge(source, bridge_name)?;
    let mut names: Vec<String> = user_ports(source, &bridge)
        .iter()
        .flat_map(|port| port.uuids("interfaces"))
        .filter_map(|uuid| source.row(INTERFACE_TABLE, &uuid))
        .filter_map(|iface| iface.name().map(str::to_string))
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::schema;
    use serde_json::json;

    fn replica(updates: serde_json::Value) -> Replica {
        let mut replica = Replica::new(&schema());
        replica.install_snapshot(&updates).unwrap();
        replica
    }

    fn graph() -> Replica {
        let root = Uuid::new_v4().to_string();
        let br = Uuid::new_v4().to_string();
        let (p_br, p1, p2) = (
            Uuid::new_v4().to_string(),
            Uuid::new_v4().to_string(),
            Uuid::new_v4().to_string(),
        );
        let (i_br, i1, i2, i3) = (
            Uuid::new_v4().to_string(),
            Uuid::new_v4().to_string(),
            Uuid::new_v4().to_string(),
            Uuid::new_v4().to_string(),
        );
        replica(json!({
            "Open_vSwitch": {root: {"new": {"bridges": ["uuid", br]}}},
            "Bridge": {br.clone(): {"new": {"name": "br0",
                "ports": ["set", [["uuid", p_br], ["uuid", p1], ["uuid", p2]]]}}},
            "Port": {
                p_br.clone(): {"new": {"name": "br0", "interfaces": ["uuid", i_br]}},
                p1.clone(): {"new": {"name": "p1", "interfaces": ["uuid", i1]}},
                p2.clone(): {"new": {"name": "bond0",
                    "interfaces": ["set", [["uuid", i2], ["uuid", i3]]]}}
            },
            "Interface": {
                i_br: {"new": {"name": "br0", "type": "internal"}},
                i1: {"new": {"name": "p1"}},
                i2: {"new": {"name": "eth1"}},
                i3: {"new": {"name": "eth0"}}
            }
        }))
    }

    #[test]
    fn test_queries() {
        let replica = graph();
        assert!(br_exists(&replica, "br0").unwrap());
        assert!(!br_exists(&replica, "br1").unwrap());
        assert_eq!(list_br(&replica).unwrap(), vec!["br0"]);
        assert_eq!(list_ports(&replica, "br0").unwrap(), vec!["bond0", "p1"]);
        assert_eq!(list_ifaces(&replica, "br0").unwrap(), vec!["eth0", "eth1", "p1"]);
        assert!(root(&replica).unwrap().uuids("bridges").len() == 1);
    }

    #[test]
    fn test_missing_bridge() {
        let replica = graph();
        let err = list_ports(&replica, "nope").unwrap_err();
        assert!(matches!(err, VsctlError::NotFound { kind: "bridge", .. }));
        assert!(list_ifaces(&replica, "nope").is_err());
    }

    #[test]
    fn test_root_must_be_unique() {
        let empty = replica(json!({}));
        assert!(matches!(root(&empty), Err(VsctlError::InvariantViolation(_))));

        let (a, b) = (Uuid::new_v4().to_string(), Uuid::new_v4().to_string());
        let two = replica(json!({"Open_vSwitch": {a: {"new": {}}, b: {"new": {}}}}));
        assert!(matches!(root(&two), Err(VsctlError::InvariantViolation(_))));
    }
}
