//! Graph edits inside one transaction
//!
//! Every change to a set-valued link column (`Open_vSwitch.bridges`,
//! `Bridge.ports`, `Port.interfaces`) first verifies the column, so a
//! concurrent writer to the same column makes the commit fail with
//! `TryAgain` rather than lose either update.

use ovs_idl::{Atom, Datum, Row, Transaction, TxnStatus};
use tracing::debug;
use uuid::Uuid;

use crate::attrs::Attrs;
use crate::error::{Result, VsctlError};
use crate::view::{self, RowSource, BRIDGE_TABLE, INTERFACE_TABLE, PORT_TABLE, ROOT_TABLE};

/// An open transaction with bridge/port/interface operations.
///
/// Lookups go through the transaction, so edits queued earlier in the
/// same callback are visible to later ones.
pub struct VsctlTxn<'a> {
    txn: Transaction<'a>,
}

impl<'a> VsctlTxn<'a> {
    pub(crate) fn new(txn: Transaction<'a>) -> Self {
        Self { txn }
    }

    /// The underlying IDL transaction, for edits beyond the graph operations
    pub fn transaction(&mut self) -> &mut Transaction<'a> {
        &mut self.txn
    }

    /// Change-sequence number of the replica this transaction reads
    pub fn seqno(&self) -> u64 {
        self.txn.seqno()
    }

    pub fn status(&self) -> TxnStatus {
        self.txn.status()
    }

    pub(crate) fn into_inner(self) -> Transaction<'a> {
        self.txn
    }

    pub fn find_row(&self, table: &str, predicate: impl Fn(&Row) -> bool) -> Result<Option<Row>> {
        self.txn.find_row(table, predicate)
    }

    pub fn find_by_name(&self, table: &str, name: &str) -> Result<Option<Row>> {
        self.txn.find_by_name(table, name)
    }

    pub fn root(&self) -> Result<Row> {
        view::root(&self.txn)
    }

    pub fn br_exists(&self, name: &str) -> Result<bool> {
        view::br_exists(&self.txn, name)
    }

    pub fn list_br(&self) -> Result<Vec<String>> {
        view::list_br(&self.txn)
    }

    pub fn list_ports(&self, bridge: &str) -> Result<Vec<String>> {
        view::list_ports(&self.txn, bridge)
    }

    pub fn list_ifaces(&self, bridge: &str) -> Result<Vec<String>> {
        view::list_ifaces(&self.txn, bridge)
    }

    fn ensure_absent(&self, table: &str, kind: &'static str, name: &str) -> Result<()> {
        match self.find_by_name(table, name)? {
            Some(_) => Err(VsctlError::already_exists(kind, name)),
            None => Ok(()),
        }
    }

    fn existing(&self, table: &str, kind: &'static str, name: &str) -> Result<Row> {
        self.find_by_name(table, name)?
            .ok_or_else(|| VsctlError::not_found(kind, name))
    }

    fn validate(&self, table: &str, attrs: &Attrs) -> Result<()> {
        attrs.validate(self.txn.idl().schema().table(table)?)
    }

    fn insert_named(&mut self, table: &str, name: &str, attrs: &Attrs) -> Result<Uuid> {
        let uuid = self.txn.insert(table)?;
        self.txn.set(table, uuid, "name", Datum::from(name))?;
        for (column, value) in attrs.iter() {
            self.txn.set(table, uuid, column, value.clone())?;
        }
        Ok(uuid)
    }

    /// Verify `table.column` of `owner`, then add `member` to it
    fn link(&mut self, table: &str, owner: Uuid, column: &str, member: Uuid) -> Result<()> {
        self.txn.verify(table, owner, column)?;
        let mut members = self.current(table, owner, column)?;
        members.insert(Atom::Uuid(member))?;
        self.txn.set(table, owner, column, members)?;
        Ok(())
    }

    /// Verify `table.column` of `owner`, then remove `member` from it
    fn unlink(&mut self, table: &str, owner: Uuid, column: &str, member: Uuid) -> Result<()> {
        self.txn.verify(table, owner, column)?;
        let mut members = self.current(table, owner, column)?;
        members.remove(&Atom::Uuid(member));
        self.txn.set(table, owner, column, members)?;
        Ok(())
    }

    fn current(&self, table: &str, uuid: Uuid, column: &str) -> Result<Datum> {
        let row = self
            .txn
            .row(table, &uuid)
            .ok_or_else(|| VsctlError::InvariantViolation(format!("{} row {} vanished", table, uuid)))?;
        Ok(row.get(column).cloned().unwrap_or_else(Datum::empty_set))
    }

    /// Create a bare interface
    pub fn add_iface(&mut self, name: &str, attrs: &Attrs) -> Result<Uuid> {
        self.ensure_absent(INTERFACE_TABLE, "interface", name)?;
        self.validate(INTERFACE_TABLE, attrs)?;
        let iface = self.insert_named(INTERFACE_TABLE, name, attrs)?;
        debug!(interface = name, "Queued interface creation");
        Ok(iface)
    }

    fn new_port(&mut self, name: &str, ifaces: &[Uuid], attrs: &Attrs) -> Result<Uuid> {
        let port = self.insert_named(PORT_TABLE, name, attrs)?;
        self.txn.set(
            PORT_TABLE,
            port,
            "interfaces",
            Datum::uuid_set(ifaces.iter().copied()),
        )?;
        Ok(port)
    }

    /// Create a bridge with its local port and internal interface, and
    /// attach it to the root row. `attrs` apply to the bridge.
    pub fn add_br(&mut self, name: &str, attrs: &Attrs) -> Result<Uuid> {
        self.ensure_absent(BRIDGE_TABLE, "bridge", name)?;
        self.ensure_absent(PORT_TABLE, "port", name)?;
        self.validate(BRIDGE_TABLE, attrs)?;
        let root = self.root()?;

        let iface = self.add_iface(name, &Attrs::new().with("type", "internal"))?;
        let port = self.new_port(name, &[iface], &Attrs::new())?;
        let bridge = self.insert_named(BRIDGE_TABLE, name, attrs)?;
        self.txn
            .set(BRIDGE_TABLE, bridge, "ports", Datum::uuid_set([port]))?;

        self.link(ROOT_TABLE, root.uuid, "bridges", bridge)?;
        debug!(bridge = name, %attrs, "Queued bridge creation");
        Ok(bridge)
    }

    /// Create a port with one interface of the same name on `bridge`.
    /// `attrs` apply to the port.
    pub fn add_port(&mut self, bridge: &str, port: &str, attrs: &Attrs) -> Result<Uuid> {
        self.add_port_with_ifaces(bridge, port, &[port], attrs)
    }

    /// Create a port on `bridge` backed by the named interfaces
    pub fn add_port_with_ifaces(
        &mut self,
        bridge: &str,
        port: &str,
        ifaces: &[&str],
        attrs: &Attrs,
    ) -> Result<Uuid> {
        let bridge_row = self.existing(BRIDGE_TABLE, "bridge", bridge)?;
        self.ensure_absent(PORT_TABLE, "port", port)?;
        if ifaces.is_empty() {
            return Err(VsctlError::invalid_attribute(
                PORT_TABLE,
                "interfaces",
                "a port needs at least one interface",
            ));
        }
        self.validate(PORT_TABLE, attrs)?;

        let mut members = Vec::with_capacity(ifaces.len());
        for iface in ifaces {
            members.push(self.add_iface(iface, &Attrs::new())?);
        }
        let port_uuid = self.new_port(port, &members, attrs)?;

        self.link(BRIDGE_TABLE, bridge_row.uuid, "ports", port_uuid)?;
        debug!(bridge, port, ?ifaces, "Queued port creation");
        Ok(port_uuid)
    }

    /// Delete a bridge with every port and interface on it, and detach it
    /// from the root row
    pub fn del_br(&mut self, name: &str) -> Result<()> {
        let bridge = self.existing(BRIDGE_TABLE, "bridge", name)?;
        let root = self.root()?;

        // A port added concurrently would otherwise be left behind
        self.txn.verify(BRIDGE_TABLE, bridge.uuid, "ports")?;
        for port_uuid in bridge.uuids("ports") {
            let Some(port) = self.txn.row(PORT_TABLE, &port_uuid) else {
                continue;
            };
            self.delete_port_rows(&port)?;
        }

        self.unlink(ROOT_TABLE, root.uuid, "bridges", bridge.uuid)?;
        self.txn.delete(BRIDGE_TABLE, bridge.uuid)?;
        debug!(bridge = name, "Queued bridge deletion");
        Ok(())
    }

    /// Delete a port of `bridge` together with its interfaces
    pub fn del_port(&mut self, bridge: &str, port: &str) -> Result<()> {
        let bridge_row = self.existing(BRIDGE_TABLE, "bridge", bridge)?;
        if port == bridge {
            return Err(VsctlError::LocalPort {
                bridge: bridge.to_string(),
            });
        }
        let port_row = self.existing(PORT_TABLE, "port", port)?;
        if !bridge_row.uuids("ports").contains(&port_row.uuid) {
            return Err(VsctlError::not_found("port", format!("{} on bridge {}", port, bridge)));
        }

        self.delete_port_rows(&port_row)?;
        self.unlink(BRIDGE_TABLE, bridge_row.uuid, "ports", port_row.uuid)?;
        debug!(bridge, port, "Queued port deletion");
        Ok(())
    }

    fn delete_port_rows(&mut self, port: &Row) -> Result<()> {
        self.txn.verify(PORT_TABLE, port.uuid, "interfaces")?;
        for iface in port.uuids("interfaces") {
            if self.txn.row(INTERFACE_TABLE, &iface).is_some() {
                self.txn.delete(INTERFACE_TABLE, iface)?;
            }
        }
        self.txn.delete(PORT_TABLE, port.uuid)?;
        Ok(())
    }

    /// Detach and delete the interface named `port` from the port of the
    /// same name
    pub fn del_iface(&mut self, port: &str) -> Result<()> {
        let port_row = self.existing(PORT_TABLE, "port", port)?;
        let iface = self.existing(INTERFACE_TABLE, "interface", port)?;
        if !port_row.uuids("interfaces").contains(&iface.uuid) {
            return Err(VsctlError::not_found("interface", format!("{} on port {}", port, port)));
        }

        self.unlink(PORT_TABLE, port_row.uuid, "interfaces", iface.uuid)?;
        self.txn.delete(INTERFACE_TABLE, iface.uuid)?;
        debug!(port, "Queued interface deletion");
        Ok(())
    }
}
