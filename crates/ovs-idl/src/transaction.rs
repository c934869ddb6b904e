//! Optimistic OVSDB transactions
//!
//! A transaction reads from a snapshot of the replica plus its own
//! pending changes. At commit, every column declared with
//! [`Transaction::verify`] becomes a `wait` operation comparing the
//! server's value with the snapshot's, so a concurrent writer turns the
//! commit into [`TxnStatus::TryAgain`] instead of a lost update.

use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::datum::{Atom, Datum};
use crate::error::{IdlError, Result};
use crate::idl::Idl;
use crate::replica::{Replica, Row};

/// Outcome of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnStatus {
    /// Not committed or aborted yet
    Uncommitted,
    /// Commit had nothing to send
    Unchanged,
    /// Commit in flight
    Incomplete,
    Aborted,
    Success,
    /// A verified column changed underneath; compose again from a fresh replica
    TryAgain,
    /// The database lock this session requires is held elsewhere
    NotLocked,
    /// The server rejected the transaction
    Error,
}

impl TxnStatus {
    /// Whether the transaction reached a final state
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxnStatus::Uncommitted | TxnStatus::Incomplete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxnStatus::Uncommitted => "uncommitted",
            TxnStatus::Unchanged => "unchanged",
            TxnStatus::Incomplete => "incomplete",
            TxnStatus::Aborted => "aborted",
            TxnStatus::Success => "success",
            TxnStatus::TryAgain => "try again",
            TxnStatus::NotLocked => "not locked",
            TxnStatus::Error => "error",
        }
    }
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
struct PendingRow {
    table: String,
    change: Change,
    /// Columns written by this transaction
    columns: BTreeMap<String, Datum>,
}

/// What the replica must show once a successful commit has been mirrored
enum Expectation {
    Present { table: String, uuid: Uuid },
    Absent { table: String, uuid: Uuid },
    Columns { table: String, uuid: Uuid, columns: BTreeMap<String, Datum> },
}

impl Expectation {
    fn met(&self, replica: &Replica) -> bool {
        match self {
            Expectation::Present { table, uuid } => match replica.table(table) {
                Ok(t) => t.get(uuid).is_some(),
                Err(_) => true,
            },
            Expectation::Absent { table, uuid } => replica.row(table, uuid).is_none(),
            Expectation::Columns { table, uuid, columns } => match replica.row(table, uuid) {
                Some(row) => columns.iter().all(|(c, d)| row.get(c) == Some(d)),
                None => replica.table(table).is_err(),
            },
        }
    }
}

/// A write transaction against one IDL session
pub struct Transaction<'a> {
    idl: &'a Idl,
    snapshot: Arc<Replica>,
    status: TxnStatus,
    pending: HashMap<Uuid, PendingRow>,
    /// Row order of first modification, so operations are emitted deterministically
    order: Vec<Uuid>,
    verified: BTreeMap<(String, Uuid), BTreeSet<String>>,
    real_uuids: HashMap<Uuid, Uuid>,
    error: Option<String>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(idl: &'a Idl, snapshot: Arc<Replica>) -> Self {
        Self {
            idl,
            snapshot,
            status: TxnStatus::Uncommitted,
            pending: HashMap::new(),
            order: Vec::new(),
            verified: BTreeMap::new(),
            real_uuids: HashMap::new(),
            error: None,
        }
    }

    pub fn idl(&self) -> &'a Idl {
        self.idl
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    /// Change-sequence number of the replica this transaction reads from
    pub fn seqno(&self) -> u64 {
        self.snapshot.seqno()
    }

    /// Server-side error details after an `Error` commit
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Permanent uuid of a row inserted by this transaction, after `Success`
    pub fn real_uuid(&self, temporary: &Uuid) -> Option<Uuid> {
        self.real_uuids.get(temporary).copied()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.status == TxnStatus::Uncommitted {
            Ok(())
        } else {
            Err(IdlError::protocol(format!("transaction already {}", self.status)))
        }
    }

    /// Insert a new row with default values; returns its temporary uuid
    pub fn insert(&mut self, table: &str) -> Result<Uuid> {
        self.ensure_open()?;
        self.idl.schema().table(table)?;

        let uuid = Uuid::new_v4();
        self.pending.insert(
            uuid,
            PendingRow {
                table: table.to_string(),
                change: Change::Insert,
                columns: BTreeMap::new(),
            },
        );
        self.order.push(uuid);
        debug!(table, %uuid, "Queued row insert");
        Ok(uuid)
    }

    /// Write one column of a row
    pub fn set(&mut self, table: &str, uuid: Uuid, column: &str, datum: Datum) -> Result<()> {
        self.ensure_open()?;
        let column_schema = self.idl.schema().table(table)?.column(column)?;
        column_schema
            .column_type
            .check(&datum)
            .map_err(|e| IdlError::invalid_datum(format!("{}.{}: {}", table, column, e)))?;

        if self.row(table, &uuid).is_none() {
            return Err(IdlError::NoSuchRow {
                table: table.to_string(),
                uuid,
            });
        }

        let existing = self.pending.get(&uuid).map(|p| p.change);
        if existing != Some(Change::Insert) && !column_schema.mutable {
            return Err(IdlError::invalid_datum(format!(
                "{}.{} is immutable",
                table, column
            )));
        }
        if existing.is_none() {
            self.order.push(uuid);
        }
        self.pending
            .entry(uuid)
            .or_insert_with(|| PendingRow {
                table: table.to_string(),
                change: Change::Update,
                columns: BTreeMap::new(),
            })
            .columns
            .insert(column.to_string(), datum);
        Ok(())
    }

    /// Declare that the current value of `column` was read and must not
    /// change before commit
    pub fn verify(&mut self, table: &str, uuid: Uuid, column: &str) -> Result<()> {
        self.ensure_open()?;
        self.idl.schema().table(table)?.column(column)?;

        if matches!(self.pending.get(&uuid), Some(p) if p.change == Change::Insert) {
            return Ok(());
        }
        if self.snapshot.row(table, &uuid).is_none() {
            return Err(IdlError::NoSuchRow {
                table: table.to_string(),
                uuid,
            });
        }
        self.verified
            .entry((table.to_string(), uuid))
            .or_default()
            .insert(column.to_string());
        Ok(())
    }

    /// Delete a row
    pub fn delete(&mut self, table: &str, uuid: Uuid) -> Result<()> {
        self.ensure_open()?;
        if self.row(table, &uuid).is_none() {
            return Err(IdlError::NoSuchRow {
                table: table.to_string(),
                uuid,
            });
        }

        match self.pending.get(&uuid).map(|p| p.change) {
            Some(Change::Insert) => {
                self.pending.remove(&uuid);
                self.order.retain(|u| *u != uuid);
            }
            Some(_) => {
                if let Some(p) = self.pending.get_mut(&uuid) {
                    p.change = Change::Delete;
                    p.columns.clear();
                }
            }
            None => {
                self.pending.insert(
                    uuid,
                    PendingRow {
                        table: table.to_string(),
                        change: Change::Delete,
                        columns: BTreeMap::new(),
                    },
                );
                self.order.push(uuid);
            }
        }
        debug!(table, %uuid, "Queued row delete");
        Ok(())
    }

    /// A row as this transaction sees it
    pub fn row(&self, table: &str, uuid: &Uuid) -> Option<Row> {
        match self.pending.get(uuid) {
            Some(p) if p.table != table => None,
            Some(p) if p.change == Change::Delete => None,
            Some(p) if p.change == Change::Insert => {
                let table_schema = self.idl.schema().table(table).ok()?;
                let mut row = Row::new(*uuid);
                for (name, column) in &table_schema.columns {
                    row.columns
                        .insert(name.clone(), column.column_type.default_datum());
                }
                row.columns
                    .extend(p.columns.iter().map(|(c, d)| (c.clone(), d.clone())));
                Some(row)
            }
            Some(p) => {
                let mut row = self.snapshot.row(table, uuid)?.clone();
                row.columns
                    .extend(p.columns.iter().map(|(c, d)| (c.clone(), d.clone())));
                Some(row)
            }
            None => self.snapshot.row(table, uuid).cloned(),
        }
    }

    /// Every row of a table as this transaction sees it
    pub fn rows(&self, table: &str) -> Result<Vec<Row>> {
        let mut rows: Vec<Row> = self
            .snapshot
            .table(table)?
            .rows()
            .filter_map(|r| self.row(table, &r.uuid))
            .collect();
        for uuid in &self.order {
            if let Some(p) = self.pending.get(uuid) {
                if p.change == Change::Insert && p.table == table {
                    rows.extend(self.row(table, uuid));
                }
            }
        }
        Ok(rows)
    }

    /// First row of `table` matching `predicate`
    pub fn find(&self, table: &str, predicate: impl Fn(&Row) -> bool) -> Result<Option<Row>> {
        Ok(self.rows(table)?.into_iter().find(|r| predicate(r)))
    }

    /// Whether the transaction holds any write
    pub fn has_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Discard all queued changes
    pub fn abort(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.pending.clear();
        self.order.clear();
        self.verified.clear();
        self.status = TxnStatus::Aborted;
        debug!("Transaction aborted");
    }

    /// Send the transaction and wait for its outcome
    pub async fn commit(&mut self) -> Result<TxnStatus> {
        if self.status != TxnStatus::Uncommitted {
            return Ok(self.status);
        }
        if !self.has_changes() {
            self.status = TxnStatus::Unchanged;
            return Ok(self.status);
        }
        if !self.idl.is_connected() {
            return Err(IdlError::Disconnected);
        }

        let (operations, kinds) = self.operations()?;
        self.status = TxnStatus::Incomplete;

        let result = match self.idl.transact(operations).await {
            Ok(result) => result,
            Err(IdlError::Rpc { error, .. }) => {
                self.error = Some(error);
                self.status = TxnStatus::Error;
                return Ok(self.status);
            }
            Err(e) => {
                // The outcome of a timed-out commit is unknown
                self.status = match e {
                    IdlError::Timeout(_) => TxnStatus::Incomplete,
                    _ => TxnStatus::Error,
                };
                return Err(e);
            }
        };

        self.status = self.interpret(&result, &kinds)?;
        debug!(status = %self.status, "Transaction committed");

        if self.status == TxnStatus::Success {
            self.await_replica().await;
        }
        Ok(self.status)
    }

    fn operations(&self) -> Result<(Vec<Value>, Vec<OpKind>)> {
        let mut ops = Vec::new();
        let mut kinds = Vec::new();

        if let Some(lock) = self.idl.lock_name() {
            ops.push(json!({"op": "assert", "lock": lock}));
            kinds.push(OpKind::Assert);
        }

        for ((table, uuid), columns) in &self.verified {
            let Some(row) = self.snapshot.row(table, uuid) else {
                continue;
            };
            let mut expected = Map::new();
            for column in columns {
                let value = row.get(column).cloned().unwrap_or_else(Datum::empty_set);
                expected.insert(column.clone(), value.to_json());
            }
            ops.push(json!({
                "op": "wait",
                "table": table,
                "timeout": 0,
                "where": [["_uuid", "==", ["uuid", uuid.to_string()]]],
                "until": "==",
                "columns": columns,
                "rows": [expected],
            }));
            kinds.push(OpKind::Wait);
        }

        let named: HashMap<Uuid, String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.change == Change::Insert)
            .map(|(uuid, _)| (*uuid, format!("row{}", uuid.simple())))
            .collect();
        let encode = |columns: &BTreeMap<String, Datum>| {
            let mut row = Map::new();
            for (column, datum) in columns {
                let datum = datum.map_atoms(|atom| match atom {
                    Atom::Uuid(u) => named
                        .get(u)
                        .map(|n| Atom::NamedUuid(n.clone()))
                        .unwrap_or_else(|| atom.clone()),
                    other => other.clone(),
                });
                row.insert(column.clone(), datum.to_json());
            }
            Value::Object(row)
        };

        for uuid in &self.order {
            let Some(p) = self.pending.get(uuid) else {
                continue;
            };
            let selector = json!([["_uuid", "==", ["uuid", uuid.to_string()]]]);
            match p.change {
                Change::Insert => {
                    ops.push(json!({
                        "op": "insert",
                        "table": p.table,
                        "row": encode(&p.columns),
                        "uuid-name": named[uuid],
                    }));
                    kinds.push(OpKind::Insert(*uuid));
                }
                Change::Update if p.columns.is_empty() => {}
                Change::Update => {
                    ops.push(json!({
                        "op": "update",
                        "table": p.table,
                        "where": selector,
                        "row": encode(&p.columns),
                    }));
                    kinds.push(OpKind::Other);
                }
                Change::Delete => {
                    ops.push(json!({
                        "op": "delete",
                        "table": p.table,
                        "where": selector,
                    }));
                    kinds.push(OpKind::Other);
                }
            }
        }

        Ok((ops, kinds))
    }

    fn interpret(&mut self, result: &Value, kinds: &[OpKind]) -> Result<TxnStatus> {
        let results = result
            .as_array()
            .ok_or_else(|| IdlError::protocol(format!("bad transact reply: {}", result)))?;

        for (i, r) in results.iter().enumerate() {
            if let Some(error) = r.get("error").filter(|e| !e.is_null()) {
                let error = error.as_str().unwrap_or_default();
                let details = r.get("details").and_then(Value::as_str).unwrap_or_default();
                let status = match (kinds.get(i), error) {
                    (Some(OpKind::Wait), "timed out") => TxnStatus::TryAgain,
                    (Some(OpKind::Assert), "not owner") => TxnStatus::NotLocked,
                    _ => TxnStatus::Error,
                };
                if status == TxnStatus::Error {
                    warn!(error, details, "OVSDB rejected transaction");
                    self.error = Some(if details.is_empty() {
                        error.to_string()
                    } else {
                        format!("{}: {}", error, details)
                    });
                }
                return Ok(status);
            }

            if let Some(OpKind::Insert(temporary)) = kinds.get(i) {
                let real = r
                    .get("uuid")
                    .map(Atom::from_json)
                    .transpose()?
                    .and_then(|a| a.as_uuid())
                    .ok_or_else(|| IdlError::protocol(format!("insert reply without uuid: {}", r)))?;
                self.real_uuids.insert(*temporary, real);
            }
        }

        if results.len() < kinds.len() {
            return Err(IdlError::protocol(format!(
                "transact reply has {} results for {} operations",
                results.len(),
                kinds.len()
            )));
        }
        Ok(TxnStatus::Success)
    }

    /// Wait until the replica mirrors the committed changes, so callers
    /// reading it right after commit see their own writes
    async fn await_replica(&self) {
        let translate = |datum: &Datum| {
            datum.map_atoms(|atom| match atom {
                Atom::Uuid(u) => Atom::Uuid(self.real_uuids.get(u).copied().unwrap_or(*u)),
                other => other.clone(),
            })
        };

        let mut expectations = Vec::new();
        for uuid in &self.order {
            let Some(p) = self.pending.get(uuid) else {
                continue;
            };
            match p.change {
                Change::Insert => {
                    if let Some(real) = self.real_uuids.get(uuid) {
                        expectations.push(Expectation::Present {
                            table: p.table.clone(),
                            uuid: *real,
                        });
                    }
                }
                Change::Delete => expectations.push(Expectation::Absent {
                    table: p.table.clone(),
                    uuid: *uuid,
                }),
                Change::Update => {}
            }
        }
        // A transaction's changes arrive in a single update notification,
        // so column values only need checking when no row came or went
        if expectations.is_empty() {
            for uuid in &self.order {
                if let Some(p) = self.pending.get(uuid) {
                    expectations.push(Expectation::Columns {
                        table: p.table.clone(),
                        uuid: *uuid,
                        columns: p.columns.iter().map(|(c, d)| (c.clone(), translate(d))).collect(),
                    });
                }
            }
        }

        let timeout = self.idl.options().commit_sync_timeout;
        let wait = self
            .idl
            .wait_until(|replica| expectations.iter().all(|e| e.met(replica)));
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Replica not updated after commit: {}", e),
            Err(_) => warn!(?timeout, "Timed out waiting for committed changes in replica"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum OpKind {
    Assert,
    Wait,
    Insert(Uuid),
    Other,
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("status", &self.status)
            .field("seqno", &self.snapshot.seqno())
            .field("pending", &self.pending.len())
            .field("verified", &self.verified.len())
            .finish()
    }
}
