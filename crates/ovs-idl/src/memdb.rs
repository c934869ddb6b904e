//! In-memory OVSDB server
//!
//! Serves one database over a Unix socket with the subset of RFC 7047 the
//! IDL relies on: `list_dbs`, `get_schema`, `monitor`, `transact`, `echo`
//! and the lock methods. Transactions are atomic and monitor updates are
//! pushed to every subscriber before the committing client gets its reply.

use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::datum::{Atom, Datum};
use crate::error::{IdlError, Result};
use crate::protocol::{JsonFramer, Message, Request, Response};
use crate::replica::Row;
use crate::schema::DatabaseSchema;

type Rows = BTreeMap<Uuid, Row>;

/// Failure of a single transact operation
#[derive(Debug)]
struct OpError {
    error: &'static str,
    details: String,
}

impl OpError {
    fn new(error: &'static str, details: impl Into<String>) -> Self {
        Self {
            error,
            details: details.into(),
        }
    }

    fn syntax(details: impl Into<String>) -> Self {
        Self::new("syntax error", details)
    }

    fn constraint(details: impl Into<String>) -> Self {
        Self::new("constraint violation", details)
    }

    fn to_json(&self) -> Value {
        json!({"error": self.error, "details": self.details})
    }
}

type OpResult<T> = std::result::Result<T, OpError>;

struct Monitor {
    conn: u64,
    id: Value,
    /// table -> monitored columns
    tables: BTreeMap<String, Vec<String>>,
}

#[derive(Default)]
struct Database {
    tables: BTreeMap<String, Rows>,
    connections: HashMap<u64, mpsc::UnboundedSender<Value>>,
    monitors: Vec<Monitor>,
    lock_owners: HashMap<String, u64>,
    lock_waiters: HashMap<String, Vec<u64>>,
}

struct ServerInner {
    schema: DatabaseSchema,
    db: Mutex<Database>,
    next_conn: AtomicU64,
}

/// An OVSDB server keeping its single database in memory
#[derive(Clone)]
pub struct MemoryServer {
    inner: Arc<ServerInner>,
}

impl MemoryServer {
    pub fn new(schema: DatabaseSchema) -> Self {
        let tables = schema
            .tables
            .keys()
            .map(|name| (name.clone(), Rows::new()))
            .collect();
        Self {
            inner: Arc::new(ServerInner {
                schema,
                db: Mutex::new(Database {
                    tables,
                    ..Database::default()
                }),
                next_conn: AtomicU64::new(1),
            }),
        }
    }

    pub fn schema(&self) -> &DatabaseSchema {
        &self.inner.schema
    }

    /// Bind `socket_path` and serve connections on a background task
    pub fn spawn_unix(&self, socket_path: impl AsRef<Path>) -> Result<JoinHandle<()>> {
        let path = socket_path.as_ref();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)
            .map_err(|e| IdlError::connection(path.display().to_string(), e))?;
        info!("In-memory OVSDB listening on unix:{}", path.display());

        let server = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                let stream = match listener.accept().await {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!("In-memory OVSDB accept failed: {}", e);
                        break;
                    }
                };
                let inner = Arc::clone(&server.inner);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(inner, stream).await {
                        debug!("In-memory OVSDB connection ended: {}", e);
                    }
                });
            }
        }))
    }

    /// Run a transaction as if a client had sent it; returns the result array
    pub async fn transact(&self, operations: Vec<Value>) -> Value {
        let mut db = self.inner.db.lock().await;
        transact(&self.inner.schema, &mut db, 0, &operations)
    }

    /// Current rows of a table
    pub async fn rows(&self, table: &str) -> Vec<Row> {
        let db = self.inner.db.lock().await;
        db.tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of open client connections
    pub async fn connection_count(&self) -> usize {
        self.inner.db.lock().await.connections.len()
    }
}

async fn handle_connection(inner: Arc<ServerInner>, stream: UnixStream) -> Result<()> {
    let conn = inner.next_conn.fetch_add(1, Ordering::Relaxed);
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    inner.db.lock().await.connections.insert(conn, tx.clone());
    let writer_task = tokio::spawn(write_messages(writer, rx));
    debug!(conn, "In-memory OVSDB client connected");

    let outcome = serve_requests(&inner, conn, &mut reader, &tx).await;

    disconnect(&inner, conn).await;
    drop(tx);
    let _ = writer_task.await;
    debug!(conn, "In-memory OVSDB client disconnected");
    outcome
}

async fn serve_requests(
    inner: &ServerInner,
    conn: u64,
    reader: &mut tokio::net::unix::OwnedReadHalf,
    tx: &mpsc::UnboundedSender<Value>,
) -> Result<()> {
    let mut framer = JsonFramer::new();
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        framer.push(&buf[..n]);

        while let Some(value) = framer.next_value()? {
            match Message::classify(value)? {
                Message::Request(request) => {
                    let response = handle_method(inner, conn, request).await;
                    tx.send(serde_json::to_value(response)?)
                        .map_err(|_| IdlError::Disconnected)?;
                }
                Message::Notification { method, .. } => {
                    debug!(conn, "Ignoring client notification {}", method);
                }
                Message::Response(_) => {}
            }
        }
    }
}

async fn write_messages(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Value>) {
    while let Some(message) = rx.recv().await {
        let Ok(bytes) = serde_json::to_vec(&message) else {
            continue;
        };
        if writer.write_all(&bytes).await.is_err() {
            break;
        }
    }
}

async fn disconnect(inner: &ServerInner, conn: u64) {
    let mut db = inner.db.lock().await;
    db.connections.remove(&conn);
    db.monitors.retain(|m| m.conn != conn);
    for waiters in db.lock_waiters.values_mut() {
        waiters.retain(|c| *c != conn);
    }
    let held: Vec<String> = db
        .lock_owners
        .iter()
        .filter(|(_, owner)| **owner == conn)
        .map(|(name, _)| name.clone())
        .collect();
    for name in held {
        release_lock(&mut db, &name);
    }
}

/// Hand a lock to its next waiter, if any
fn release_lock(db: &mut Database, name: &str) {
    db.lock_owners.remove(name);
    let next = db
        .lock_waiters
        .get_mut(name)
        .filter(|w| !w.is_empty())
        .map(|w| w.remove(0));
    if let Some(next) = next {
        db.lock_owners.insert(name.to_string(), next);
        notify(db, next, "locked", json!([name]));
    }
}

fn notify(db: &Database, conn: u64, method: &str, params: Value) {
    if let Some(tx) = db.connections.get(&conn) {
        if let Ok(message) = serde_json::to_value(Request::notification(method, params)) {
            let _ = tx.send(message);
        }
    }
}

async fn handle_method(inner: &ServerInner, conn: u64, request: Request) -> Response {
    let schema = &inner.schema;
    let params = request.params.as_array().cloned().unwrap_or_default();
    let lock_name = params.first().and_then(Value::as_str).map(str::to_string);

    let result = match request.method.as_str() {
        "list_dbs" => json!([schema.name]),

        "echo" => request.params.clone(),

        "get_schema" => {
            if params.first().and_then(Value::as_str) != Some(schema.name.as_str()) {
                return Response::error(request.id, "unknown database");
            }
            schema.to_json().clone()
        }

        "monitor" => {
            if params.first().and_then(Value::as_str) != Some(schema.name.as_str()) {
                return Response::error(request.id, "unknown database");
            }
            let monitor_id = params.get(1).cloned().unwrap_or(Value::Null);
            let requests = params.get(2).cloned().unwrap_or_else(|| json!({}));
            let mut db = inner.db.lock().await;
            match add_monitor(schema, &mut db, conn, monitor_id, &requests) {
                Ok(initial) => initial,
                Err(e) => return Response::error(request.id, e.details),
            }
        }

        "transact" => {
            if params.first().and_then(Value::as_str) != Some(schema.name.as_str()) {
                return Response::error(request.id, "unknown database");
            }
            let mut db = inner.db.lock().await;
            transact(schema, &mut db, conn, &params[1..])
        }

        "lock" | "steal" | "unlock" => {
            let Some(name) = lock_name else {
                return Response::error(request.id, "lock name required");
            };
            let mut db = inner.db.lock().await;
            lock_method(&mut db, conn, &request.method, &name)
        }

        other => {
            return Response::error(request.id, format!("unknown method {}", other));
        }
    };

    Response::success(request.id, result)
}

fn lock_method(db: &mut Database, conn: u64, method: &str, name: &str) -> Value {
    match method {
        "lock" => match db.lock_owners.get(name) {
            None => {
                db.lock_owners.insert(name.to_string(), conn);
                json!({"locked": true})
            }
            Some(owner) if *owner == conn => json!({"locked": true}),
            Some(_) => {
                db.lock_waiters.entry(name.to_string()).or_default().push(conn);
                json!({"locked": false})
            }
        },
        "steal" => {
            if let Some(previous) = db.lock_owners.insert(name.to_string(), conn) {
                if previous != conn {
                    notify(db, previous, "stolen", json!([name]));
                }
            }
            json!({"locked": true})
        }
        _ => {
            if db.lock_owners.get(name) == Some(&conn) {
                release_lock(db, name);
            }
            if let Some(waiters) = db.lock_waiters.get_mut(name) {
                waiters.retain(|c| *c != conn);
            }
            json!({})
        }
    }
}

fn add_monitor(
    schema: &DatabaseSchema,
    db: &mut Database,
    conn: u64,
    monitor_id: Value,
    requests: &Value,
) -> OpResult<Value> {
    let requests = requests
        .as_object()
        .ok_or_else(|| OpError::syntax("monitor requests must be an object"))?;

    let mut tables = BTreeMap::new();
    for (table, request) in requests {
        let table_schema = schema
            .table(table)
            .map_err(|e| OpError::syntax(e.to_string()))?;
        // A request may be a single object or an array of them
        let list = match request {
            Value::Array(list) => list.clone(),
            other => vec![other.clone()],
        };
        let mut columns: Vec<String> = Vec::new();
        for item in &list {
            match item.get("columns").and_then(Value::as_array) {
                Some(cols) => {
                    for col in cols.iter().filter_map(Value::as_str) {
                        table_schema
                            .column(col)
                            .map_err(|e| OpError::syntax(e.to_string()))?;
                        columns.push(col.to_string());
                    }
                }
                None => columns.extend(table_schema.columns.keys().cloned()),
            }
        }
        tables.insert(table.clone(), columns);
    }

    let mut initial = Map::new();
    for (table, columns) in &tables {
        let mut rows = Map::new();
        for row in db.tables.get(table).into_iter().flat_map(|r| r.values()) {
            rows.insert(row.uuid.to_string(), json!({"new": project(row, columns)}));
        }
        if !rows.is_empty() {
            initial.insert(table.clone(), Value::Object(rows));
        }
    }

    db.monitors.push(Monitor {
        conn,
        id: monitor_id,
        tables,
    });
    Ok(Value::Object(initial))
}

fn project(row: &Row, columns: &[String]) -> Value {
    let mut obj = Map::new();
    for column in columns {
        if let Some(datum) = row.get(column) {
            obj.insert(column.clone(), datum.to_json());
        }
    }
    Value::Object(obj)
}

fn transact(schema: &DatabaseSchema, db: &mut Database, conn: u64, ops: &[Value]) -> Value {
    let mut work = db.tables.clone();
    let mut results = Vec::with_capacity(ops.len());

    // uuid-names are visible to every operation of the transaction
    let mut named = HashMap::new();
    for op in ops {
        if op.get("op").and_then(Value::as_str) == Some("insert") {
            if let Some(name) = op.get("uuid-name").and_then(Value::as_str) {
                named.insert(name.to_string(), Uuid::new_v4());
            }
        }
    }

    let mut ctx = TxnContext {
        schema,
        conn,
        named: &named,
        lock_owners: &db.lock_owners,
    };
    for op in ops {
        match ctx.execute(&mut work, op) {
            Ok(result) => results.push(result),
            Err(e) => {
                debug!(error = e.error, details = %e.details, "In-memory transaction failed");
                results.push(e.to_json());
                return Value::Array(results);
            }
        }
    }

    if let Err(e) = check_integrity(schema, &work) {
        debug!(error = e.error, details = %e.details, "In-memory commit rejected");
        results.push(e.to_json());
        return Value::Array(results);
    }

    let previous = std::mem::replace(&mut db.tables, work);
    publish(db, &previous);
    Value::Array(results)
}

/// Send monitor updates describing the move from `previous` to the current tables
fn publish(db: &Database, previous: &BTreeMap<String, Rows>) {
    let empty = Rows::new();
    for monitor in &db.monitors {
        let mut updates = Map::new();
        for (table, columns) in &monitor.tables {
            let old_rows = previous.get(table).unwrap_or(&empty);
            let new_rows = db.tables.get(table).unwrap_or(&empty);

            let mut changes = Map::new();
            for (uuid, old) in old_rows {
                match new_rows.get(uuid) {
                    None => {
                        changes.insert(uuid.to_string(), json!({"old": project(old, columns)}));
                    }
                    Some(new) => {
                        let changed: Vec<String> = columns
                            .iter()
                            .filter(|c| old.get(c) != new.get(c))
                            .cloned()
                            .collect();
                        if !changed.is_empty() {
                            changes.insert(
                                uuid.to_string(),
                                json!({
                                    "old": project(old, &changed),
                                    "new": project(new, columns),
                                }),
                            );
                        }
                    }
                }
            }
            for (uuid, new) in new_rows {
                if !old_rows.contains_key(uuid) {
                    changes.insert(uuid.to_string(), json!({"new": project(new, columns)}));
                }
            }

            if !changes.is_empty() {
                updates.insert(table.clone(), Value::Object(changes));
            }
        }

        if !updates.is_empty() {
            notify(
                db,
                monitor.conn,
                "update",
                json!([monitor.id, Value::Object(updates)]),
            );
        }
    }
}

/// Commit-time checks: column constraints, indexes, row limits, references
fn check_integrity(schema: &DatabaseSchema, tables: &BTreeMap<String, Rows>) -> OpResult<()> {
    for (name, rows) in tables {
        let Ok(table) = schema.table(name) else {
            continue;
        };

        if let Some(max) = table.max_rows {
            if rows.len() > max {
                return Err(OpError::constraint(format!(
                    "Too many rows in {} table ({} > {})",
                    name,
                    rows.len(),
                    max
                )));
            }
        }

        for row in rows.values() {
            for (column, def) in &table.columns {
                let datum = row
                    .get(column)
                    .cloned()
                    .unwrap_or_else(|| def.column_type.default_datum());
                def.column_type.check(&datum).map_err(|e| {
                    OpError::constraint(format!("{}.{} of row {}: {}", name, column, row.uuid, e))
                })?;

                let refs = [
                    def.column_type.key.ref_table.as_deref(),
                    def.column_type.value.as_ref().and_then(|v| v.ref_table.as_deref()),
                ];
                for (position, ref_table) in refs.into_iter().enumerate() {
                    let Some(ref_table) = ref_table else {
                        continue;
                    };
                    let targets: Vec<Uuid> = match (&datum, position) {
                        (Datum::Set(atoms), 0) => atoms.iter().filter_map(Atom::as_uuid).collect(),
                        (Datum::Map(pairs), 0) => pairs.iter().filter_map(|(k, _)| k.as_uuid()).collect(),
                        (Datum::Map(pairs), _) => pairs.iter().filter_map(|(_, v)| v.as_uuid()).collect(),
                        _ => Vec::new(),
                    };
                    let existing = tables.get(ref_table);
                    for target in targets {
                        if !existing.is_some_and(|t| t.contains_key(&target)) {
                            return Err(OpError::new(
                                "referential integrity violation",
                                format!(
                                    "{}.{} of row {} refers to missing {} row {}",
                                    name, column, row.uuid, ref_table, target
                                ),
                            ));
                        }
                    }
                }
            }
        }

        for index in &table.indexes {
            let mut seen = HashSet::new();
            for row in rows.values() {
                let key: Vec<String> = index
                    .iter()
                    .map(|c| row.get(c).map(|d| d.to_json().to_string()).unwrap_or_default())
                    .collect();
                if !seen.insert(key.clone()) {
                    return Err(OpError::constraint(format!(
                        "Transaction causes multiple rows in \"{}\" table to have identical values ({}) for index on columns {:?}",
                        name,
                        key.join(", "),
                        index
                    )));
                }
            }
        }
    }
    Ok(())
}

struct Condition {
    column: String,
    function: String,
    value: Datum,
}

struct TxnContext<'a> {
    schema: &'a DatabaseSchema,
    conn: u64,
    named: &'a HashMap<String, Uuid>,
    lock_owners: &'a HashMap<String, u64>,
}

impl TxnContext<'_> {
    fn execute(&mut self, tables: &mut BTreeMap<String, Rows>, op: &Value) -> OpResult<Value> {
        let kind = op
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| OpError::syntax("operation without op"))?;

        match kind {
            "comment" | "commit" => Ok(json!({})),
            "abort" => Err(OpError::new("aborted", "aborted by request")),
            "assert" => {
                let lock = op.get("lock").and_then(Value::as_str).unwrap_or_default();
                if self.lock_owners.get(lock) == Some(&self.conn) {
                    Ok(json!({}))
                } else {
                    Err(OpError::new("not owner", format!("lock {} not held", lock)))
                }
            }
            "insert" => self.insert(tables, op),
            "select" => self.select(tables, op),
            "update" => self.update(tables, op),
            "mutate" => self.mutate(tables, op),
            "delete" => self.delete(tables, op),
            "wait" => self.wait(tables, op),
            other => Err(OpError::syntax(format!("unknown operation {}", other))),
        }
    }

    fn table_name<'v>(&self, op: &'v Value) -> OpResult<&'v str> {
        let name = op
            .get("table")
            .and_then(Value::as_str)
            .ok_or_else(|| OpError::syntax("operation without table"))?;
        self.schema
            .table(name)
            .map_err(|e| OpError::syntax(e.to_string()))?;
        Ok(name)
    }

    fn resolve(&self, value: &Value) -> OpResult<Datum> {
        let datum = Datum::from_json(value).map_err(|e| OpError::syntax(e.to_string()))?;
        for atom in datum_atoms(&datum) {
            if let Atom::NamedUuid(name) = atom {
                if !self.named.contains_key(name) {
                    return Err(OpError::syntax(format!("unknown uuid-name {}", name)));
                }
            }
        }
        Ok(datum.map_atoms(|atom| match atom {
            Atom::NamedUuid(name) => self
                .named
                .get(name)
                .map(|u| Atom::Uuid(*u))
                .unwrap_or_else(|| atom.clone()),
            other => other.clone(),
        }))
    }

    fn row_values(&self, table: &str, op: &Value, row: &mut Row, initial: bool) -> OpResult<()> {
        let table_schema = self
            .schema
            .table(table)
            .map_err(|e| OpError::syntax(e.to_string()))?;
        let Some(values) = op.get("row").and_then(Value::as_object) else {
            return if initial {
                Ok(())
            } else {
                Err(OpError::syntax("operation without row"))
            };
        };

        for (column, value) in values {
            let def = table_schema
                .column(column)
                .map_err(|e| OpError::syntax(e.to_string()))?;
            if !initial && !def.mutable {
                return Err(OpError::constraint(format!(
                    "Cannot update immutable column {} in table {}",
                    column, table
                )));
            }
            row.columns.insert(column.clone(), self.resolve(value)?);
        }
        Ok(())
    }

    fn conditions(&self, op: &Value) -> OpResult<Vec<Condition>> {
        let clauses = op
            .get("where")
            .and_then(Value::as_array)
            .ok_or_else(|| OpError::syntax("operation without where"))?;

        clauses
            .iter()
            .map(|clause| match clause.as_array() {
                Some(parts) if parts.len() == 3 => Ok(Condition {
                    column: parts[0]
                        .as_str()
                        .ok_or_else(|| OpError::syntax("bad condition column"))?
                        .to_string(),
                    function: parts[1]
                        .as_str()
                        .ok_or_else(|| OpError::syntax("bad condition function"))?
                        .to_string(),
                    value: self.resolve(&parts[2])?,
                }),
                _ => Err(OpError::syntax(format!("bad condition {}", clause))),
            })
            .collect()
    }

    fn matching(&self, rows: &Rows, conditions: &[Condition]) -> OpResult<Vec<Uuid>> {
        let mut out = Vec::new();
        for row in rows.values() {
            let mut all = true;
            for cond in conditions {
                if !condition_holds(row, cond)? {
                    all = false;
                    break;
                }
            }
            if all {
                out.push(row.uuid);
            }
        }
        Ok(out)
    }

    fn insert(&mut self, tables: &mut BTreeMap<String, Rows>, op: &Value) -> OpResult<Value> {
        let table = self.table_name(op)?;
        let table_schema = self
            .schema
            .table(table)
            .map_err(|e| OpError::syntax(e.to_string()))?;

        let uuid = match op.get("uuid-name").and_then(Value::as_str) {
            Some(name) => self.named.get(name).copied().unwrap_or_else(Uuid::new_v4),
            None => Uuid::new_v4(),
        };
        let mut row = Row::new(uuid);
        for (name, column) in &table_schema.columns {
            row.columns
                .insert(name.clone(), column.column_type.default_datum());
        }
        self.row_values(table, op, &mut row, true)?;

        tables.entry(table.to_string()).or_default().insert(uuid, row);
        Ok(json!({"uuid": ["uuid", uuid.to_string()]}))
    }

    fn select(&mut self, tables: &mut BTreeMap<String, Rows>, op: &Value) -> OpResult<Value> {
        let table = self.table_name(op)?;
        let conditions = self.conditions(op)?;
        let columns: Option<Vec<String>> = op.get("columns").and_then(Value::as_array).map(|c| {
            c.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        });

        let empty = Rows::new();
        let rows = tables.get(table).unwrap_or(&empty);
        let mut out = Vec::new();
        for uuid in self.matching(rows, &conditions)? {
            let Some(row) = rows.get(&uuid) else {
                continue;
            };
            let mut value = match &columns {
                Some(columns) => project(row, columns),
                None => row.to_json(),
            };
            let wants_uuid = columns.as_ref().map_or(true, |c| c.iter().any(|c| c == "_uuid"));
            if wants_uuid {
                value["_uuid"] = json!(["uuid", uuid.to_string()]);
            }
            out.push(value);
        }
        Ok(json!({"rows": out}))
    }

    fn update(&mut self, tables: &mut BTreeMap<String, Rows>, op: &Value) -> OpResult<Value> {
        let table = self.table_name(op)?;
        let conditions = self.conditions(op)?;
        let rows = tables.entry(table.to_string()).or_default();
        let targets = self.matching(rows, &conditions)?;

        for uuid in &targets {
            if let Some(row) = rows.get_mut(uuid) {
                self.row_values(table, op, row, false)?;
            }
        }
        Ok(json!({"count": targets.len()}))
    }

    fn mutate(&mut self, tables: &mut BTreeMap<String, Rows>, op: &Value) -> OpResult<Value> {
        let table = self.table_name(op)?;
        let conditions = self.conditions(op)?;
        let mutations = op
            .get("mutations")
            .and_then(Value::as_array)
            .ok_or_else(|| OpError::syntax("mutate without mutations"))?;

        let mut parsed = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            match mutation.as_array() {
                Some(parts) if parts.len() == 3 => {
                    let column = parts[0]
                        .as_str()
                        .ok_or_else(|| OpError::syntax("bad mutation column"))?;
                    let mutator = parts[1]
                        .as_str()
                        .ok_or_else(|| OpError::syntax("bad mutator"))?;
                    parsed.push((column.to_string(), mutator.to_string(), self.resolve(&parts[2])?));
                }
                _ => return Err(OpError::syntax(format!("bad mutation {}", mutation))),
            }
        }

        let rows = tables.entry(table.to_string()).or_default();
        let targets = self.matching(rows, &conditions)?;
        for uuid in &targets {
            let Some(row) = rows.get_mut(uuid) else {
                continue;
            };
            for (column, mutator, value) in &parsed {
                let current = row.columns.entry(column.clone()).or_insert_with(Datum::empty_set);
                apply_mutation(current, mutator, value)?;
            }
        }
        Ok(json!({"count": targets.len()}))
    }

    fn delete(&mut self, tables: &mut BTreeMap<String, Rows>, op: &Value) -> OpResult<Value> {
        let table = self.table_name(op)?;
        let conditions = self.conditions(op)?;
        let rows = tables.entry(table.to_string()).or_default();
        let targets = self.matching(rows, &conditions)?;
        for uuid in &targets {
            rows.remove(uuid);
        }
        Ok(json!({"count": targets.len()}))
    }

    fn wait(&mut self, tables: &mut BTreeMap<String, Rows>, op: &Value) -> OpResult<Value> {
        let table = self.table_name(op)?;
        let conditions = self.conditions(op)?;
        let until = op.get("until").and_then(Value::as_str).unwrap_or("==");
        let columns: Vec<String> = op
            .get("columns")
            .and_then(Value::as_array)
            .map(|c| c.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let expected_rows = op
            .get("rows")
            .and_then(Value::as_array)
            .ok_or_else(|| OpError::syntax("wait without rows"))?;

        let mut expected = Vec::with_capacity(expected_rows.len());
        for row in expected_rows {
            let obj = row
                .as_object()
                .ok_or_else(|| OpError::syntax("wait row is not an object"))?;
            let mut values = BTreeMap::new();
            for column in &columns {
                let value = obj
                    .get(column)
                    .ok_or_else(|| OpError::syntax(format!("wait row lacks {}", column)))?;
                values.insert(column.clone(), self.resolve(value)?);
            }
            expected.push(values);
        }

        let empty = Rows::new();
        let rows = tables.get(table).unwrap_or(&empty);
        let actual: Vec<BTreeMap<String, Datum>> = self
            .matching(rows, &conditions)?
            .iter()
            .filter_map(|uuid| rows.get(uuid))
            .map(|row| {
                columns
                    .iter()
                    .map(|c| (c.clone(), row.get(c).cloned().unwrap_or_else(Datum::empty_set)))
                    .collect()
            })
            .collect();

        let equal = actual.len() == expected.len() && actual.iter().all(|r| expected.contains(r));
        let satisfied = match until {
            "==" => equal,
            "!=" => !equal,
            other => return Err(OpError::syntax(format!("bad until {}", other))),
        };
        if satisfied {
            Ok(json!({}))
        } else {
            Err(OpError::new("timed out", format!("wait on {} not satisfied", table)))
        }
    }
}

fn datum_atoms(datum: &Datum) -> Vec<&Atom> {
    match datum {
        Datum::Set(atoms) => atoms.iter().collect(),
        Datum::Map(pairs) => pairs.iter().flat_map(|(k, v)| [k, v]).collect(),
    }
}

fn condition_holds(row: &Row, cond: &Condition) -> OpResult<bool> {
    let actual = if cond.column == "_uuid" {
        Datum::scalar(row.uuid)
    } else {
        row.get(&cond.column).cloned().unwrap_or_else(Datum::empty_set)
    };

    let ordering = || -> OpResult<std::cmp::Ordering> {
        match (actual.as_atom(), cond.value.as_atom()) {
            (Some(Atom::Integer(a)), Some(Atom::Integer(b))) => Ok(a.cmp(b)),
            (Some(Atom::Real(a)), Some(Atom::Real(b))) => a
                .partial_cmp(b)
                .ok_or_else(|| OpError::syntax("unordered reals")),
            _ => Err(OpError::syntax(format!(
                "{} not applicable to {}",
                cond.function, cond.column
            ))),
        }
    };

    Ok(match cond.function.as_str() {
        "==" => actual == cond.value,
        "!=" => actual != cond.value,
        "includes" => cond.value.atoms().into_iter().all(|a| actual.contains(a)),
        "excludes" => cond.value.atoms().into_iter().all(|a| !actual.contains(a)),
        "<" => ordering()?.is_lt(),
        "<=" => ordering()?.is_le(),
        ">" => ordering()?.is_gt(),
        ">=" => ordering()?.is_ge(),
        other => return Err(OpError::syntax(format!("unknown function {}", other))),
    })
}

fn apply_mutation(current: &mut Datum, mutator: &str, value: &Datum) -> OpResult<()> {
    match (mutator, current, value) {
        ("insert", Datum::Set(atoms), Datum::Set(new)) => {
            for atom in new {
                if !atoms.contains(atom) {
                    atoms.push(atom.clone());
                }
            }
        }
        ("insert", Datum::Map(pairs), Datum::Map(new)) => {
            for (k, v) in new {
                if !pairs.iter().any(|(existing, _)| existing == k) {
                    pairs.push((k.clone(), v.clone()));
                }
            }
        }
        ("delete", current, value) => {
            for atom in value.atoms() {
                current.remove(atom);
            }
        }
        ("+=", Datum::Set(atoms), Datum::Set(by)) if atoms.len() == 1 && by.len() == 1 => {
            match (&mut atoms[0], &by[0]) {
                (Atom::Integer(a), Atom::Integer(b)) => {
                    *a = a
                        .checked_add(*b)
                        .ok_or_else(|| OpError::constraint("integer overflow in +="))?;
                }
                _ => return Err(OpError::constraint("+= applies to integers")),
            }
        }
        (other, _, _) => {
            return Err(OpError::syntax(format!("unsupported mutator {}", other)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::vswitch_schema_json;

    fn server() -> MemoryServer {
        MemoryServer::new(DatabaseSchema::from_json(vswitch_schema_json()).unwrap())
    }

    #[tokio::test]
    async fn test_insert_with_named_uuids() {
        let server = server();
        let result = server
            .transact(vec![
                json!({"op": "insert", "table": "Interface", "row": {"name": "br0", "type": "internal"},
                       "uuid-name": "i"}),
                json!({"op": "insert", "table": "Port",
                       "row": {"name": "br0", "interfaces": ["named-uuid", "i"]}, "uuid-name": "p"}),
            ])
            .await;
        assert!(result[0]["uuid"].is_array());
        assert!(result[1]["uuid"].is_array());

        let ports = server.rows("Port").await;
        let ifaces = server.rows("Interface").await;
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].uuids("interfaces"), vec![ifaces[0].uuid]);
    }

    #[tokio::test]
    async fn test_failed_operation_discards_transaction() {
        let server = server();
        let result = server
            .transact(vec![
                json!({"op": "insert", "table": "Bridge", "row": {"name": "br0"}}),
                json!({"op": "wait", "table": "Bridge", "timeout": 0,
                       "where": [["name", "==", "br0"]], "until": "==",
                       "columns": ["name"], "rows": []}),
            ])
            .await;
        assert_eq!(result[1]["error"], "timed out");
        assert!(server.rows("Bridge").await.is_empty());
    }

    #[tokio::test]
    async fn test_index_and_reference_constraints() {
        let server = server();
        let dup = server
            .transact(vec![
                json!({"op": "insert", "table": "Bridge", "row": {"name": "br0"}}),
                json!({"op": "insert", "table": "Bridge", "row": {"name": "br0"}}),
            ])
            .await;
        assert_eq!(dup[2]["error"], "constraint violation");

        let dangling = server
            .transact(vec![json!({"op": "insert", "table": "Bridge",
                                  "row": {"name": "br1",
                                          "ports": ["uuid", Uuid::new_v4().to_string()]}})])
            .await;
        assert_eq!(dangling[1]["error"], "referential integrity violation");

        let empty_port = server
            .transact(vec![json!({"op": "insert", "table": "Port",
                                  "row": {"name": "p1", "interfaces": ["set", []]}})])
            .await;
        assert_eq!(empty_port[1]["error"], "constraint violation");
        assert!(server.rows("Bridge").await.is_empty());
    }

    #[tokio::test]
    async fn test_mutate_select_delete() {
        let server = server();
        server
            .transact(vec![
                json!({"op": "insert", "table": "Open_vSwitch", "row": {}}),
                json!({"op": "insert", "table": "Bridge", "row": {"name": "br0"}, "uuid-name": "b"}),
                json!({"op": "mutate", "table": "Open_vSwitch", "where": [],
                       "mutations": [["bridges", "insert", ["set", [["named-uuid", "b"]]]]]}),
            ])
            .await;

        let selected = server
            .transact(vec![json!({"op": "select", "table": "Bridge",
                                  "where": [["name", "==", "br0"]], "columns": ["_uuid", "name"]})])
            .await;
        let uuid = selected[0]["rows"][0]["_uuid"][1].as_str().unwrap().to_string();
        assert_eq!(selected[0]["rows"][0]["name"], "br0");

        let root = &server.rows("Open_vSwitch").await[0];
        assert_eq!(root.uuids("bridges"), vec![Uuid::parse_str(&uuid).unwrap()]);

        // Still referenced by the root row
        let blocked = server
            .transact(vec![json!({"op": "delete", "table": "Bridge",
                                  "where": [["_uuid", "==", ["uuid", uuid]]]})])
            .await;
        assert_eq!(blocked[1]["error"], "referential integrity violation");

        let removed = server
            .transact(vec![
                json!({"op": "mutate", "table": "Open_vSwitch", "where": [],
                       "mutations": [["bridges", "delete", ["uuid", uuid]]]}),
                json!({"op": "delete", "table": "Bridge", "where": [["name", "==", "br0"]]}),
            ])
            .await;
        assert_eq!(removed[1]["count"], 1);
        assert!(server.rows("Bridge").await.is_empty());
    }

    #[test]
    fn test_integer_mutation_overflow() {
        let mut tag = Datum::from(41i64);
        apply_mutation(&mut tag, "+=", &Datum::from(1i64)).unwrap();
        assert_eq!(tag, Datum::from(42i64));

        let mut tag = Datum::from(i64::MAX);
        let err = apply_mutation(&mut tag, "+=", &Datum::from(1i64)).unwrap_err();
        assert_eq!(err.error, "constraint violation");
        assert_eq!(tag, Datum::from(i64::MAX));
    }

    #[test]
    fn test_lock_handoff() {
        let mut db = Database::default();
        assert_eq!(lock_method(&mut db, 1, "lock", "l"), json!({"locked": true}));
        assert_eq!(lock_method(&mut db, 2, "lock", "l"), json!({"locked": false}));
        lock_method(&mut db, 1, "unlock", "l");
        assert_eq!(db.lock_owners.get("l"), Some(&2));
        lock_method(&mut db, 3, "steal", "l");
        assert_eq!(db.lock_owners.get("l"), Some(&3));
    }
}
