//! OVSDB IDL session
//!
//! Connects to ovsdb-server, monitors the registered tables and keeps a
//! [`Replica`] of them current. A reader task owns the socket's read half
//! and applies update notifications in arrival order, so replies and
//! updates are observed in the order the server sent them.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{IdlError, Result};
use crate::protocol::{JsonFramer, Message, Request, Response};
use crate::replica::Replica;
use crate::schema::{DatabaseSchema, SchemaHelper};
use crate::transaction::Transaction;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// No monitor request outstanding
const NO_MONITOR: u64 = u64::MAX;

/// Where ovsdb-server listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Remote {
    Unix(PathBuf),
    Tcp(String),
}

impl Remote {
    /// Parse `unix:PATH`, `tcp:HOST:PORT` or a bare socket path
    pub fn parse(remote: &str) -> Result<Self> {
        if let Some(path) = remote.strip_prefix("unix:") {
            return Ok(Remote::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = remote.strip_prefix("tcp:") {
            if addr.is_empty() {
                return Err(IdlError::connection(remote, "missing host:port"));
            }
            return Ok(Remote::Tcp(addr.to_string()));
        }
        if remote.starts_with('/') {
            return Ok(Remote::Unix(PathBuf::from(remote)));
        }
        Err(IdlError::connection(remote, "unsupported remote (expected unix: or tcp:)"))
    }

    async fn connect(&self) -> std::io::Result<(BoxedReader, BoxedWriter)> {
        match self {
            Remote::Unix(path) => {
                let (r, w) = UnixStream::connect(path).await?.into_split();
                Ok((Box::new(r), Box::new(w)))
            }
            Remote::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w)))
            }
        }
    }
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remote::Unix(path) => write!(f, "unix:{}", path.display()),
            Remote::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct IdlOptions {
    /// Deadline for a single JSON-RPC round-trip
    pub rpc_timeout: Duration,
    /// How long a successful commit waits for its changes to reach the replica
    pub commit_sync_timeout: Duration,
    /// Database lock to acquire; transactions then assert ownership
    pub lock_name: Option<String>,
}

impl Default for IdlOptions {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(30),
            commit_sync_timeout: Duration::from_secs(5),
            lock_name: None,
        }
    }
}

/// State published by the reader task
#[derive(Debug, Clone)]
struct SessionState {
    replica: Arc<Replica>,
    connected: bool,
    has_lock: bool,
}

/// Request/response plumbing shared by the session and its tasks
struct RpcChannel {
    outgoing: mpsc::UnboundedSender<Value>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    next_id: AtomicU64,
    monitor_request: AtomicU64,
    timeout: Duration,
}

impl RpcChannel {
    fn send(&self, message: Value) -> Result<()> {
        self.outgoing.send(message).map_err(|_| IdlError::Disconnected)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.call_with_id(id, method, params).await
    }

    async fn call_with_id(&self, id: u64, method: &str, params: Value) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = serde_json::to_value(Request::new(method, params, id))?;
        trace!("OVSDB request: {}", request);
        if let Err(e) = self.send(request) {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(IdlError::Disconnected),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(IdlError::Timeout(format!("{} reply", method)));
            }
        };

        if response.is_error() {
            return Err(IdlError::Rpc {
                method: method.to_string(),
                error: response.error.to_string(),
            });
        }
        Ok(response.result)
    }
}

/// A live IDL session with its replica
pub struct Idl {
    remote: Remote,
    schema: Arc<DatabaseSchema>,
    rpc: Arc<RpcChannel>,
    state: Arc<watch::Sender<SessionState>>,
    options: IdlOptions,
    tasks: Vec<JoinHandle<()>>,
}

impl Idl {
    /// Connect, start monitoring every registered table and wait for the
    /// initial snapshot
    pub async fn connect(remote: &str, helper: &SchemaHelper, options: IdlOptions) -> Result<Self> {
        let schema = Arc::new(helper.idl_schema()?);
        let remote = Remote::parse(remote)?;

        debug!("Connecting to OVSDB at {}", remote);
        let (reader, writer) = remote
            .connect()
            .await
            .map_err(|e| IdlError::connection(remote.to_string(), e))?;

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let rpc = Arc::new(RpcChannel {
            outgoing,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            monitor_request: AtomicU64::new(NO_MONITOR),
            timeout: options.rpc_timeout,
        });
        let (state, _) = watch::channel(SessionState {
            replica: Arc::new(Replica::new(&schema)),
            connected: true,
            has_lock: false,
        });
        let state = Arc::new(state);

        let tasks = vec![
            tokio::spawn(write_loop(writer, outgoing_rx)),
            tokio::spawn(read_loop(
                reader,
                Arc::clone(&rpc),
                Arc::clone(&state),
                options.lock_name.clone(),
            )),
        ];

        let idl = Self {
            remote,
            schema,
            rpc,
            state,
            options,
            tasks,
        };
        idl.start_monitor().await?;
        if let Some(lock) = idl.options.lock_name.clone() {
            idl.request_lock(&lock).await?;
        }

        info!(
            remote = %idl.remote,
            seqno = idl.change_seqno(),
            "OVSDB replica synchronized"
        );
        Ok(idl)
    }

    async fn start_monitor(&self) -> Result<()> {
        let mut requests = Map::new();
        for (name, table) in &self.schema.tables {
            let columns: Vec<&String> = table.columns.keys().collect();
            requests.insert(name.clone(), json!({ "columns": columns }));
        }

        let id = self.rpc.next_id.fetch_add(1, Ordering::Relaxed);
        self.rpc.monitor_request.store(id, Ordering::SeqCst);
        // The reader task installs the snapshot before handing back the reply
        self.rpc
            .call_with_id(
                id,
                "monitor",
                json!([self.schema.name, Value::Null, Value::Object(requests)]),
            )
            .await?;
        Ok(())
    }

    async fn request_lock(&self, lock: &str) -> Result<()> {
        let result = self.rpc.call("lock", json!([lock])).await?;
        let locked = result.get("locked").and_then(Value::as_bool).unwrap_or(false);
        if locked {
            self.state.send_modify(|s| s.has_lock = true);
        }
        debug!(lock, locked, "Requested database lock");
        Ok(())
    }

    pub fn remote(&self) -> &Remote {
        &self.remote
    }

    /// The schema restricted to the replicated tables and columns
    pub fn schema(&self) -> &DatabaseSchema {
        &self.schema
    }

    pub fn options(&self) -> &IdlOptions {
        &self.options
    }

    /// Current change-sequence number of the replica
    pub fn change_seqno(&self) -> u64 {
        self.state.borrow().replica.seqno()
    }

    /// Consistent view of the replica as of now
    pub fn snapshot(&self) -> Arc<Replica> {
        Arc::clone(&self.state.borrow().replica)
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    pub fn lock_name(&self) -> Option<&str> {
        self.options.lock_name.as_deref()
    }

    pub fn has_lock(&self) -> bool {
        self.state.borrow().has_lock
    }

    /// Suspend until the change-sequence number moves past `last_seen`
    pub async fn wait_for_change(&self, last_seen: u64) -> Result<u64> {
        self.wait_until(|r| r.seqno() > last_seen).await?;
        Ok(self.change_seqno())
    }

    /// Suspend until the change-sequence number reaches `at_least`
    pub async fn wait_for_seqno(&self, at_least: u64) -> Result<u64> {
        self.wait_until(|r| r.seqno() >= at_least).await?;
        Ok(self.change_seqno())
    }

    /// Suspend until the replica satisfies `predicate`
    pub async fn wait_until(&self, mut predicate: impl FnMut(&Replica) -> bool) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| !s.connected || predicate(&s.replica))
            .await
            .map_err(|_| IdlError::Disconnected)?;
        if predicate(&state.replica) {
            Ok(())
        } else {
            Err(IdlError::Disconnected)
        }
    }

    /// Start a transaction against the current replica
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction::new(self, self.snapshot())
    }

    /// Run a raw `transact` with the given operations
    pub async fn transact(&self, operations: Vec<Value>) -> Result<Value> {
        let mut params = vec![json!(self.schema.name)];
        params.extend(operations);
        self.rpc.call("transact", Value::Array(params)).await
    }

    /// List the databases served by the remote
    pub async fn list_dbs(&self) -> Result<Vec<String>> {
        let result = self.rpc.call("list_dbs", json!([])).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Round-trip an `echo` request
    pub async fn echo(&self, payload: Value) -> Result<Value> {
        self.rpc.call("echo", payload).await
    }
}

impl Drop for Idl {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl fmt::Debug for Idl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Idl")
            .field("remote", &self.remote)
            .field("database", &self.schema.name)
            .field("seqno", &self.change_seqno())
            .finish()
    }
}

async fn write_loop(mut writer: BoxedWriter, mut outgoing: mpsc::UnboundedReceiver<Value>) {
    while let Some(message) = outgoing.recv().await {
        let bytes = match serde_json::to_vec(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Dropping unserializable OVSDB message: {}", e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(&bytes).await {
            warn!("OVSDB write failed: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            warn!("OVSDB flush failed: {}", e);
            break;
        }
    }
}

async fn read_loop(
    mut reader: BoxedReader,
    rpc: Arc<RpcChannel>,
    state: Arc<watch::Sender<SessionState>>,
    lock_name: Option<String>,
) {
    let mut framer = JsonFramer::new();
    let mut buf = vec![0u8; 16 * 1024];

    'read: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("OVSDB connection closed by server");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("OVSDB read failed: {}", e);
                break;
            }
        };
        framer.push(&buf[..n]);

        loop {
            let value = match framer.next_value() {
                Ok(Some(value)) => value,
                Ok(None) => break,
                Err(e) => {
                    warn!("Malformed OVSDB message: {}", e);
                    break 'read;
                }
            };
            if let Err(e) = dispatch(value, &rpc, &state, lock_name.as_deref()).await {
                warn!("Failed to handle OVSDB message: {}", e);
                break 'read;
            }
        }
    }

    state.send_modify(|s| {
        s.connected = false;
        s.has_lock = false;
    });
    // Dropping the senders wakes every caller with Disconnected
    rpc.pending.lock().await.clear();
}

async fn dispatch(
    value: Value,
    rpc: &RpcChannel,
    state: &watch::Sender<SessionState>,
    lock_name: Option<&str>,
) -> Result<()> {
    match Message::classify(value)? {
        Message::Response(response) => {
            let Some(id) = response.id.as_u64() else {
                debug!("Ignoring reply with foreign id {}", response.id);
                return Ok(());
            };
            if id == rpc.monitor_request.load(Ordering::SeqCst) && !response.is_error() {
                install_snapshot(state, &response.result)?;
                rpc.monitor_request.store(NO_MONITOR, Ordering::SeqCst);
            }
            if let Some(waiter) = rpc.pending.lock().await.remove(&id) {
                let _ = waiter.send(response);
            }
        }
        Message::Request(request) => {
            let reply = match request.method.as_str() {
                "echo" => Response::success(request.id, request.params),
                other => Response::error(request.id, format!("unknown method {}", other)),
            };
            rpc.send(serde_json::to_value(reply)?)?;
        }
        Message::Notification { method, params } => match method.as_str() {
            "update" => {
                let updates = params
                    .get(1)
                    .ok_or_else(|| IdlError::protocol("update without table-updates"))?;
                apply_update(state, updates)?;
            }
            "locked" | "stolen" => {
                let name = params.get(0).and_then(Value::as_str);
                if name.is_some() && name == lock_name {
                    let held = method == "locked";
                    state.send_modify(|s| s.has_lock = held);
                    info!(lock = ?name, held, "Database lock ownership changed");
                }
            }
            other => debug!("Ignoring OVSDB notification {}", other),
        },
    }
    Ok(())
}

fn install_snapshot(state: &watch::Sender<SessionState>, result: &Value) -> Result<()> {
    let mut outcome = Ok(());
    state.send_modify(|s| {
        outcome = Arc::make_mut(&mut s.replica).install_snapshot(result);
    });
    outcome
}

fn apply_update(state: &watch::Sender<SessionState>, updates: &Value) -> Result<()> {
    let mut outcome = Ok(());
    state.send_if_modified(|s| {
        match Arc::make_mut(&mut s.replica).apply_update(updates) {
            Ok(changed) => changed,
            Err(e) => {
                outcome = Err(e);
                false
            }
        }
    });
    outcome
}
