//! Database handle: one IDL session over the whole vswitch schema

use std::path::Path;

use ovs_idl::{Idl, IdlOptions, Row, SchemaHelper, TxnStatus};
use tracing::{debug, info, warn};

use crate::config::VsctlConfig;
use crate::error::{Result, VsctlError};
use crate::retry::RetryPolicy;
use crate::txn::VsctlTxn;
use crate::view::{self, RowSource};

/// Handle on an Open vSwitch database
pub struct Vsctl {
    pub(crate) idl: Idl,
    /// Change-sequence number the retry loop last composed against
    pub(crate) seqno: u64,
    pub(crate) policy: RetryPolicy,
    pub(crate) last_status: TxnStatus,
    pub(crate) last_error: Option<String>,
    pub(crate) last_attempts: u32,
}

impl Vsctl {
    /// Connect to `remote` using the schema at `schema_location`, and
    /// wait for the initial replica
    pub async fn open(remote: &str, schema_location: impl AsRef<Path>) -> Result<Self> {
        Self::connect(
            remote,
            schema_location.as_ref(),
            IdlOptions::default(),
            RetryPolicy::default(),
        )
        .await
    }

    pub async fn with_config(config: &VsctlConfig) -> Result<Self> {
        Self::connect(
            &config.remote,
            &config.schema,
            config.idl_options(),
            config.retry.clone(),
        )
        .await
    }

    async fn connect(
        remote: &str,
        schema_location: &Path,
        options: IdlOptions,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let mut helper = SchemaHelper::from_file(schema_location)
            .map_err(|e| VsctlError::connection(remote, e))?;
        helper.register_all();

        let idl = Idl::connect(remote, &helper, options)
            .await
            .map_err(|e| VsctlError::connection(remote, e))?;
        let seqno = idl.change_seqno();
        info!(remote, seqno, "Opened Open vSwitch database");

        Ok(Self {
            idl,
            seqno,
            policy,
            last_status: TxnStatus::Unchanged,
            last_error: None,
            last_attempts: 0,
        })
    }

    pub fn idl(&self) -> &Idl {
        &self.idl
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: RetryPolicy) {
        self.policy = policy;
    }

    pub fn change_seqno(&self) -> u64 {
        self.idl.change_seqno()
    }

    /// Status recorded by the most recent transaction
    pub fn last_status(&self) -> TxnStatus {
        self.last_status
    }

    /// Server-side reason of the most recent `Error` status
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Commit attempts made by the most recent [`Vsctl::run`]
    pub fn last_attempts(&self) -> u32 {
        self.last_attempts
    }

    /// Suspend until the replica changes past `last_seen`; returns the new
    /// change-sequence number
    pub async fn wait_for_sequence_change(&self, last_seen: u64) -> Result<u64> {
        Ok(self.idl.wait_for_change(last_seen).await?)
    }

    pub fn find_row(&self, table: &str, predicate: impl Fn(&Row) -> bool) -> Result<Option<Row>> {
        self.idl.snapshot().find_row(table, predicate)
    }

    pub fn find_by_name(&self, table: &str, name: &str) -> Result<Option<Row>> {
        self.idl.snapshot().find_by_name(table, name)
    }

    /// The single `Open_vSwitch` row, read fresh from the replica
    pub fn root(&self) -> Result<Row> {
        view::root(&*self.idl.snapshot())
    }

    pub fn br_exists(&self, name: &str) -> Result<bool> {
        view::br_exists(&*self.idl.snapshot(), name)
    }

    pub fn list_br(&self) -> Result<Vec<String>> {
        view::list_br(&*self.idl.snapshot())
    }

    pub fn list_ports(&self, bridge: &str) -> Result<Vec<String>> {
        view::list_ports(&*self.idl.snapshot(), bridge)
    }

    pub fn list_ifaces(&self, bridge: &str) -> Result<Vec<String>> {
        view::list_ifaces(&*self.idl.snapshot(), bridge)
    }

    /// Run `edit` in a fresh transaction. On `Ok` the transaction is
    /// committed; on `Err` it is aborted and the error returned. Either
    /// way the outcome is recorded in [`Vsctl::last_status`].
    pub async fn transaction<F>(&mut self, edit: F) -> Result<TxnStatus>
    where
        F: FnOnce(&mut VsctlTxn<'_>) -> Result<()>,
    {
        self.last_status = TxnStatus::Unchanged;
        self.last_error = None;

        let mut txn = VsctlTxn::new(self.idl.transaction());
        self.seqno = txn.seqno();
        if let Err(e) = edit(&mut txn) {
            txn.transaction().abort();
            self.last_status = TxnStatus::Aborted;
            debug!("Transaction aborted: {}", e);
            return Err(e);
        }

        let mut txn = txn.into_inner();
        let outcome = txn.commit().await;
        self.last_status = txn.status();
        self.last_error = txn.error().map(str::to_string);
        let status = outcome?;

        if status == TxnStatus::Error {
            warn!(
                error = self.last_error.as_deref().unwrap_or_default(),
                "Transaction rejected by ovsdb-server"
            );
        }
        Ok(status)
    }
}

impl std::fmt::Debug for Vsctl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vsctl")
            .field("remote", &self.idl.remote().to_string())
            .field("seqno", &self.seqno)
            .field("last_status", &self.last_status)
            .finish()
    }
}
