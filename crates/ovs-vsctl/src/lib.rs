//! ovs-vsctl: manage Open vSwitch bridges, ports and interfaces
//!
//! This crate provides:
//! - A database handle over one OVSDB session (`Vsctl`)
//! - Scoped transactions that commit on success and abort on error
//! - A bounded commit-and-retry loop for write conflicts
//! - Bridge/port/interface edits with verify-before-mutate
//!
//! ```no_run
//! use ovs_vsctl::{Attrs, Vsctl};
//!
//! # async fn demo() -> ovs_vsctl::Result<()> {
//! let mut vsctl = Vsctl::open(
//!     "unix:/var/run/openvswitch/db.sock",
//!     "/usr/share/openvswitch/vswitch.ovsschema",
//! )
//! .await?;
//! vsctl
//!     .run(|txn| {
//!         txn.add_br("br0", &Attrs::new().with("fail_mode", "secure"))?;
//!         txn.add_port("br0", "eth0", &Attrs::new())?;
//!         Ok(())
//!     })
//!     .await?;
//! assert_eq!(vsctl.list_ports("br0")?, vec!["eth0"]);
//! # Ok(())
//! # }
//! ```

pub mod attrs;
pub mod config;
pub mod error;
pub mod handle;
pub mod retry;
pub mod txn;
pub mod view;

pub use attrs::Attrs;
pub use config::{load_environment, VsctlConfig};
pub use error::{Result, VsctlError};
pub use handle::Vsctl;
pub use ovs_idl::{Datum, TxnStatus};
pub use retry::RetryPolicy;
pub use txn::VsctlTxn;
pub use view::RowSource;

/// Prelude for convenient imports
pub mod prelude {
    pub use super::attrs::Attrs;
    pub use super::error::{Result, VsctlError};
    pub use super::handle::Vsctl;
    pub use super::retry::RetryPolicy;
    pub use super::txn::VsctlTxn;
    pub use ovs_idl::{Datum, TxnStatus};
}

#[cfg(test)]
pub(crate) mod test_support {
    use ovs_idl::DatabaseSchema;

    pub const SCHEMA_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/vswitch.ovsschema");

    pub fn schema() -> DatabaseSchema {
        DatabaseSchema::from_file(SCHEMA_PATH).unwrap()
    }
}
