//! End-to-end tests against the in-memory OVSDB server

use ovs_idl::{DatabaseSchema, IdlError, MemoryServer, Row};
use ovs_vsctl::{Attrs, Datum, RetryPolicy, TxnStatus, Vsctl, VsctlConfig, VsctlError};
use serde_json::json;
use tempfile::TempDir;
use tokio::task::JoinHandle;

const SCHEMA: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/vswitch.ovsschema");

struct Harness {
    _dir: TempDir,
    server: MemoryServer,
    remote: String,
    task: JoinHandle<()>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Harness {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let server = MemoryServer::new(DatabaseSchema::from_file(SCHEMA).unwrap());
        let seeded = server
            .transact(vec![json!({
                "op": "insert",
                "table": "Open_vSwitch",
                "row": {"ovs_version": "3.3.0"}
            })])
            .await;
        assert!(seeded[0]["uuid"].is_array(), "{}", seeded);

        let socket = dir.path().join("db.sock");
        let task = server.spawn_unix(&socket).unwrap();
        Self {
            remote: format!("unix:{}", socket.display()),
            _dir: dir,
            server,
            task,
        }
    }

    async fn open(&self) -> Vsctl {
        Vsctl::open(&self.remote, SCHEMA).await.unwrap()
    }

    async fn open_with(&self, retry: RetryPolicy, lock: Option<&str>) -> Vsctl {
        let config = VsctlConfig {
            remote: self.remote.clone(),
            schema: SCHEMA.into(),
            retry,
            lock: lock.map(str::to_string),
            ..VsctlConfig::default()
        };
        Vsctl::with_config(&config).await.unwrap()
    }

    async fn names(&self, table: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .server
            .rows(table)
            .await
            .iter()
            .filter_map(|row| row.name().map(str::to_string))
            .collect();
        names.sort();
        names
    }

    async fn row(&self, table: &str, name: &str) -> Option<Row> {
        self.server
            .rows(table)
            .await
            .into_iter()
            .find(|row| row.name() == Some(name))
    }
}

async fn add_br(vsctl: &mut Vsctl, name: &str) -> ovs_vsctl::Result<TxnStatus> {
    vsctl
        .run(|txn| {
            txn.add_br(name, &Attrs::new())?;
            Ok(())
        })
        .await
}

async fn add_port(vsctl: &mut Vsctl, bridge: &str, port: &str) -> ovs_vsctl::Result<TxnStatus> {
    vsctl
        .run(|txn| {
            txn.add_port(bridge, port, &Attrs::new())?;
            Ok(())
        })
        .await
}

#[tokio::test]
async fn test_open_and_root() {
    let h = Harness::start().await;
    let vsctl = h.open().await;

    let root = vsctl.root().unwrap();
    assert_eq!(root.get("ovs_version"), Some(&Datum::from("3.3.0")));
    assert!(vsctl.list_br().unwrap().is_empty());
    assert_eq!(vsctl.last_status(), TxnStatus::Unchanged);
}

#[tokio::test]
async fn test_open_failures() {
    let dir = tempfile::tempdir().unwrap();
    let missing = format!("unix:{}", dir.path().join("missing.sock").display());
    let err = Vsctl::open(&missing, SCHEMA).await.unwrap_err();
    assert!(matches!(err, VsctlError::Connection { .. }), "{}", err);

    let h = Harness::start().await;
    let err = Vsctl::open(&h.remote, dir.path().join("nope.ovsschema"))
        .await
        .unwrap_err();
    assert!(matches!(err, VsctlError::Connection { .. }), "{}", err);
}

#[tokio::test]
async fn test_add_br_creates_local_port() {
    let h = Harness::start().await;
    let mut vsctl = h.open().await;

    assert_eq!(add_br(&mut vsctl, "br0").await.unwrap(), TxnStatus::Success);
    assert_eq!(vsctl.last_status(), TxnStatus::Success);
    assert!(vsctl.br_exists("br0").unwrap());
    assert_eq!(vsctl.list_br().unwrap(), vec!["br0"]);
    assert!(vsctl.list_ports("br0").unwrap().is_empty());

    let iface = h.row("Interface", "br0").await.unwrap();
    assert_eq!(iface.get("type"), Some(&Datum::from("internal")));
    let port = h.row("Port", "br0").await.unwrap();
    assert_eq!(port.uuids("interfaces"), vec![iface.uuid]);
    let bridge = h.row("Bridge", "br0").await.unwrap();
    assert_eq!(bridge.uuids("ports"), vec![port.uuid]);
    assert_eq!(vsctl.root().unwrap().uuids("bridges"), vec![bridge.uuid]);
}

#[tokio::test]
async fn test_duplicate_bridge_is_rejected() {
    let h = Harness::start().await;
    let mut vsctl = h.open().await;
    add_br(&mut vsctl, "br0").await.unwrap();
    let before = (h.names("Bridge").await, h.names("Port").await, h.names("Interface").await);

    let err = add_br(&mut vsctl, "br0").await.unwrap_err();
    assert!(matches!(err, VsctlError::AlreadyExists { kind: "bridge", .. }), "{}", err);
    assert_eq!(vsctl.last_status(), TxnStatus::Aborted);

    let after = (h.names("Bridge").await, h.names("Port").await, h.names("Interface").await);
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_del_br_leaves_nothing_behind() {
    let h = Harness::start().await;
    let mut vsctl = h.open().await;
    add_br(&mut vsctl, "br0").await.unwrap();
    add_port(&mut vsctl, "br0", "p1").await.unwrap();

    let status = vsctl
        .run(|txn| txn.del_br("br0"))
        .await
        .unwrap();
    assert_eq!(status, TxnStatus::Success);
    assert!(!vsctl.br_exists("br0").unwrap());
    assert!(vsctl.list_br().unwrap().is_empty());
    assert!(vsctl.root().unwrap().uuids("bridges").is_empty());
    assert!(h.names("Bridge").await.is_empty());
    assert!(h.names("Port").await.is_empty());
    assert!(h.names("Interface").await.is_empty());

    let err = vsctl.run(|txn| txn.del_br("br0")).await.unwrap_err();
    assert!(matches!(err, VsctlError::NotFound { kind: "bridge", .. }));
}

#[tokio::test]
async fn test_ports_exclude_local_port() {
    let h = Harness::start().await;
    let mut vsctl = h.open().await;
    add_br(&mut vsctl, "br0").await.unwrap();

    assert_eq!(add_port(&mut vsctl, "br0", "p1").await.unwrap(), TxnStatus::Success);
    assert_eq!(vsctl.list_ports("br0").unwrap(), vec!["p1"]);
    assert_eq!(vsctl.list_ifaces("br0").unwrap(), vec!["p1"]);

    let err = add_port(&mut vsctl, "br1", "p2").await.unwrap_err();
    assert!(matches!(err, VsctlError::NotFound { kind: "bridge", .. }));
    let err = add_port(&mut vsctl, "br0", "p1").await.unwrap_err();
    assert!(matches!(err, VsctlError::AlreadyExists { kind: "port", .. }));
    let err = vsctl.list_ports("br1").unwrap_err();
    assert!(matches!(err, VsctlError::NotFound { .. }));
}

#[tokio::test]
async fn test_del_port() {
    let h = Harness::start().await;
    let mut vsctl = h.open().await;
    add_br(&mut vsctl, "br0").await.unwrap();
    add_port(&mut vsctl, "br0", "p1").await.unwrap();
    let ports_before = h.row("Bridge", "br0").await.unwrap().uuids("ports");

    let err = vsctl.run(|txn| txn.del_port("br0", "nope")).await.unwrap_err();
    assert!(matches!(err, VsctlError::NotFound { kind: "port", .. }));
    let err = vsctl.run(|txn| txn.del_port("br9", "p1")).await.unwrap_err();
    assert!(matches!(err, VsctlError::NotFound { kind: "bridge", .. }));
    assert_eq!(h.row("Bridge", "br0").await.unwrap().uuids("ports"), ports_before);

    // The local port goes only with its bridge
    let err = vsctl.run(|txn| txn.del_port("br0", "br0")).await.unwrap_err();
    assert!(matches!(err, VsctlError::LocalPort { ref bridge } if bridge == "br0"), "{}", err);
    assert_eq!(vsctl.last_status(), TxnStatus::Aborted);
    assert_eq!(h.row("Bridge", "br0").await.unwrap().uuids("ports"), ports_before);
    assert_eq!(h.names("Port").await, vec!["br0", "p1"]);

    let status = vsctl.run(|txn| txn.del_port("br0", "p1")).await.unwrap();
    assert_eq!(status, TxnStatus::Success);
    assert!(vsctl.list_ports("br0").unwrap().is_empty());
    assert_eq!(h.names("Port").await, vec!["br0"]);
    assert_eq!(h.names("Interface").await, vec!["br0"]);
}

#[tokio::test]
async fn test_list_ifaces_across_ports() {
    let h = Harness::start().await;
    let mut vsctl = h.open().await;
    add_br(&mut vsctl, "br0").await.unwrap();

    vsctl
        .run(|txn| {
            txn.add_port_with_ifaces("br0", "p1", &["i1"], &Attrs::new())?;
            txn.add_port_with_ifaces("br0", "p2", &["i2"], &Attrs::new())?;
            Ok(())
        })
        .await
        .unwrap();

    let mut ifaces = vsctl.list_ifaces("br0").unwrap();
    ifaces.sort();
    assert_eq!(ifaces, vec!["i1", "i2"]);
    assert_eq!(vsctl.list_ports("br0").unwrap(), vec!["p1", "p2"]);
}

#[tokio::test]
async fn test_edits_chain_within_one_transaction() {
    let h = Harness::start().await;
    let mut vsctl = h.open().await;

    let status = vsctl
        .run(|txn| {
            txn.add_br("br0", &Attrs::new())?;
            txn.add_br("br1", &Attrs::new())?;
            txn.add_port("br1", "p1", &Attrs::new().with("tag", 10i64))?;
            assert_eq!(txn.list_ports("br1")?, vec!["p1"]);
            assert_eq!(txn.list_br()?, vec!["br0", "br1"]);
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(status, TxnStatus::Success);
    assert_eq!(vsctl.list_br().unwrap(), vec!["br0", "br1"]);
    assert_eq!(
        h.row("Port", "p1").await.unwrap().get("tag"),
        Some(&Datum::from(10i64))
    );
    assert_eq!(vsctl.root().unwrap().uuids("bridges").len(), 2);
}

#[tokio::test]
async fn test_attrs_are_applied_and_validated() {
    let h = Harness::start().await;
    let mut vsctl = h.open().await;

    let attrs = Attrs::new()
        .with("fail_mode", "secure")
        .with("external_ids", Datum::string_map([("owner", "ci")]));
    vsctl
        .run(|txn| txn.add_br("br0", &attrs).map(drop))
        .await
        .unwrap();
    let bridge = h.row("Bridge", "br0").await.unwrap();
    assert_eq!(bridge.get("fail_mode"), Some(&Datum::from("secure")));
    assert_eq!(
        bridge.get("external_ids"),
        Some(&Datum::string_map([("owner", "ci")]))
    );

    let err = vsctl
        .run(|txn| txn.add_br("br1", &Attrs::new().with("colour", "blue")).map(drop))
        .await
        .unwrap_err();
    assert!(matches!(err, VsctlError::UnknownColumn { .. }), "{}", err);

    let err = vsctl
        .run(|txn| txn.add_br("br1", &Attrs::new().with("fail_mode", "loud")).map(drop))
        .await
        .unwrap_err();
    assert!(matches!(err, VsctlError::InvalidAttribute { .. }), "{}", err);
    assert_eq!(vsctl.list_br().unwrap(), vec!["br0"]);

    // Link columns belong to the edit operations
    vsctl
        .run(|txn| txn.add_iface("stray", &Attrs::new()).map(drop))
        .await
        .unwrap();
    let stray = h.row("Interface", "stray").await.unwrap().uuid;
    let err = vsctl
        .run(|txn| {
            txn.add_port("br0", "p1", &Attrs::new().with("interfaces", Datum::uuid_set([stray])))
                .map(drop)
        })
        .await
        .unwrap_err();
    assert!(
        matches!(err, VsctlError::InvalidAttribute { ref column, .. } if column == "interfaces"),
        "{}",
        err
    );
    let err = vsctl
        .run(|txn| txn.add_br("br1", &Attrs::new().with("ports", Datum::empty_set())).map(drop))
        .await
        .unwrap_err();
    assert!(
        matches!(err, VsctlError::InvalidAttribute { ref column, .. } if column == "ports"),
        "{}",
        err
    );
    assert!(h.row("Port", "p1").await.is_none());
    assert_eq!(vsctl.list_br().unwrap(), vec!["br0"]);
}

#[tokio::test]
async fn test_add_iface_and_del_iface() {
    let h = Harness::start().await;
    let mut vsctl = h.open().await;
    add_br(&mut vsctl, "br0").await.unwrap();

    let status = vsctl
        .run(|txn| {
            txn.add_iface("vif0", &Attrs::new().with("type", "tap"))?;
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(status, TxnStatus::Success);
    let iface = h.row("Interface", "vif0").await.unwrap();
    assert_eq!(iface.get("type"), Some(&Datum::from("tap")));

    let err = vsctl
        .run(|txn| txn.add_iface("vif0", &Attrs::new()).map(drop))
        .await
        .unwrap_err();
    assert!(matches!(err, VsctlError::AlreadyExists { kind: "interface", .. }));

    let err = vsctl.run(|txn| txn.del_iface("vif0")).await.unwrap_err();
    assert!(matches!(err, VsctlError::NotFound { kind: "port", .. }));

    // A port may not lose its only interface
    let err = vsctl.run(|txn| txn.del_iface("br0")).await.unwrap_err();
    assert!(matches!(err, VsctlError::Idl(IdlError::InvalidDatum(_))), "{}", err);
    assert_eq!(vsctl.last_status(), TxnStatus::Aborted);
    assert!(h.row("Interface", "br0").await.is_some());

    vsctl
        .run(|txn| {
            txn.add_port_with_ifaces("br0", "bond0", &["bond0", "eth1"], &Attrs::new())
                .map(drop)
        })
        .await
        .unwrap();
    let status = vsctl.run(|txn| txn.del_iface("bond0")).await.unwrap();
    assert_eq!(status, TxnStatus::Success);
    assert_eq!(vsctl.list_ifaces("br0").unwrap(), vec!["eth1"]);
    assert!(h.row("Interface", "bond0").await.is_none());

    // An interface named like the port but not on it is left alone
    vsctl
        .run(|txn| {
            txn.add_port_with_ifaces("br0", "bond1", &["eth2", "eth3"], &Attrs::new())?;
            txn.add_iface("bond1", &Attrs::new())?;
            Ok(())
        })
        .await
        .unwrap();
    let err = vsctl.run(|txn| txn.del_iface("bond1")).await.unwrap_err();
    assert!(matches!(err, VsctlError::NotFound { kind: "interface", .. }), "{}", err);
    assert!(h.row("Interface", "bond1").await.is_some());
    assert_eq!(
        h.row("Port", "bond1").await.unwrap().uuids("interfaces").len(),
        2
    );
}

#[tokio::test]
async fn test_unchanged_and_aborted() {
    let h = Harness::start().await;
    let mut vsctl = h.open().await;

    let status = vsctl.run(|txn| txn.br_exists("br0").map(drop)).await.unwrap();
    assert_eq!(status, TxnStatus::Unchanged);

    let err = vsctl
        .transaction(|txn| {
            txn.add_br("br0", &Attrs::new())?;
            Err(VsctlError::InvariantViolation("changed my mind".into()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, VsctlError::InvariantViolation(_)));
    assert_eq!(vsctl.last_status(), TxnStatus::Aborted);
    assert!(h.names("Bridge").await.is_empty());
}

#[tokio::test]
async fn test_concurrent_writers_both_land() {
    let h = Harness::start().await;
    let mut setup = h.open().await;
    add_br(&mut setup, "br0").await.unwrap();

    let mut a = h.open().await;
    let mut b = h.open().await;
    let (ra, rb) = tokio::join!(add_port(&mut a, "br0", "pa"), add_port(&mut b, "br0", "pb"));
    assert_eq!(ra.unwrap(), TxnStatus::Success);
    assert_eq!(rb.unwrap(), TxnStatus::Success);
    // Both composed against the same replica, so one of them conflicted
    assert_eq!(a.last_attempts() + b.last_attempts(), 3);

    let fresh = h.open().await;
    assert_eq!(fresh.list_ports("br0").unwrap(), vec!["pa", "pb"]);
}

#[tokio::test]
async fn test_concurrent_creators_of_one_name() {
    let h = Harness::start().await;
    let mut a = h.open().await;
    let mut b = h.open().await;

    let (ra, rb) = tokio::join!(add_br(&mut a, "br0"), add_br(&mut b, "br0"));
    let (won, lost) = match (ra, rb) {
        (Ok(status), Err(e)) | (Err(e), Ok(status)) => (status, e),
        other => panic!("expected one winner, got {:?}", other),
    };
    assert_eq!(won, TxnStatus::Success);
    assert!(matches!(lost, VsctlError::AlreadyExists { kind: "bridge", .. }), "{}", lost);
    assert_eq!(h.names("Bridge").await, vec!["br0"]);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let h = Harness::start().await;
    let mut setup = h.open().await;
    add_br(&mut setup, "br0").await.unwrap();

    let mut a = h.open_with(RetryPolicy::attempts(1), None).await;
    let mut b = h.open_with(RetryPolicy::attempts(1), None).await;
    let (ra, rb) = tokio::join!(add_port(&mut a, "br0", "pa"), add_port(&mut b, "br0", "pb"));

    let (won, lost) = match (ra, rb) {
        (Ok(status), Err(e)) | (Err(e), Ok(status)) => (status, e),
        other => panic!("expected one conflict, got {:?}", other),
    };
    assert_eq!(won, TxnStatus::Success);
    assert!(matches!(lost, VsctlError::RetriesExhausted { attempts: 1 }), "{}", lost);
    assert_eq!(h.names("Port").await.len(), 2);
}

#[tokio::test]
async fn test_wait_for_sequence_change() {
    let h = Harness::start().await;
    let watcher = h.open().await;
    let mut writer = h.open().await;
    let seen = watcher.change_seqno();

    let (changed, written) = tokio::join!(
        watcher.wait_for_sequence_change(seen),
        add_br(&mut writer, "br0")
    );
    assert_eq!(written.unwrap(), TxnStatus::Success);
    assert!(changed.unwrap() > seen);
}

#[tokio::test]
async fn test_lock_held_elsewhere() {
    let h = Harness::start().await;
    let mut owner = h.open_with(RetryPolicy::default(), Some("vsctl")).await;
    let mut other = h.open_with(RetryPolicy::default(), Some("vsctl")).await;
    assert!(owner.idl().has_lock());
    assert!(!other.idl().has_lock());

    assert_eq!(add_br(&mut other, "br0").await.unwrap(), TxnStatus::NotLocked);
    assert_eq!(add_br(&mut owner, "br0").await.unwrap(), TxnStatus::Success);
}
