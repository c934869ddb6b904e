//! ovs-cli
//!
//! Bridge, port and interface management for Open vSwitch:
//! - add-br / del-br / br-exists / list-br
//! - add-port / del-port / list-ports / list-ifaces

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, info};

use ovs_vsctl::{Attrs, TxnStatus, Vsctl, VsctlConfig, VsctlError, VsctlTxn};

#[derive(Parser, Debug)]
#[command(name = "ovs-cli")]
#[command(about = "Manage Open vSwitch bridges, ports and interfaces over OVSDB")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// OVSDB remote (unix:PATH or tcp:HOST:PORT)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Path to vswitch.ovsschema
    #[arg(long, global = true)]
    schema: Option<PathBuf>,

    /// Commit attempts before giving up on conflicts
    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    /// Print lists as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a bridge with its local port
    AddBr {
        name: String,
        /// Bridge column to set, as COLUMN=VALUE
        #[arg(long = "set", value_name = "COLUMN=VALUE")]
        set: Vec<String>,
    },
    /// Delete a bridge and all of its ports
    DelBr { name: String },
    /// Add a port to a bridge
    AddPort {
        bridge: String,
        port: String,
        /// Interfaces backing the port (defaults to one named after the port)
        #[arg(long = "iface", value_name = "NAME")]
        ifaces: Vec<String>,
        /// Port column to set, as COLUMN=VALUE
        #[arg(long = "set", value_name = "COLUMN=VALUE")]
        set: Vec<String>,
    },
    /// Remove a port from a bridge
    DelPort { bridge: String, port: String },
    /// Remove the interface named after a port from that port
    DelIface { port: String },
    /// List bridges
    ListBr,
    /// List the ports of a bridge
    ListPorts { bridge: String },
    /// List the interfaces of a bridge's ports
    ListIfaces { bridge: String },
    /// Exit with status 2 if the bridge does not exist
    BrExists { name: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let env_file = ovs_vsctl::load_environment();
    let args = Args::parse();

    if let Err(e) = init_tracing(args.log_json) {
        eprintln!("ovs-cli: cannot initialize logging: {}", e);
    }
    if let Some(path) = env_file {
        debug!(%path, "Loaded environment file");
    }

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ovs-cli: {:#}", e);
            if let Some(hint) = e.downcast_ref::<VsctlError>().and_then(VsctlError::suggestion) {
                eprintln!("hint: {}", hint);
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("ovs_cli=warn".parse()?)
        .add_directive("ovs_vsctl=warn".parse()?)
        .add_directive("ovs_idl=warn".parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn run(args: Args) -> Result<ExitCode> {
    let mut config = VsctlConfig::from_env().context("invalid OVSDB configuration")?;
    if let Some(db) = args.db {
        config.remote = db;
    }
    if let Some(schema) = args.schema {
        config.schema = schema;
    }
    if let Some(attempts) = args.max_attempts {
        if attempts == 0 {
            bail!("--max-attempts must be at least 1");
        }
        config.retry.max_attempts = attempts;
    }
    debug!(?config, "Resolved configuration");

    let mut vsctl = Vsctl::with_config(&config).await?;

    match args.command {
        Commands::AddBr { name, set } => {
            let attrs = parse_attrs(&set)?;
            edit(&mut vsctl, |txn| txn.add_br(&name, &attrs).map(drop)).await?;
            info!(bridge = %name, "Bridge created");
        }
        Commands::DelBr { name } => {
            edit(&mut vsctl, |txn| txn.del_br(&name)).await?;
            info!(bridge = %name, "Bridge deleted");
        }
        Commands::AddPort {
            bridge,
            port,
            ifaces,
            set,
        } => {
            let attrs = parse_attrs(&set)?;
            let ifaces: Vec<&str> = if ifaces.is_empty() {
                vec![port.as_str()]
            } else {
                ifaces.iter().map(String::as_str).collect()
            };
            edit(&mut vsctl, |txn| {
                txn.add_port_with_ifaces(&bridge, &port, &ifaces, &attrs)
                    .map(drop)
            })
            .await?;
            info!(%bridge, %port, "Port created");
        }
        Commands::DelPort { bridge, port } => {
            edit(&mut vsctl, |txn| txn.del_port(&bridge, &port)).await?;
            info!(%bridge, %port, "Port deleted");
        }
        Commands::DelIface { port } => {
            edit(&mut vsctl, |txn| txn.del_iface(&port)).await?;
            info!(%port, "Interface deleted");
        }
        Commands::ListBr => print_list(&vsctl.list_br()?, args.json)?,
        Commands::ListPorts { bridge } => print_list(&vsctl.list_ports(&bridge)?, args.json)?,
        Commands::ListIfaces { bridge } => print_list(&vsctl.list_ifaces(&bridge)?, args.json)?,
        Commands::BrExists { name } => {
            if !vsctl.br_exists(&name)? {
                return Ok(ExitCode::from(2));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn parse_attrs(assignments: &[String]) -> Result<Attrs> {
    let mut attrs = Attrs::new();
    for assignment in assignments {
        let (column, value) = Attrs::parse_assignment(assignment)
            .with_context(|| format!("bad --set argument {:?}", assignment))?;
        attrs.set(column, value);
    }
    Ok(attrs)
}

/// Run one edit through the retry loop and insist on a committed outcome
async fn edit<F>(vsctl: &mut Vsctl, edit: F) -> Result<()>
where
    F: FnMut(&mut VsctlTxn<'_>) -> ovs_vsctl::Result<()>,
{
    let status = vsctl.run(edit).await?;
    match status {
        TxnStatus::Success | TxnStatus::Unchanged => Ok(()),
        other => match vsctl.last_error() {
            Some(reason) => bail!("transaction failed ({}): {}", other, reason),
            None => bail!("transaction failed ({})", other),
        },
    }
}

fn print_list(names: &[String], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(names)?);
    } else {
        for name in names {
            println!("{}", name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let args = Args::try_parse_from([
            "ovs-cli",
            "--db",
            "unix:/tmp/db.sock",
            "add-br",
            "br0",
            "--set",
            "fail_mode=secure",
            "--set",
            "stp_enable=true",
        ])
        .unwrap();
        assert_eq!(args.db.as_deref(), Some("unix:/tmp/db.sock"));
        match args.command {
            Commands::AddBr { name, set } => {
                assert_eq!(name, "br0");
                let attrs = parse_attrs(&set).unwrap();
                assert_eq!(attrs.len(), 2);
            }
            other => panic!("unexpected command {:?}", other),
        }

        let args = Args::try_parse_from(["ovs-cli", "add-port", "br0", "bond0", "--iface", "eth0", "--iface", "eth1"])
            .unwrap();
        assert!(matches!(args.command, Commands::AddPort { ref ifaces, .. } if ifaces.len() == 2));

        assert!(Args::try_parse_from(["ovs-cli", "list-ports"]).is_err());
    }

    #[test]
    fn test_bad_assignment() {
        assert!(parse_attrs(&["fail_mode".to_string()]).is_err());
    }
}
