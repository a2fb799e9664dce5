//! `iacloud` command-line client.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Parse arguments** with `clap`: state file, session key, credentials,
//!    and one operation per invocation.
//! 2. **Wire observability**: `tracing-subscriber` with text or JSON output,
//!    plus an OpenTelemetry OTLP exporter when `OTEL_EXPORTER_OTLP_ENDPOINT`
//!    is set.
//! 3. **Construct infrastructure**: a [`store::FileConnectionStore`] over the
//!    state file and the transport the session's protocol calls for
//!    ([`rest::RestTransport`] or [`websocket::DuplexSession`]), injected
//!    into a [`connection::ConnectionOrchestrator`].
//! 4. **Run the operation** and print the service's response as JSON on
//!    stdout. Logs go to stderr.

mod observability;
mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use connection::ConnectionOrchestrator;
use protocol::{ConnectionInfo, ConnectionStore, Credentials, FdsKey, Protocol, Transport};
use rest::{RestConfig, RestTransport};
use serde_json::Value;
use tracing::{info, warn};
use websocket::{DuplexConfig, DuplexSession};

use crate::store::FileConnectionStore;

/// ia-cloud connection client
#[derive(Parser, Debug)]
#[command(name = "iacloud", version, about, long_about = None)]
struct Cli {
    /// JSON file holding connection state for every session key
    #[arg(long, default_value = "iacloud-state.json")]
    state: PathBuf,

    /// Session key within the state file
    #[arg(long, default_value = "default")]
    key: String,

    /// ia-cloud user name
    #[arg(long)]
    username: Option<String>,

    /// ia-cloud password
    #[arg(long)]
    password: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a session and store the issued serviceID
    Connect(SeedArgs),

    /// Query the session status (rotates the serviceID)
    Status,

    /// Store one ia-cloud object
    Store {
        /// The object as JSON
        #[arg(value_parser = parse_json)]
        object: Value,
    },

    /// Retrieve one object
    Retrieve {
        /// The retrieve object as JSON
        #[arg(value_parser = parse_json)]
        object: Value,
    },

    /// Retrieve several objects in one request
    RetrieveArray {
        /// JSON array of retrieve objects
        #[arg(value_parser = parse_json)]
        objects: Value,
    },

    /// End the session
    Terminate,

    /// Print the stored connection state
    Show,
}

/// Connection settings used when the session key is not yet in the state file.
#[derive(Args, Debug, Default)]
struct SeedArgs {
    /// Service endpoint (https:// for REST, ws:// or wss:// for websocket)
    #[arg(long)]
    url: Option<String>,

    /// Facility data source key
    #[arg(long)]
    fds_key: Option<String>,

    /// REST1, REST2 or websocket
    #[arg(long)]
    protocol: Option<Protocol>,

    /// Per-request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// HTTPS proxy for REST transports
    #[arg(long)]
    proxy: Option<String>,

    /// Comment sent with connect and getStatus
    #[arg(long)]
    comment: Option<String>,
}

impl SeedArgs {
    fn is_empty(&self) -> bool {
        self.url.is_none()
            && self.fds_key.is_none()
            && self.protocol.is_none()
            && self.timeout_ms.is_none()
            && self.proxy.is_none()
            && self.comment.is_none()
    }

    fn to_connection_info(&self) -> Result<ConnectionInfo> {
        let (Some(url), Some(fds_key)) = (&self.url, &self.fds_key) else {
            bail!("no stored connection for this key; --url and --fds-key are required");
        };
        let fds_key = FdsKey::new(fds_key.as_str()).context("--fds-key must not be empty")?;
        let mut info = ConnectionInfo::new(self.protocol.unwrap_or(Protocol::Rest2), url, fds_key);
        if let Some(ms) = self.timeout_ms {
            info = info.with_request_timeout(Duration::from_millis(ms));
        }
        if let Some(proxy) = &self.proxy {
            info = info.with_proxy(proxy);
        }
        if let Some(comment) = &self.comment {
            info = info.with_comment(comment);
        }
        Ok(info)
    }
}

fn parse_json(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("not valid JSON: {e}"))
}

fn credentials(cli: &Cli) -> Result<Option<Credentials>> {
    match (&cli.username, &cli.password) {
        (Some(user), Some(pass)) => Ok(Some(Credentials::new(user, pass))),
        (None, None) => Ok(None),
        _ => bail!("--username and --password must be given together"),
    }
}

fn build_transport(info: &ConnectionInfo) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = if info.protocol().is_duplex() {
        let config = DuplexConfig::for_connection(info).context("invalid websocket endpoint")?;
        Arc::new(DuplexSession::new(config))
    } else {
        let config = RestConfig::from_connection_info(info);
        Arc::new(RestTransport::new(config).context("cannot build HTTP client")?)
    };
    Ok(transport)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _telemetry = observability::init(&cli.log_level, cli.log_json)?;

    let store = Arc::new(FileConnectionStore::new(&cli.state));
    let credentials = credentials(&cli)?;

    let info = match (store.get(&cli.key).await?, &cli.command) {
        (Some(info), Command::Connect(seed)) => {
            if !seed.is_empty() {
                warn!(key = %cli.key, "session already stored; connection arguments ignored");
            }
            info
        }
        (Some(info), _) => info,
        (None, Command::Connect(seed)) => {
            let info = seed.to_connection_info()?;
            store.set(&cli.key, &info).await?;
            info!(key = %cli.key, path = %store.path().display(), "session seeded");
            info
        }
        (None, _) => bail!(
            "no connection stored under '{}' in {}; run `connect` first",
            cli.key,
            cli.state.display()
        ),
    };

    if let Command::Show = cli.command {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let transport = build_transport(&info)?;
    let orchestrator =
        ConnectionOrchestrator::new(store, cli.key.as_str(), transport, credentials.clone())
            .await?;

    let outcome = match cli.command {
        Command::Connect(_) => {
            let credentials =
                credentials.context("connect requires --username and --password")?;
            orchestrator.connect(&credentials).await
        }
        Command::Status => orchestrator.get_status().await,
        Command::Store { object } => orchestrator.store(object).await,
        Command::Retrieve { object } => orchestrator.retrieve(object).await,
        Command::RetrieveArray { objects } => orchestrator.retrieve_array(objects).await,
        Command::Terminate => orchestrator.terminate().await,
        // Printed before the transport was built.
        Command::Show => return Ok(()),
    };

    if let Err(e) = orchestrator.close().await {
        warn!(error = %e, "transport did not close cleanly");
    }

    let response = outcome?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
