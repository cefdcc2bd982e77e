//! kerneld CLI entry point.
//!
//! `kerneld run` hosts the kernel process manager behind a localhost
//! control socket; the other subcommands talk to a running daemon or, for
//! `exec`, drive a session in-process.

use std::io::{self, BufRead, Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use kernel_launch::{find_kernelspec, kernelspec_dirs, KernelInfo, KernelProcessManager, PortAllocator};
use kernel_wire::{KernelFamily, StreamName};
use kerneld::config::default_endpoint_file;
use kerneld::endpoint::read_daemon_info;
use kerneld::{
    Daemon, DaemonConfig, ExecuteOptions, KernelClient, KernelSession, RuntimeMetadata,
    RuntimePayload, SessionConfig, SessionEvent, SessionRegistry,
};
use log::info;
use tabled::{settings::Style, Table, Tabled};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "kerneld")]
#[command(about = "Launch language kernels and bridge their sessions")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Daemon endpoint file (default: ~/.cache/kerneld/kerneld.json)
    #[arg(long, global = true)]
    endpoint_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon (default if no command specified)
    Run {
        /// JSON config file; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Control socket address
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// First port kernels may use
        #[arg(long)]
        port_range_start: Option<u16>,

        /// Last port kernels may use
        #[arg(long)]
        port_range_end: Option<u16>,
    },

    /// Check daemon status
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List kernels managed by the daemon
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Start a kernel in the daemon from an installed kernelspec
    Start {
        /// Kernelspec language or name
        language: String,

        /// Session id (default: random)
        #[arg(long)]
        session: Option<String>,
    },

    /// Stop the kernel for a session
    Stop { session: String },

    /// Run code and print its output
    Exec {
        /// Kernelspec language for an in-process kernel
        #[arg(long, conflicts_with = "attach")]
        language: Option<String>,

        /// Attach to the daemon's kernel for this session instead
        #[arg(long)]
        attach: Option<String>,

        /// Kernel family of the attached kernel
        #[arg(long, default_value = "python")]
        family: String,

        /// Code to run (default: read from stdin)
        code: Option<String>,
    },

    /// Stop every kernel and the daemon
    Shutdown,
}

#[derive(Tabled)]
struct KernelTableRow {
    #[tabled(rename = "SESSION")]
    session: String,
    #[tabled(rename = "KERNEL")]
    kernel: String,
    #[tabled(rename = "LANGUAGE")]
    language: String,
    #[tabled(rename = "PID")]
    pid: String,
    #[tabled(rename = "SHELL")]
    shell: u16,
    #[tabled(rename = "CTRL")]
    control: String,
    #[tabled(rename = "STATUS")]
    status: String,
}

impl From<&KernelInfo> for KernelTableRow {
    fn from(info: &KernelInfo) -> Self {
        KernelTableRow {
            session: info.session_id.clone(),
            kernel: info.kernel_id.clone(),
            language: info.language.clone(),
            pid: info.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
            shell: info.shell_port,
            control: info
                .control_port
                .map_or_else(|| "-".to_string(), |p| p.to_string()),
            status: if info.alive { "running" } else { "exited" }.to_string(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let endpoint_file = cli.endpoint_file.unwrap_or_else(default_endpoint_file);

    match cli.command {
        None => run_daemon(None, None, None, None, endpoint_file).await,
        Some(Commands::Run {
            config,
            bind,
            port_range_start,
            port_range_end,
        }) => run_daemon(config, bind, port_range_start, port_range_end, endpoint_file).await,
        Some(Commands::Status { json }) => status(&endpoint_file, json).await,
        Some(Commands::List { json }) => list(&endpoint_file, json).await,
        Some(Commands::Start { language, session }) => {
            start(&endpoint_file, &language, session).await
        }
        Some(Commands::Stop { session }) => {
            let client = KernelClient::from_endpoint_file(&endpoint_file)?;
            if client.stop_kernel(&session).await? {
                println!("Stopped kernel for {}", session);
            } else {
                println!("No kernel for {}", session);
            }
            Ok(())
        }
        Some(Commands::Exec {
            language,
            attach,
            family,
            code,
        }) => exec(&endpoint_file, language, attach, &family, code).await,
        Some(Commands::Shutdown) => {
            let client = KernelClient::from_endpoint_file(&endpoint_file)?;
            client.shutdown().await?;
            println!("Daemon shutting down");
            Ok(())
        }
    }
}

async fn run_daemon(
    config_path: Option<PathBuf>,
    bind: Option<SocketAddr>,
    port_range_start: Option<u16>,
    port_range_end: Option<u16>,
    endpoint_file: PathBuf,
) -> Result<()> {
    info!("kerneld starting...");

    let mut config = match config_path {
        Some(path) => DaemonConfig::load(&path)?,
        None => DaemonConfig::default(),
    };
    config.endpoint_file = endpoint_file;
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    if let Some(start) = port_range_start {
        config.port_range_start = start;
    }
    if let Some(end) = port_range_end {
        config.port_range_end = end;
    }
    config.validate()?;

    info!("Configuration:");
    info!("  Bind: {}", config.bind_addr);
    info!(
        "  Ports: {}-{}",
        config.port_range_start, config.port_range_end
    );
    info!("  Scratch: {:?}", config.scratch_root);
    info!("  Endpoint file: {:?}", config.endpoint_file);

    if let Some(existing) = read_daemon_info(&config.endpoint_file) {
        if let Ok(addr) = existing.endpoint.parse() {
            if KernelClient::new(addr).is_daemon_running().await {
                anyhow::bail!(
                    "Another daemon is already running: pid={}, endpoint={}",
                    existing.pid,
                    existing.endpoint
                );
            }
        }
    }

    let daemon = Daemon::new(config);
    let signal_daemon = daemon.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("[kerneld] Interrupted");
            signal_daemon.shutdown();
        }
    });
    daemon.run().await
}

async fn status(endpoint_file: &std::path::Path, json: bool) -> Result<()> {
    let daemon_info = read_daemon_info(endpoint_file);
    let client = daemon_info
        .as_ref()
        .and_then(|info| info.endpoint.parse().ok())
        .map(KernelClient::new);

    let running = match &client {
        Some(client) => client.is_daemon_running().await,
        None => false,
    };
    let kernels = match (&client, running) {
        (Some(client), true) => client.list_kernels().await.ok(),
        _ => None,
    };

    if json {
        let output = serde_json::json!({
            "running": running,
            "daemon_info": daemon_info,
            "kernels": kernels.as_ref().map(Vec::len),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("kerneld Status");
    println!("==============");
    println!("Daemon running: {}", if running { "yes" } else { "no" });
    if let Some(info) = daemon_info {
        println!();
        println!("Daemon Info:");
        println!("  PID:      {}", info.pid);
        println!("  Endpoint: {}", info.endpoint);
        println!("  Version:  {}", info.version);
        println!("  Started:  {}", info.started_at);
    }
    if let Some(kernels) = kernels {
        println!();
        println!("Kernels: {}", kernels.len());
    }
    Ok(())
}

async fn list(endpoint_file: &std::path::Path, json: bool) -> Result<()> {
    let client = KernelClient::from_endpoint_file(endpoint_file)?;
    let kernels = client.list_kernels().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&kernels)?);
    } else if kernels.is_empty() {
        println!("No running kernels found.");
    } else {
        let rows: Vec<KernelTableRow> = kernels.iter().map(KernelTableRow::from).collect();
        let table = Table::new(rows).with(Style::rounded()).to_string();
        println!("{}", table);
    }
    Ok(())
}

async fn start(
    endpoint_file: &std::path::Path,
    language: &str,
    session: Option<String>,
) -> Result<()> {
    let spec = find_kernelspec(language, &kernelspec_dirs())
        .await
        .ok_or_else(|| anyhow!("No kernelspec found for {}", language))?;
    let session = session.unwrap_or_else(|| Uuid::new_v4().to_string());

    let client = KernelClient::from_endpoint_file(endpoint_file)?;
    let kernel = client.start_kernel(&session, spec).await?;
    println!(
        "Started {} ({}) for session {} on port {}",
        kernel.kernel_id, kernel.display_name, kernel.session_id, kernel.shell_port
    );
    Ok(())
}

async fn exec(
    endpoint_file: &std::path::Path,
    language: Option<String>,
    attach: Option<String>,
    family: &str,
    code: Option<String>,
) -> Result<()> {
    let code = match code {
        Some(c) => c,
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };

    if let Some(session_id) = attach {
        let client = KernelClient::from_endpoint_file(endpoint_file)?;
        let endpoint = client.get_endpoint(&session_id).await?;
        let family: KernelFamily = serde_json::from_value(serde_json::Value::String(family.to_string()))
            .with_context(|| format!("unknown kernel family {}", family))?;
        let session = KernelSession::new(
            RuntimeMetadata {
                session_id: session_id.clone(),
                language: family.to_string(),
                ..Default::default()
            },
            family,
            SessionConfig::default(),
        );
        session.connect(endpoint).await?;
        let ok = run_code(&session, &code).await;
        session.detach().await;
        return finish(ok);
    }

    let language = language.ok_or_else(|| anyhow!("pass --language or --attach"))?;
    let spec = find_kernelspec(&language, &kernelspec_dirs())
        .await
        .ok_or_else(|| anyhow!("No kernelspec found for {}", language))?;

    let config = DaemonConfig::default();
    let ports = Arc::new(PortAllocator::new(config.port_range()));
    let manager = Arc::new(KernelProcessManager::new(config.process_config(), ports));
    let registry = SessionRegistry::new(manager, SessionConfig::default());

    let session = registry
        .start_session(&Uuid::new_v4().to_string(), &spec)
        .await?;
    let ok = run_code(&session, &code).await;
    registry.shutdown_all().await;
    finish(ok)
}

fn finish(ok: Result<bool>) -> Result<()> {
    if !ok? {
        std::process::exit(1);
    }
    Ok(())
}

/// Execute `code` and print its output until the kernel goes idle. Returns
/// whether the code ran without error.
async fn run_code(session: &KernelSession, code: &str) -> Result<bool> {
    let mut events = session.subscribe();
    let execution_id = Uuid::new_v4().to_string();
    session.execute(code, &execution_id, &ExecuteOptions::default())?;

    let mut ok = true;
    loop {
        let message = match events.recv().await {
            Ok(SessionEvent::Message(message)) => message,
            Ok(SessionEvent::Ended(reason)) => {
                anyhow::bail!("kernel session ended: {:?}", reason)
            }
            Ok(SessionEvent::State(_)) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => anyhow::bail!("kernel session closed"),
        };
        if message.parent_id != execution_id {
            continue;
        }

        match message.payload {
            RuntimePayload::Stream { name, text } => match name {
                StreamName::Stdout => {
                    print!("{}", text);
                    let _ = io::stdout().flush();
                }
                StreamName::Stderr => {
                    eprint!("{}", text);
                    let _ = io::stderr().flush();
                }
            },
            RuntimePayload::Result { data, .. } | RuntimePayload::Output { data, .. } => {
                if let Some(text) = data.get("text/plain").and_then(|v| v.as_str()) {
                    println!("{}", text);
                }
            }
            RuntimePayload::Error {
                name,
                message,
                traceback,
            } => {
                ok = false;
                eprintln!("{}: {}", name, message);
                for line in &traceback {
                    eprintln!("{}", line);
                }
            }
            RuntimePayload::Input { prompt, .. } => {
                print!("{}", prompt);
                let _ = io::stdout().flush();
                let mut line = String::new();
                io::stdin().lock().read_line(&mut line)?;
                session.reply_to_input(&message.id, line.trim_end_matches('\n'))?;
            }
            RuntimePayload::State {
                state: kernel_wire::ExecutionState::Idle,
            } => break,
            _ => {}
        }
    }
    Ok(ok)
}
