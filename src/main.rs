//! hyperhost CLI: create, start, stop and attach to lightweight VMs.
//!
//! This binary is the thin front end over the library — the `HostContext`
//! holds everything. `setup` walks privilege escalation through the broker,
//! `probe` reports host capability, and `attach` bridges the terminal to a
//! running guest.

use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;

use hyperhost::capability::SetupStage;
use hyperhost::context::HostContext;
use hyperhost::model::{OsType, VmRecord};
use hyperhost::session::{self, SessionBridge};
use hyperhost::vm::sanitize_vm_name;

/// Lightweight VM manager
#[derive(Parser, Debug)]
#[command(name = "hyperhost", version, about = "Lightweight VM manager")]
struct Args {
    /// Root all application data under this directory instead of the
    /// standard locations.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: CommandKind,
}

#[derive(Subcommand, Debug)]
enum CommandKind {
    /// Report host virtualization capability and native guest support.
    Probe,
    /// Connect to the privileged broker and grant the required permissions.
    Setup,
    /// List VM records.
    List,
    /// Create a VM record.
    Create {
        name: String,
        #[arg(long, default_value = "debian", value_parser = parse_os_type)]
        os: OsType,
        #[arg(long, default_value_t = 2)]
        cpus: u32,
        #[arg(long, default_value_t = 2048)]
        memory_mb: u64,
        #[arg(long, default_value_t = 16)]
        disk_gb: u64,
        /// Bootable disk image for custom guests.
        #[arg(long)]
        image: Option<PathBuf>,
        /// Explicit kernel; the host bootloader is used when omitted.
        #[arg(long)]
        kernel: Option<PathBuf>,
        #[arg(long)]
        no_network: bool,
    },
    /// Start a VM by id or name.
    Start {
        vm: String,
        /// Attach an interactive session once the VM is running.
        #[arg(long)]
        attach: bool,
    },
    /// Stop a running VM.
    Stop { vm: String },
    /// Stop and delete a VM and its record.
    Delete { vm: String },
    /// Attach an interactive session to a running VM.
    Attach { vm: String },
}

fn parse_os_type(s: &str) -> Result<OsType, String> {
    s.parse()
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = hyperhost::logging::init();
    let args = Args::parse();
    let ctx = HostContext::init(args.data_dir.as_deref()).await?;

    match args.command {
        CommandKind::Probe => probe(&ctx).await,
        CommandKind::Setup => setup(&ctx).await,
        CommandKind::List => list(&ctx).await,
        CommandKind::Create {
            name,
            os,
            cpus,
            memory_mb,
            disk_gb,
            image,
            kernel,
            no_network,
        } => {
            let mut record = VmRecord::new(name, os);
            record.cpu_cores = cpus;
            record.memory_mb = memory_mb;
            record.disk_size_gb = disk_gb;
            record.image_path = image;
            record.kernel_path = kernel;
            record.networking_enabled = !no_network;
            println!("created VM {} ({})", record.name, record.id);
            ctx.store.insert(record).await
        }
        CommandKind::Start { vm, attach } => start(&ctx, &vm, attach).await,
        CommandKind::Stop { vm } => {
            let record = resolve_record(&ctx, &vm).await?;
            ctx.engine.stop(&record.id).await?;
            println!("stopped {}", record.name);
            Ok(())
        }
        CommandKind::Delete { vm } => delete(&ctx, &vm).await,
        CommandKind::Attach { vm } => {
            let record = resolve_record(&ctx, &vm).await?;
            attach_session(&ctx, &record.id).await
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn probe(ctx: &HostContext) -> Result<()> {
    let status = ctx.coordinator.capability();
    println!("supported:            {}", status.is_supported);
    println!("hardware accel:       {}", status.has_hardware_accel);
    println!("native feature flag:  {}", status.has_native_feature_flag);
    println!("manager handle:       {}", status.has_manager_handle);
    println!("protected VMs:        {}", status.supports_protected);
    println!("non-protected VMs:    {}", status.supports_non_protected);
    if let Some(reason) = &status.failure_reason {
        println!("failure reason:       {reason}");
    }

    let guests = ctx.coordinator.supported_guest_os_list().await;
    if guests.is_empty() {
        println!("native guests:        (none)");
    } else {
        println!("native guests:        {}", guests.join(", "));
    }
    Ok(())
}

async fn setup(ctx: &HostContext) -> Result<()> {
    ctx.escalator.initialize();
    // Give the broker connection a moment to deliver its hello.
    tokio::time::sleep(std::time::Duration::from_millis(700)).await;

    let mut stage = ctx.coordinator.refresh_stage().await;
    if stage == SetupStage::PermissionRequired {
        println!("requesting permissions through the broker...");
        match ctx.escalator.grant_required_permissions().await {
            Ok(()) => println!("permissions granted"),
            Err(e) => eprintln!("grant failed: {e}"),
        }
        stage = ctx.coordinator.refresh_stage().await;
    }

    match stage {
        SetupStage::Unsupported => {
            bail!("this host does not support virtualization");
        }
        SetupStage::BrokerNotInstalled => {
            bail!("privileged broker is not installed (no socket found)");
        }
        SetupStage::BrokerNotRunning => {
            bail!("privileged broker is installed but not running");
        }
        SetupStage::PermissionRequired => {
            bail!("permissions still missing; re-run setup once the broker prompt is accepted");
        }
        SetupStage::Granted => {
            println!("setup complete");
            Ok(())
        }
    }
}

async fn list(ctx: &HostContext) -> Result<()> {
    let mut records = ctx.store.list().await?;
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    if records.is_empty() {
        println!("no VMs; create one with `hyperhost create <name>`");
        return Ok(());
    }
    println!(
        "{:<36}  {:<20}  {:<8}  {:>4}  {:>8}  {}",
        "ID", "NAME", "OS", "CPUS", "MEM", "STATUS"
    );
    for record in records {
        println!(
            "{:<36}  {:<20}  {:<8}  {:>4}  {:>6}MB  {}",
            record.id,
            record.name,
            record.os_type.label(),
            record.cpu_cores,
            record.memory_mb,
            record.status,
        );
    }
    Ok(())
}

async fn start(ctx: &HostContext, vm: &str, attach: bool) -> Result<()> {
    let record = resolve_record(ctx, vm).await?;
    match ctx.engine.create_and_start(&record).await {
        Ok(()) => println!("{} is running", record.name),
        Err(e) => {
            if let Some(detail) = ctx.engine.last_error(&record.id) {
                bail!("{e} ({detail})");
            }
            return Err(e.into());
        }
    }
    if attach {
        attach_session(ctx, &record.id).await?;
        ctx.engine.stop(&record.id).await.ok();
    }
    Ok(())
}

async fn delete(ctx: &HostContext, vm: &str) -> Result<()> {
    let record = resolve_record(ctx, vm).await?;
    ctx.engine.delete(&record.id).await?;
    // The engine only knows names it started in this process; clear any
    // state left over from an earlier run as well.
    let _ = ctx.platform.delete(&sanitize_vm_name(&record.name)).await;
    ctx.store.delete(&record.id).await?;
    println!("deleted {}", record.name);
    Ok(())
}

async fn attach_session(ctx: &HostContext, id: &str) -> Result<()> {
    let session = SessionBridge::new(ctx.engine.clone(), id.to_string(), &ctx.config, &ctx.paths);
    let mut lines = session.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            println!("{line}");
        }
    });

    session.connect();
    println!("attached; ':quit' detaches, ':int' sends an interrupt, ':eof' sends EOF");

    let mut input = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = input.next_line().await {
        match line.as_str() {
            ":quit" => break,
            ":int" => session.send_raw_bytes(session::control::INTERRUPT).await,
            ":eof" => session.send_raw_bytes(session::control::EOF).await,
            other => session.send(other).await,
        }
    }

    session.disconnect().await;
    printer.abort();
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn resolve_record(ctx: &HostContext, vm: &str) -> Result<VmRecord> {
    let records = ctx.store.list().await.context("listing records")?;
    records
        .iter()
        .find(|r| r.id == vm || r.name == vm)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no VM with id or name {vm:?}"))
}
