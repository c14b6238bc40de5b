//! Command-line companion for the library: probe devices, browse
//! storages, pull/push files and inspect the transfer journal.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use log::info;

use rs_mtp::transport::usb::list_mtp_devices;
use rs_mtp::{
    actionable_message, CancelToken, DeviceSession, IdentityStore, MtpError, QuirkDatabase,
    SessionOptions, TransferJournal, TransferProgress, TuningMode, UsbLinkFactory, UserOverrides,
};

#[derive(Parser)]
#[command(name = "mtptool", about = "Talk to MTP devices over USB", version)]
struct Cli {
    /// Select the device by index in `mtptool devices` output
    #[arg(long, default_value_t = 0)]
    device: usize,

    /// Path to the quirk database JSON
    #[arg(long)]
    quirks: Option<PathBuf>,

    /// Directory for the transfer journal and identity store
    #[arg(long, default_value = ".mtptool")]
    state_dir: PathBuf,

    /// Conservative tuning: bypass probed, learned and quirk layers
    #[arg(long)]
    safe: bool,

    /// Bypass learned and quirk layers only
    #[arg(long)]
    strict: bool,

    /// Emit machine-readable JSON instead of text
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List attached MTP-capable devices
    Devices,
    /// Open a session and print the probe receipt
    Probe,
    /// List a directory (device root when no parent handle is given)
    Ls {
        #[arg(long)]
        storage: Option<u32>,
        #[arg(long)]
        parent: Option<u32>,
    },
    /// Download an object to a local file
    Pull {
        #[arg(value_parser = parse_handle)]
        handle: u32,
        dest: PathBuf,
    },
    /// Upload a local file into a directory on the device
    Push {
        source: PathBuf,
        #[arg(long)]
        storage: Option<u32>,
        #[arg(long, default_value_t = 0, value_parser = parse_handle)]
        parent: u32,
        #[arg(long)]
        name: Option<String>,
    },
    /// Show resumable transfers recorded in the journal
    Resumables,
    /// Delete stale temp files and journal rows older than N hours
    Sweep {
        #[arg(long, default_value_t = 72)]
        older_than_hours: u64,
    },
}

fn parse_handle(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let journal = Arc::new(TransferJournal::open(&cli.state_dir.join("transfers.jsonl"))?);

    match &cli.command {
        Command::Devices => return cmd_devices(&cli),
        Command::Resumables => return cmd_resumables(&cli, &journal),
        Command::Sweep { older_than_hours } => {
            let purged = journal
                .clear_stale_temps(std::time::Duration::from_secs(*older_than_hours * 3600))?;
            println!("purged {purged} stale transfer(s)");
            return Ok(());
        }
        _ => {}
    }

    // the remaining commands need an open session
    let session = open_session(&cli, journal.clone())?;
    let cancel = CancelToken::new();

    match cli.command {
        Command::Probe => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(session.receipt())?);
            } else {
                let receipt = session.receipt();
                println!("device:   {}", session.info().model);
                println!("identity: {}", session.identity().identity_key);
                for attempt in &receipt.attempts {
                    let status = match &attempt.failure {
                        Some(failure) => format!("failed: {failure}"),
                        None => "selected".to_string(),
                    };
                    println!(
                        "iface {:>2} alt {} score {:>3} {:>5}ms  {status}",
                        attempt.interface_number,
                        attempt.alt_setting,
                        attempt.score,
                        attempt.elapsed_ms
                    );
                }
                if let Some(rule) = &receipt.quirk_rule_id {
                    println!("quirk:    {rule}");
                }
            }
        }
        Command::Ls { storage, parent } => {
            let storages = session.storages(&cancel).map_err(pretty)?;
            let storage_id = match storage {
                Some(id) => id,
                None => {
                    storages
                        .first()
                        .context("device reports no storage")?
                        .storage_id
                }
            };
            let objects = session.list(storage_id, parent, &cancel).map_err(pretty)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&objects)?);
            } else {
                for o in objects {
                    let kind = if o.is_directory { "d" } else { "-" };
                    println!(
                        "{kind} {:>10} {:#010x}  {}",
                        o.size_bytes.unwrap_or(0),
                        o.handle,
                        o.name
                    );
                }
            }
        }
        Command::Pull { handle, dest } => {
            let progress: &(dyn Fn(TransferProgress) + Send + Sync) = &|p: TransferProgress| {
                eprint!(
                    "\r{} / {} bytes ({:.1} MB/s)   ",
                    p.transferred,
                    p.total.map(|t| t.to_string()).unwrap_or_else(|| "?".into()),
                    p.mbps
                );
            };
            let bytes = session
                .read_to_file(handle, &dest, Some(progress), &cancel)
                .map_err(pretty)?;
            eprintln!();
            println!("pulled {bytes} bytes to {}", dest.display());
        }
        Command::Push {
            source,
            storage,
            parent,
            name,
        } => {
            let storages = session.storages(&cancel).map_err(pretty)?;
            let storage_id = match storage {
                Some(id) => id,
                None => {
                    storages
                        .first()
                        .context("device reports no storage")?
                        .storage_id
                }
            };
            let name = match name {
                Some(name) => name,
                None => source
                    .file_name()
                    .context("source path has no file name")?
                    .to_string_lossy()
                    .into_owned(),
            };
            let handle = session
                .write_from_file(storage_id, parent, &name, &source, None, &cancel)
                .map_err(pretty)?;
            println!("pushed {} as {handle:#x}", source.display());
        }
        _ => unreachable!("handled above"),
    }

    session.close();
    Ok(())
}

fn cmd_devices(cli: &Cli) -> anyhow::Result<()> {
    let context = rusb::Context::new()?;
    let devices = list_mtp_devices(&context)?;
    if devices.is_empty() {
        bail!("no MTP-capable devices attached");
    }
    if cli.json {
        let descriptors: Vec<_> = devices.iter().map(|(_, d)| d).collect();
        println!("{}", serde_json::to_string_pretty(&descriptors)?);
        return Ok(());
    }
    for (index, (_, d)) in devices.iter().enumerate() {
        println!(
            "[{index}] {:04x}:{:04x} {} {} ({} candidate interface(s))",
            d.vendor_id,
            d.product_id,
            d.manufacturer.as_deref().unwrap_or("?"),
            d.model.as_deref().unwrap_or("?"),
            d.candidates.len()
        );
    }
    Ok(())
}

fn cmd_resumables(cli: &Cli, journal: &TransferJournal) -> anyhow::Result<()> {
    let identities = IdentityStore::open(&cli.state_dir.join("identities.json"));
    let mut any = false;
    for identity in identities.all_identities() {
        for record in journal.resumables(&identity.domain_id.to_string()) {
            any = true;
            if cli.json {
                println!("{}", serde_json::to_string(&record)?);
            } else {
                println!(
                    "{} {:?} {:?} {} committed {}/{}",
                    record.id,
                    record.kind,
                    record.state,
                    record.name,
                    record.committed_bytes,
                    record
                        .total_bytes
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "?".into()),
                );
            }
        }
    }
    if !any && !cli.json {
        println!("nothing to resume");
    }
    Ok(())
}

fn open_session(cli: &Cli, journal: Arc<TransferJournal>) -> anyhow::Result<DeviceSession> {
    let context = rusb::Context::new()?;
    let mut devices = list_mtp_devices(&context)?;
    if devices.is_empty() {
        bail!("no MTP-capable devices attached");
    }
    if cli.device >= devices.len() {
        bail!(
            "device index {} out of range ({} attached)",
            cli.device,
            devices.len()
        );
    }
    let (device, descriptor) = devices.remove(cli.device);

    let quirks = match &cli.quirks {
        Some(path) => QuirkDatabase::load(path)?,
        None => QuirkDatabase::default(),
    };
    let mode = if cli.safe {
        TuningMode::Safe
    } else if cli.strict {
        TuningMode::Strict
    } else {
        TuningMode::Normal
    };
    let identities = IdentityStore::open(&cli.state_dir.join("identities.json"));
    let options = SessionOptions {
        quirks: &quirks,
        mode,
        overrides: &UserOverrides::from_env(),
        learned: None,
        verify_transfers: true,
    };

    info!(
        "opening {:04x}:{:04x}",
        descriptor.vendor_id, descriptor.product_id
    );
    let mut factory = UsbLinkFactory::new(device);
    let cancel = CancelToken::new();
    DeviceSession::open(&descriptor, &mut factory, &options, journal, &identities, &cancel)
        .map_err(pretty)
}

fn pretty(error: MtpError) -> anyhow::Error {
    anyhow::anyhow!("{}\n  hint: {}", error, actionable_message(&error))
}
