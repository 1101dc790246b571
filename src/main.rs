use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use nettally::capture::interfaces::InterfaceCatalog;
use nettally::capture::source::validate_filter;
use nettally::models::flow::Protocol;
use nettally::models::interface::InterfaceDescriptor;
use nettally::models::sample::TickReport;
use nettally::models::session::{CaptureSession, EndOutcome, RecordFilter};
use nettally::utils::logging;
use nettally::{AppConfig, CaptureExit, MonitorService, SessionStore};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Per-process network traffic monitor with session history")]
struct Args {
    /// SQLite database holding sessions and records
    #[clap(long, default_value = "nettally.db")]
    db: PathBuf,

    /// Log level (trace, debug, info, warn, error, off)
    #[clap(long, default_value = "info")]
    log_level: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List capture-capable network interfaces
    Interfaces {
        /// Print JSON instead of a table
        #[clap(long)]
        json: bool,
    },

    /// Check that a filter expression compiles
    CheckFilter {
        /// BPF filter expression
        expression: String,
    },

    /// Capture and record traffic until interrupted
    Monitor {
        /// Network interface to capture from (defaults to the first active one)
        #[clap(short, long)]
        interface: Option<String>,

        /// BPF filter expression
        #[clap(long)]
        filter: Option<String>,

        /// Enable promiscuous mode
        #[clap(short = 'P', long)]
        promiscuous: bool,

        /// Stop after this many seconds
        #[clap(long)]
        duration: Option<u64>,

        /// Aggregation window in milliseconds
        #[clap(long, default_value = "1000")]
        tick_ms: u64,

        /// Connection table refresh period in seconds
        #[clap(long, default_value = "2")]
        refresh_secs: u64,

        /// Bytes captured per packet
        #[clap(long, default_value = "65535")]
        snaplen: i32,

        /// Capture read timeout in milliseconds
        #[clap(long, default_value = "250")]
        timeout_ms: i32,

        /// Print one JSON report per window
        #[clap(long)]
        json: bool,
    },

    /// List recorded sessions
    Sessions {
        #[clap(long)]
        json: bool,
    },

    /// Show the records of one session
    Records {
        session_id: i64,

        /// Only these protocols (repeatable: TCP, UDP, OTHER)
        #[clap(long = "protocol")]
        protocols: Vec<Protocol>,

        /// Only records attributed to this process
        #[clap(long)]
        process: Option<String>,

        /// Minimum inbound rate in bytes per second
        #[clap(long)]
        min_in_rate: Option<f64>,

        #[clap(long)]
        json: bool,
    },

    /// Delete sessions and their records
    Delete {
        #[clap(required = true)]
        session_ids: Vec<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init_logger(logging::get_log_level(&args.log_level));

    match args.command {
        Command::Interfaces { json } => list_interfaces(json),
        Command::CheckFilter { expression } => {
            validate_filter(&expression)
                .await
                .with_context(|| format!("filter '{}' is invalid", expression))?;
            println!("Filter OK: {}", expression);
            Ok(())
        }
        Command::Monitor {
            interface,
            filter,
            promiscuous,
            duration,
            tick_ms,
            refresh_secs,
            snaplen,
            timeout_ms,
            json,
        } => {
            let config = AppConfig {
                interface,
                filter,
                promiscuous,
                snaplen,
                read_timeout_ms: timeout_ms,
                tick_interval: Duration::from_millis(tick_ms.max(1)),
                refresh_interval: Duration::from_secs(refresh_secs.max(1)),
                database_path: args.db,
                ..AppConfig::default()
            };
            monitor(config, duration.map(Duration::from_secs), json).await
        }
        Command::Sessions { json } => {
            let store = SessionStore::open(&args.db, AppConfig::default().degraded_after_failures)?;
            let sessions = store.list_sessions().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                print_sessions(&sessions);
            }
            Ok(())
        }
        Command::Records {
            session_id,
            protocols,
            process,
            min_in_rate,
            json,
        } => {
            let store = SessionStore::open(&args.db, AppConfig::default().degraded_after_failures)?;
            if store.get_session(session_id).await?.is_none() {
                return Err(anyhow!("session {} not found", session_id));
            }

            let filter = RecordFilter {
                protocols: protocols.into_iter().collect::<BTreeSet<_>>(),
                process_name: process,
                min_in_rate,
            };
            let records = store.get_records(session_id, Some(&filter)).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                println!(
                    "{:<24} {:>12} {:>12} {:<6} {:<20} FLOW",
                    "TIME", "IN", "OUT", "PROTO", "PROCESS"
                );
                for record in &records {
                    println!(
                        "{:<24} {:>12} {:>12} {:<6} {:<20} {} -> {}",
                        record.record_time.format("%Y-%m-%d %H:%M:%S%.3f"),
                        format_rate(record.in_rate),
                        format_rate(record.out_rate),
                        record.protocol.map(|p| p.as_str()).unwrap_or("-"),
                        record.process_name.as_deref().unwrap_or("-"),
                        record.src_addr.as_deref().unwrap_or("-"),
                        record.dst_addr.as_deref().unwrap_or("-"),
                    );
                }
                println!("{} records", records.len());
            }
            Ok(())
        }
        Command::Delete { session_ids } => {
            let store = SessionStore::open(&args.db, AppConfig::default().degraded_after_failures)?;
            let deleted = store.delete_sessions(&session_ids).await?;
            println!("Deleted {} of {} sessions", deleted, session_ids.len());
            Ok(())
        }
    }
}

fn list_interfaces(json: bool) -> Result<()> {
    let interfaces = InterfaceCatalog::default().list();

    if json {
        println!("{}", serde_json::to_string_pretty(&interfaces)?);
        return Ok(());
    }

    for iface in &interfaces {
        let state = if iface.is_up { "up" } else { "down" };
        let loopback = if iface.is_loopback { " loopback" } else { "" };
        println!("{:<20} {:<5}{} {}", iface.device_name, state, loopback, iface.formatted_display());
        for addr in &iface.addresses {
            println!("{:<20} {}", "", addr);
        }
    }
    Ok(())
}

async fn monitor(config: AppConfig, duration: Option<Duration>, json: bool) -> Result<()> {
    warn_if_unprivileged();

    let interface = config.interface.clone();
    let filter = config.filter.clone();
    let mut service = MonitorService::new(config)?;

    let descriptor = match interface {
        Some(name) => name,
        None => default_interface(&service.interfaces().list())
            .ok_or_else(|| anyhow!("No interface specified and no active interface found"))?,
    };

    let mut reports = service.subscribe();
    let session_id = service.start_monitoring_by_name(&descriptor, filter.as_deref()).await?;
    info!("Recording session {} on {} (Ctrl-C to stop)", session_id, descriptor);

    let printer = tokio::spawn(async move {
        loop {
            match reports.recv().await {
                Ok(report) => print_report(&report, json),
                Err(RecvError::Lagged(missed)) => warn!("Display fell behind, {} reports dropped", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };

    let capture_exit = service.capture_exit();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            info!("Interrupted");
        }
        _ = deadline => info!("Duration elapsed"),
        exit = capture_exit => match exit {
            CaptureExit::Ended => info!("Capture source ended"),
            CaptureExit::Failed(reason) => error!("Capture stopped: {}", reason),
        },
    }

    let stopped = service.stop_monitoring().await;
    printer.abort();
    let outcome = stopped?;

    let stats = service.stats();
    match outcome {
        EndOutcome::Ended(session) => {
            print_sessions(std::slice::from_ref(&session));
            println!(
                "{} packets ({} unparsed, {} unknown process), {} failed writes, {} skipped ticks",
                stats.packets_seen, stats.packets_unparsed, stats.packets_unknown, stats.failed_writes, stats.ticks_skipped
            );
        }
        EndOutcome::NotFound => warn!("Session {} vanished before it could be closed", session_id),
    }
    Ok(())
}

/// First interface that is up, not loopback and has an address
fn default_interface(interfaces: &[InterfaceDescriptor]) -> Option<String> {
    interfaces
        .iter()
        .find(|i| i.is_up && !i.is_loopback && !i.addresses.is_empty())
        .map(|i| i.device_name.clone())
}

fn print_report(report: &TickReport, json: bool) {
    if json {
        match serde_json::to_string(report) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Failed to serialize report: {}", e),
        }
        return;
    }

    let degraded = if report.store_degraded { "  [store degraded]" } else { "" };
    println!(
        "{}  in {:>12}  out {:>12}{}",
        report.interface.time.format("%H:%M:%S"),
        format_rate(report.interface.in_rate),
        format_rate(report.interface.out_rate),
        degraded
    );
    for process in report.processes.iter().take(5) {
        let pid = process.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "    {:<24} {:>7}  in {:>12}  out {:>12}",
            process.process_name,
            pid,
            format_rate(process.in_rate),
            format_rate(process.out_rate)
        );
    }
}

fn print_sessions(sessions: &[CaptureSession]) {
    println!(
        "{:>5} {:<16} {:<20} {:<20} {:>12} {:>12} {:>8}",
        "ID", "INTERFACE", "START", "END", "AVG IN", "AVG OUT", "RECORDS"
    );
    for session in sessions {
        let end = session
            .end_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "active".to_string());
        println!(
            "{:>5} {:<16} {:<20} {:<20} {:>12} {:>12} {:>8}",
            session.id,
            session.interface_name,
            session.start_time.format("%Y-%m-%d %H:%M:%S"),
            end,
            format_rate(session.avg_in),
            format_rate(session.avg_out),
            session.record_count
        );
    }
}

fn format_rate(bytes_per_sec: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];
    let mut value = bytes_per_sec;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Capture usually needs elevated privileges; say so up front
fn warn_if_unprivileged() {
    #[cfg(target_os = "windows")]
    {
        let is_admin = std::process::Command::new("powershell")
            .args([
                "-Command",
                "[bool](([System.Security.Principal.WindowsIdentity]::GetCurrent()).groups -match 'S-1-5-32-544')",
            ])
            .output()
            .map(|output| String::from_utf8_lossy(&output.stdout).trim() == "True")
            .unwrap_or(false);

        if !is_admin {
            warn!("Not running with administrator privileges; capture may fail");
        }
    }

    #[cfg(unix)]
    {
        let is_root = std::process::Command::new("id")
            .arg("-u")
            .output()
            .map(|output| String::from_utf8_lossy(&output.stdout).trim() == "0")
            .unwrap_or(false);

        if !is_root {
            warn!("Not running as root; capture and process attribution may be limited");
        }
    }
}
