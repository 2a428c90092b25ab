//! nettrace - per-connection network accounting
//!
//! Polls the kernel connection tables, derives interval counters, attaches
//! NAT translations, and writes each connection set as a JSONL payload.

use clap::{Parser, Subcommand};
use nettrace_conntrack::{NatEnricher, NetlinkConntracker};
use nettrace_core::config::{ConfigLoader, TracerConfig};
use nettrace_core::{ConnectionRecord, Connections, EncodeOptions, TranslationSource};
use nettrace_ebpf::compat;
use nettrace_ebpf::{monotonic_now_ns, NetworkTracer, TracerError};
use nettrace_export::{
    read_payloads, ConnectionExporter, JsonlExporter, JsonlExporterConfig, SnapshotServer,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "nettrace")]
#[command(version)]
#[command(about = "Per-connection network accounting from kernel probes", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "NETTRACE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll connections and write them to the JSONL sink (requires root)
    Run {
        /// Output file for JSONL payloads
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Seconds between polls
        #[arg(short, long)]
        interval: Option<u64>,

        /// Path to the compiled eBPF object
        #[arg(long)]
        bpf_object: Option<PathBuf>,

        /// Do not attach NAT translations
        #[arg(long)]
        no_conntrack: bool,

        /// Unix socket serving the most recent connection set
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Check whether this kernel can run the tracer
    Check,

    /// Print connection sets from a JSONL file
    Show {
        /// Input JSONL file
        #[arg(short, long)]
        input: PathBuf,

        /// Number of payloads to print, counted from the end
        #[arg(short, long, default_value = "1")]
        num: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.clone());

    // CLI verbose flag takes precedence over the config file
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.tracer.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            output,
            interval,
            bpf_object,
            no_conntrack,
            socket,
        } => {
            let config =
                merge_run_config(config, output, interval, bpf_object, no_conntrack, socket);
            run_command(config).await
        }
        Commands::Check => check_command(&config),
        Commands::Show { input, num } => show_command(&input, num),
    }
}

/// Load configuration from file/env, with fallback to defaults
fn load_config(cli_path: Option<PathBuf>) -> TracerConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => config,
        Err(e) => {
            // Logging is not set up yet
            eprintln!("Failed to load configuration: {}, using defaults", e);
            TracerConfig::default()
        }
    }
}

/// CLI arguments take precedence when explicitly provided
fn merge_run_config(
    mut config: TracerConfig,
    output: Option<PathBuf>,
    interval: Option<u64>,
    bpf_object: Option<PathBuf>,
    no_conntrack: bool,
    socket: Option<PathBuf>,
) -> TracerConfig {
    if let Some(path) = output {
        config.export.jsonl.enabled = true;
        config.export.jsonl.path = path.to_string_lossy().to_string();
    }
    if let Some(secs) = interval {
        config.tracer.interval_secs = secs.max(1);
    }
    if let Some(path) = bpf_object {
        config.tracer.bpf_object_path = Some(path.to_string_lossy().to_string());
    }
    if no_conntrack {
        config.conntrack.enabled = false;
    }
    if let Some(path) = socket {
        config.tracer.socket_path = Some(path.to_string_lossy().to_string());
    }
    config
}

#[cfg(target_os = "linux")]
fn start_tracer(
    config: &TracerConfig,
    translations: Option<Arc<dyn TranslationSource>>,
) -> Result<NetworkTracer, TracerError> {
    NetworkTracer::start(config, translations)
}

#[cfg(not(target_os = "linux"))]
fn start_tracer(
    _config: &TracerConfig,
    _translations: Option<Arc<dyn TranslationSource>>,
) -> Result<NetworkTracer, TracerError> {
    Err(nettrace_ebpf::TablesError::Unsupported.into())
}

async fn run_command(config: TracerConfig) -> anyhow::Result<()> {
    info!("nettrace v{} starting", nettrace_core::TRACER_VERSION);

    let mut refresher = None;
    let translations: Option<Arc<dyn TranslationSource>> = if config.conntrack.enabled {
        let conntracker = Arc::new(NetlinkConntracker::new(&config.conntrack));
        if let Err(e) = conntracker.refresh().await {
            warn!("Initial conntrack dump failed: {}", e);
        }
        refresher = Some(conntracker.spawn_refresher());
        Some(Arc::new(NatEnricher::new(
            conntracker,
            Duration::from_millis(config.conntrack.lookup_timeout_ms),
        )))
    } else {
        info!("Conntrack disabled, connections carry no NAT translation");
        None
    };

    let exporter = if config.export.jsonl.enabled {
        let exporter = JsonlExporter::new(JsonlExporterConfig::from(&config.export));
        exporter.open()?;
        Some(exporter)
    } else {
        warn!("No exporter enabled, polled connections are only logged");
        None
    };

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    match start_tracer(&config, translations) {
        Ok(tracer) => {
            let tracer = Arc::new(tracer);
            let server = match &config.tracer.socket_path {
                Some(path) => serve_snapshots(path, &config, Arc::clone(&tracer)).await,
                None => None,
            };

            info!(
                "Polling every {}s, connection timeout {}s",
                config.tracer.interval_secs, config.tracer.connection_timeout_secs
            );
            let mut ticker =
                tokio::time::interval(Duration::from_secs(config.tracer.interval_secs.max(1)));

            loop {
                tokio::select! {
                    _ = ticker.tick() => poll_once(&tracer, exporter.as_ref()).await,
                    _ = &mut shutdown => break,
                }
            }

            if let Some((server, handle)) = server {
                handle.abort();
                server.remove_socket();
            }

            let stats = tracer.stats();
            info!(
                "{} polls, {} kernel evictions, {} flows tracked, {} expired",
                stats.polls, stats.kernel_evictions, stats.tracker.tracked, stats.tracker.expired
            );
        }
        Err(e) => {
            // Only network tracing is disabled; keep serving until stopped
            error!("Network tracing disabled: {}", e);
            info!("Press Ctrl+C to stop");
            (&mut shutdown).await?;
        }
    }

    info!("Shutting down...");
    if let Some(handle) = refresher {
        handle.abort();
    }
    if let Some(exporter) = &exporter {
        exporter.flush().await?;
        exporter.close()?;
    }
    info!("nettrace stopped");

    Ok(())
}

async fn serve_snapshots(
    path: &str,
    config: &TracerConfig,
    tracer: Arc<NetworkTracer>,
) -> Option<(SnapshotServer, JoinHandle<()>)> {
    let options = EncodeOptions {
        nil_slice_as_empty: config.export.nil_slice_as_empty,
        pretty: false,
    };
    let server = SnapshotServer::new(path, options);
    match server.start(move || tracer.snapshot()).await {
        Ok(handle) => Some((server, handle)),
        Err(e) => {
            warn!("Connection socket unavailable: {}", e);
            None
        }
    }
}

async fn poll_once(tracer: &NetworkTracer, exporter: Option<&JsonlExporter>) {
    let conns = match tracer.get_connections(monotonic_now_ns()).await {
        Ok(conns) => conns,
        Err(e) => {
            error!("Poll failed: {}", e);
            return;
        }
    };

    debug!("Polled {} connections", conns.len());

    if let Some(exporter) = exporter {
        if let Err(e) = exporter.export(&conns).await {
            error!("Export to {} failed: {}", exporter.name(), e);
        }
    }
}

fn check_command(config: &TracerConfig) -> anyhow::Result<()> {
    println!();
    println!("nettrace v{}", nettrace_core::TRACER_VERSION);
    println!();
    println!(
        "Platform: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );

    #[cfg(target_os = "linux")]
    {
        println!(
            "Running as root: {}",
            nix::unistd::geteuid().is_root()
        );
        println!("eBPF available: {}", compat::check_ebpf_available());
    }

    match compat::current_kernel_version_code() {
        Ok(code) => {
            println!(
                "Kernel: {} (version code {})",
                compat::kernel_code_to_string(code),
                code
            );
            match NetworkTracer::check(config, code) {
                Ok(()) => println!("Verdict: supported"),
                Err(e) => println!("Verdict: not supported ({})", e),
            }
        }
        Err(e) => println!("Kernel: unknown ({})", e),
    }

    match &config.tracer.bpf_object_path {
        Some(path) => println!("eBPF object: {}", path),
        None => println!("eBPF object: not configured"),
    }
    println!();

    Ok(())
}

fn show_command(input: &Path, num: usize) -> anyhow::Result<()> {
    let payloads = read_payloads(input)?;
    let skip = payloads.len().saturating_sub(num);

    for (index, conns) in payloads.iter().enumerate().skip(skip) {
        print_payload(index, conns);
    }

    let total: usize = payloads.iter().map(Connections::len).sum();
    println!(
        "{} payloads, {} connection records",
        payloads.len(),
        total
    );

    Ok(())
}

fn print_payload(index: usize, conns: &Connections) {
    println!("Payload #{} ({} connections)", index, conns.len());
    println!(
        "  {:<7} {:<47} {:<9} {:>12} {:>12} {:>6}  {}",
        "PROTO", "FLOW", "DIR", "SENT", "RECV", "RETR", "NAT"
    );
    for record in &conns.conns {
        println!("  {}", format_record(record));
    }
    println!();
}

fn format_record(record: &ConnectionRecord) -> String {
    let flow = format!(
        "{}:{} -> {}:{}",
        record.source, record.sport, record.dest, record.dport
    );
    let nat = match &record.ip_translation {
        Some(t) => format!(
            "{}:{} -> {}:{}",
            t.repl_src_ip, t.repl_src_port, t.repl_dst_ip, t.repl_dst_port
        ),
        None => "-".to_string(),
    };
    format!(
        "{:<7} {:<47} {:<9} {:>12} {:>12} {:>6}  {}",
        format!("{}{}", record.conn_type, record.family),
        flow,
        record.direction.to_string(),
        format!("+{}", record.last_sent_bytes),
        format!("+{}", record.last_recv_bytes),
        record.last_retransmits,
        nat
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nettrace_core::{Address, ConnectionDirection, IPTranslation};

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "nettrace",
            "-vv",
            "run",
            "--output",
            "/tmp/out.jsonl",
            "--interval",
            "5",
            "--no-conntrack",
            "--socket",
            "/run/nettrace.sock",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command,
            Commands::Run {
                interval: Some(5),
                no_conntrack: true,
                socket: Some(_),
                ..
            }
        ));

        let cli = Cli::try_parse_from(["nettrace", "show", "-i", "x.jsonl"]).unwrap();
        assert!(matches!(cli.command, Commands::Show { num: 1, .. }));
    }

    #[test]
    fn test_merge_run_config() {
        let config = merge_run_config(
            TracerConfig::default(),
            Some(PathBuf::from("/tmp/out.jsonl")),
            Some(0),
            Some(PathBuf::from("/opt/nettrace/probes.o")),
            true,
            Some(PathBuf::from("/run/nettrace.sock")),
        );
        assert_eq!(config.export.jsonl.path, "/tmp/out.jsonl");
        assert!(config.export.jsonl.enabled);
        assert_eq!(config.tracer.interval_secs, 1);
        assert_eq!(
            config.tracer.bpf_object_path.as_deref(),
            Some("/opt/nettrace/probes.o")
        );
        assert!(!config.conntrack.enabled);
        assert_eq!(
            config.tracer.socket_path.as_deref(),
            Some("/run/nettrace.sock")
        );

        let untouched = merge_run_config(TracerConfig::default(), None, None, None, false, None);
        assert_eq!(untouched.tracer.interval_secs, 30);
        assert!(untouched.tracer.socket_path.is_none());
        assert!(untouched.conntrack.enabled);
    }

    #[test]
    fn test_format_record() {
        let record = ConnectionRecord {
            source: Address::Text("10.0.0.5".to_string()),
            sport: 40000,
            dest: Address::Text("93.184.216.34".to_string()),
            dport: 443,
            last_sent_bytes: 1200,
            last_recv_bytes: 5400,
            direction: ConnectionDirection::Outgoing,
            ip_translation: Some(IPTranslation {
                repl_src_ip: "93.184.216.34".to_string(),
                repl_dst_ip: "192.168.1.10".to_string(),
                repl_src_port: 443,
                repl_dst_port: 61000,
            }),
            ..Default::default()
        };
        let line = format_record(&record);
        assert!(line.starts_with("tcpv4"));
        assert!(line.contains("10.0.0.5:40000 -> 93.184.216.34:443"));
        assert!(line.contains("outgoing"));
        assert!(line.contains("+1200"));
        assert!(line.ends_with("93.184.216.34:443 -> 192.168.1.10:61000"));
    }
}
