use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tapwire_archive::{ArchiveWriter, DirectoryArchiveWriter, NullArchiveWriter};
use tapwire_proxy::{
    BreakPointEvents, BreakPointManager, BreakPointStatus, Proxy, ProxyConfig, RuleSet,
    load_rules,
};
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tapwire", about = "Intercepting HTTP/HTTPS proxy")]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Listen address as host:port.
    #[arg(long)]
    listen: Option<String>,
    #[arg(long)]
    rules: Option<PathBuf>,
    #[arg(long = "archive-dir")]
    archive_dir: Option<PathBuf>,
    /// Tunnel CONNECT traffic without decrypting it.
    #[arg(long = "no-decrypt")]
    no_decrypt: bool,
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let cli = Cli::parse();
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = build_config(&cli)?;
    let rules = match &config.rules_file {
        Some(path) => load_rules(path).map_err(|err| format!("{path}: {err}"))?,
        None => RuleSet::default(),
    };
    tracing::info!(rules = rules.len(), "rules loaded");

    let directory = if config.archive.enabled {
        let writer = DirectoryArchiveWriter::open(&config.archive.directory)
            .map_err(|err| format!("{}: {err}", config.archive.directory))?;
        tracing::info!(root = %writer.paths().root.display(), "archiving exchanges");
        Some(Arc::new(writer))
    } else {
        None
    };
    let archive: Arc<dyn ArchiveWriter> = match &directory {
        Some(writer) => writer.clone(),
        None => Arc::new(NullArchiveWriter),
    };

    let (proxy, events) = Proxy::new(config, rules, archive).map_err(|err| err.to_string())?;
    if let Some(paths) = proxy.ca_paths() {
        tracing::info!(cert = %paths.cert_path.display(), "install this CA to trust intercepted TLS");
    }
    tokio::spawn(continue_breakpoints(
        events,
        Arc::clone(proxy.breakpoints()),
    ));

    let proxy = Arc::new(proxy);
    let runner = Arc::clone(&proxy);
    let mut server = tokio::spawn(async move { runner.run().await });
    let finished = tokio::select! {
        joined = &mut server => joined,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            proxy.shutdown();
            server.await
        }
    };
    let result = finished
        .map_err(|err| err.to_string())
        .and_then(|run| run.map_err(|err| err.to_string()));

    if let Some(writer) = directory {
        if let Err(err) = writer.flush() {
            tracing::warn!(error = %err, "archive flush failed");
        }
    }
    result
}

fn build_config(cli: &Cli) -> Result<ProxyConfig, String> {
    let mut config = match &cli.config {
        Some(path) => {
            ProxyConfig::load(path).map_err(|err| format!("{}: {err}", path.display()))?
        }
        None => ProxyConfig::default(),
    };
    if let Some(listen) = &cli.listen {
        let (host, port) = listen
            .rsplit_once(':')
            .ok_or_else(|| format!("--listen expects host:port, got {listen}"))?;
        config.listen.host = host.trim_matches(['[', ']']).to_string();
        config.listen.port = port
            .parse()
            .map_err(|_| format!("invalid port in --listen {listen}"))?;
    }
    if let Some(rules) = &cli.rules {
        config.rules_file = Some(rules.to_string_lossy().into_owned());
    }
    if let Some(dir) = &cli.archive_dir {
        config.archive.enabled = true;
        config.archive.directory = dir.to_string_lossy().into_owned();
    }
    if cli.no_decrypt {
        config.tls.decrypt = false;
    }
    Ok(config)
}

/// No editor is attached to the command line, so every suspension is
/// logged and released unchanged.
async fn continue_breakpoints(mut events: BreakPointEvents, breakpoints: Arc<BreakPointManager>) {
    while let Some(event) = events.next().await {
        if event.status != BreakPointStatus::Running {
            continue;
        }
        tracing::info!(
            exchange_id = event.exchange_id,
            location = ?event.location,
            "breakpoint hit, continuing"
        );
        if let Err(err) = breakpoints.resolve(event.exchange_id, event.location, None) {
            tracing::warn!(exchange_id = event.exchange_id, error = %err, "breakpoint release failed");
        }
    }
}
