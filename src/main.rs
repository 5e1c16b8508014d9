/*
 * swiftfetch - High-throughput multi-protocol transfer engine.
 * Copyright (C) 2025  swiftfetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use swiftfetch::config::Config;
use swiftfetch::engine::controller::probe_only;
use swiftfetch::engine::plan::FetchPlan;
use swiftfetch::engine::retry::RetryCategory;
use swiftfetch::engine::FetchOutcome;
use swiftfetch::events::{ConcurrencyReason, EventSink, Progress};
use swiftfetch::protocols::ProbeReport;
use swiftfetch::{FetchController, FetchRequest};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\n",
    "Copyright (C) 2025  swiftfetch contributors\n",
    "License GPLv3+: GNU GPL version 3 or later <https://gnu.org/licenses/gpl.html>\n\n",
    "This is free software; you are free to change and redistribute it.\n",
    "There is NO WARRANTY, to the extent permitted by law."
);

#[derive(Parser)]
#[command(name = "swiftfetch")]
#[command(version = VERSION)]
#[command(long_version = LONG_VERSION)]
#[command(about = "High-throughput multi-protocol transfer engine.")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Download a resource
    Fetch {
        /// URL to download
        url: String,

        #[command(flatten)]
        options: TransferArgs,
    },

    /// Download from the fastest of several mirrors
    Mirror {
        /// Mirror URLs for the same resource
        #[arg(required = true, num_args = 2..)]
        urls: Vec<String>,

        #[command(flatten)]
        options: TransferArgs,
    },

    /// Probe a URL without transferring the body
    Probe {
        /// URL to probe
        url: String,

        /// Emit the probe result as JSON
        #[arg(long)]
        json: bool,

        /// Skip TLS certificate verification
        #[arg(long)]
        no_verify: bool,

        /// Request timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[derive(Args)]
struct TransferArgs {
    /// Output path (defaults to the URL filename)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Maximum parallel connections
    #[arg(short = 'c', long)]
    connections: Option<usize>,

    /// Expected SHA-256 of the complete object
    #[arg(long)]
    sha256: Option<String>,

    /// Do not resume an interrupted transfer
    #[arg(long)]
    no_resume: bool,

    /// Per-request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Proxy URL (http, https, or socks5)
    #[arg(long)]
    proxy: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long)]
    no_verify: bool,

    /// Pin a certificate: HOST=SHA256HEX (repeatable)
    #[arg(long = "pin", value_name = "HOST=FP")]
    pins: Vec<String>,

    /// Extra request header: NAME=VALUE (repeatable)
    #[arg(long = "header", short = 'H', value_name = "NAME=VALUE")]
    headers: Vec<String>,

    /// Cookie string sent with every request
    #[arg(long)]
    cookie: Option<String>,

    /// Write the body to stdout instead of a file
    #[arg(long = "stdout")]
    to_stdout: bool,

    /// Attempt HTTP/3 when the server advertises it
    #[arg(long)]
    http3: bool,

    /// Minimum chunk size in bytes
    #[arg(long)]
    min_chunk: Option<u64>,

    /// Maximum chunk size in bytes
    #[arg(long)]
    max_chunk: Option<u64>,

    /// Emit the terminal record as JSON
    #[arg(long)]
    json: bool,

    /// No progress output
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::load();
    if let Err(message) = config.validate() {
        eprintln!("{} invalid configuration: {message}", style("!").red().bold());
        std::process::exit(2);
    }

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    swiftfetch::logging::init(&level, config.logging.file.as_deref());

    let code = match run(cli, config).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{} {err}", style("!").red().bold());
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Command::Fetch { url, options } => transfer(vec![url], options, config).await,
        Command::Mirror { urls, options } => transfer(urls, options, config).await,
        Command::Probe {
            url,
            json,
            no_verify,
            timeout,
        } => {
            let mut request = FetchRequest::from_config(&config);
            request.urls = vec![url];
            request.verify_tls = !no_verify && request.verify_tls;
            if let Some(secs) = timeout {
                request.timeout = Duration::from_secs(secs);
            }
            let probe = probe_only(&request)
                .await
                .map_err(|e| anyhow!(e.to_string()))?;
            if json {
                println!("{}", probe_json(&probe));
            } else {
                print_probe_table(&probe);
            }
            Ok(())
        }
    }
}

async fn transfer(urls: Vec<String>, options: TransferArgs, config: Config) -> Result<()> {
    let mut request = FetchRequest::from_config(&config);
    request.urls = urls;
    request.output = options.output.clone();
    request.to_stdout = options.to_stdout;
    if let Some(n) = options.connections {
        request.max_connections = n.clamp(1, 32);
    }
    request.expected_sha256 = options.sha256.clone();
    if options.no_resume {
        request.resume = false;
    }
    if let Some(secs) = options.timeout {
        request.timeout = Duration::from_secs(secs);
    }
    if options.proxy.is_some() {
        request.proxy = options.proxy.clone();
    }
    if options.no_verify {
        request.verify_tls = false;
    }
    if options.http3 {
        request.http3 = true;
    }
    if let Some(min) = options.min_chunk {
        request.min_chunk = min;
    }
    if let Some(max) = options.max_chunk {
        request.max_chunk = max;
    }
    for pin in &options.pins {
        let (host, fingerprint) = pin
            .split_once('=')
            .ok_or_else(|| anyhow!("--pin expects HOST=SHA256HEX, got '{pin}'"))?;
        request
            .pins
            .insert(host.to_string(), fingerprint.to_string());
    }
    for header in &options.headers {
        let (name, value) = header
            .split_once('=')
            .ok_or_else(|| anyhow!("--header expects NAME=VALUE, got '{header}'"))?;
        request
            .headers
            .push((name.to_string(), value.to_string()));
    }
    request.cookie = options.cookie.clone();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let sink: Arc<dyn EventSink> = if options.quiet || options.json || options.to_stdout {
        Arc::new(swiftfetch::NullSink)
    } else {
        Arc::new(ProgressRenderer::new())
    };

    let controller = FetchController::new(sink, cancel);
    let outcome = controller.fetch(request).await;

    if options.json {
        println!("{}", outcome_json(&outcome));
    }

    match outcome {
        Ok(report) => {
            if !options.json && !options.to_stdout {
                println!(
                    "{} {} in {:.1}s ({}/s) over {} [{}]",
                    style("::").cyan().bold(),
                    format_bytes(report.bytes),
                    report.duration.as_secs_f64(),
                    format_bytes(report.avg_throughput as u64),
                    report.protocol_used,
                    style(&report.sha256[..16]).dim(),
                );
            }
            Ok(())
        }
        Err(failure) => {
            if options.json {
                // The JSON record already carries the failure.
                std::process::exit(1);
            }
            let mut message = format!("{}: {}", failure.kind, failure.message);
            if failure.can_resume {
                message.push_str(&format!(
                    " ({} saved, re-run to resume)",
                    format_bytes(failure.partial_bytes)
                ));
            }
            Err(anyhow!(message))
        }
    }
}

/// indicatif-backed renderer; a pure consumer of engine events.
struct ProgressRenderer {
    bar: ProgressBar,
}

impl ProgressRenderer {
    fn new() -> Self {
        let bar = ProgressBar::hidden();
        bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.cyan} {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} eta {eta}",
                )
                .unwrap()
                .progress_chars("=>-"),
        );
        Self { bar }
    }
}

impl EventSink for ProgressRenderer {
    fn on_plan(&self, plan: &FetchPlan) {
        if let Some(total) = plan.total_size {
            self.bar.set_length(total);
        }
        self.bar.set_position(plan.resume_offset);
        self.bar
            .set_message(plan.output.file_name().map_or_else(
                || plan.url.clone(),
                |n| n.to_string_lossy().to_string(),
            ));
        self.bar
            .set_draw_target(indicatif::ProgressDrawTarget::stderr());
        self.bar.enable_steady_tick(Duration::from_millis(100));
    }

    fn on_progress(&self, progress: &Progress) {
        self.bar.set_position(progress.bytes);
    }

    fn on_concurrency_changed(&self, target: usize, _reason: ConcurrencyReason) {
        self.bar.set_prefix(format!("x{target}"));
    }

    fn on_retry(&self, category: RetryCategory, delay: Duration, attempt: u32) {
        self.bar.println(format!(
            "   {} retry {attempt} in {:.1}s ({category})",
            style("->").yellow(),
            delay.as_secs_f64()
        ));
    }

    fn on_complete(&self, _outcome: &FetchOutcome) {
        self.bar.finish_and_clear();
    }
}

fn print_probe_table(probe: &ProbeReport) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Field".to_string(), "Value".to_string()]);
    table.add_row(vec!["Protocol".to_string(), probe.protocol.clone()]);
    if let Some(addr) = probe.peer_addr {
        table.add_row(vec!["Peer".to_string(), addr.to_string()]);
    }
    if let Some(server) = &probe.server {
        table.add_row(vec!["Server".to_string(), server.clone()]);
    }
    table.add_row(vec![
        "Latency".to_string(),
        format!("{:.1} ms", probe.latency.as_secs_f64() * 1000.0),
    ]);
    table.add_row(vec![
        "Size".to_string(),
        probe
            .content_length
            .map_or_else(|| "unknown".to_string(), format_bytes),
    ]);
    table.add_row(vec![
        "Range support".to_string(),
        probe.supports_range.to_string(),
    ]);
    if let Some(content_type) = &probe.content_type {
        table.add_row(vec!["Content type".to_string(), content_type.clone()]);
    }
    if let Some(etag) = &probe.etag {
        table.add_row(vec!["ETag".to_string(), etag.clone()]);
    }
    if probe.h3_advertised {
        table.add_row(vec!["Alt-Svc".to_string(), "h3 advertised".to_string()]);
    }
    if let Some(tls) = &probe.tls {
        table.add_row(vec!["TLS".to_string(), tls.version.clone()]);
        table.add_row(vec!["Cipher".to_string(), tls.cipher.clone()]);
        table.add_row(vec!["Issuer".to_string(), tls.issuer.clone()]);
        table.add_row(vec!["Expires".to_string(), tls.not_after.clone()]);
        table.add_row(vec![
            "Fingerprint".to_string(),
            tls.fingerprint_sha256.clone(),
        ]);
    }
    println!("{table}");

    if let Some(warning) = probe.tls.as_ref().and_then(|t| t.expiry_warning(30)) {
        println!("{} {warning}", style("!").yellow().bold());
    }
}

fn probe_json(probe: &ProbeReport) -> String {
    serde_json::json!({
        "protocol": probe.protocol,
        "peer": probe.peer_addr.map(|a| a.to_string()),
        "server": probe.server,
        "latency_ms": probe.latency.as_secs_f64() * 1000.0,
        "content_length": probe.content_length,
        "supports_range": probe.supports_range,
        "content_type": probe.content_type,
        "etag": probe.etag,
        "last_modified": probe.last_modified,
        "h3_advertised": probe.h3_advertised,
        "tls": probe.tls.as_ref().map(|t| serde_json::json!({
            "version": t.version,
            "cipher": t.cipher,
            "issuer": t.issuer,
            "not_after": t.not_after,
            "fingerprint_sha256": t.fingerprint_sha256,
        })),
    })
    .to_string()
}

fn outcome_json(outcome: &FetchOutcome) -> String {
    match outcome {
        Ok(report) => serde_json::json!({ "status": "success", "result": report }).to_string(),
        Err(failure) => serde_json::json!({ "status": "failure", "result": failure }).to_string(),
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
