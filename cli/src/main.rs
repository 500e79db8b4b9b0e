//! rtm - command-line client for the runtime manager
//!
//! Starts and inspects sessions, moves result artifacts and browses the
//! system catalog.

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};

/// rtm - run simulation systems through the runtime manager
#[derive(Parser)]
#[command(name = "rtm")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CLI for the runtime manager session API", long_about = None)]
struct Cli {
    /// Runtime manager URL
    #[arg(short, long, env = "RTM_API_URL", default_value = "http://127.0.0.1:8080")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a session
    Create {
        /// System as name:version
        system: String,

        /// SysCfg file; the system defaults are used without one
        #[arg(short, long)]
        syscfg: Option<PathBuf>,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,

        #[arg(short, long)]
        description: Option<String>,

        /// Run timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Poll until the session ends
        #[arg(short, long)]
        wait: bool,
    },

    /// Show a session record
    Get {
        session_id: String,
    },

    /// List sessions
    List {
        /// Only sessions in (or archived from) this state
        #[arg(short, long)]
        state: Option<String>,

        /// Only sessions created at or after this RFC 3339 time
        #[arg(long)]
        since: Option<String>,
    },

    /// Cancel a session
    Cancel {
        session_id: String,
    },

    /// List the result slots of a session
    Results {
        session_id: String,
    },

    /// Download the artifact of a result slot
    Download {
        session_id: String,
        slot: String,

        /// Local output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Push an artifact into a result slot of a running session
    Upload {
        session_id: String,
        slot: String,
        file: PathBuf,

        /// Result type; defaults to the slot's declared type
        #[arg(short = 't', long = "type")]
        result_type: Option<String>,
    },

    /// Real-time factor of a simulation_speed slot
    Rtf {
        session_id: String,
        slot: String,
    },

    /// List systems, or the versions of one
    Systems {
        name: Option<String>,
    },

    /// Print the default SysCfg of a system
    Syscfg {
        /// System as name:version
        system: String,
    },

    /// Register a SysDef file
    Register {
        file: PathBuf,
    },

    /// Get server health status
    Health,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    active_sessions: u64,
    systems: u64,
    runtime: String,
    runtime_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

struct ApiClient {
    client: Client,
    base: String,
}

impl ApiClient {
    fn new(api_url: &str) -> Self {
        Self {
            client: Client::new(),
            base: api_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base, path)
    }

    fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().context("Failed to send request")?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let text = response.text().unwrap_or_default();
        match serde_json::from_str::<ErrorResponse>(&text) {
            Ok(error) => anyhow::bail!("{} ({}): {}", error.error, status, error.message),
            Err(_) => anyhow::bail!("Request failed ({}): {}", status, text),
        }
    }

    fn get_json(&self, path: &str) -> Result<Value> {
        self.send(self.client.get(self.url(path)))?
            .json()
            .context("Failed to parse response")
    }
}

fn split_system(system: &str) -> Result<(&str, &str)> {
    system
        .split_once(':')
        .filter(|(name, version)| !name.is_empty() && !version.is_empty())
        .with_context(|| format!("Expected name:version, got '{}'", system))
}

fn colored_state(state: &str) -> ColoredString {
    match state {
        "succeeded" => state.green(),
        "failed" => state.red(),
        "cancelled" => state.yellow(),
        "running" | "provisioning" => state.bright_blue(),
        _ => state.normal(),
    }
}

fn is_terminal(state: &str) -> bool {
    matches!(state, "succeeded" | "failed" | "cancelled" | "archived")
}

/// RFC 3339 timestamp in local time; anything unparsable is shown as-is
fn format_timestamp(value: &Value) -> Option<String> {
    let raw = value.as_str()?;
    Some(match raw.parse::<DateTime<Utc>>() {
        Ok(time) => time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
        Err(_) => raw.to_string(),
    })
}

/// Wall-clock duration between two RFC 3339 timestamps
fn elapsed(start: &Value, end: &Value) -> Option<String> {
    let start: DateTime<Utc> = start.as_str()?.parse().ok()?;
    let end: DateTime<Utc> = end.as_str()?.parse().ok()?;
    let seconds = (end - start).num_seconds().max(0);
    Some(format!("{}m {:02}s", seconds / 60, seconds % 60))
}

fn print_record(record: &Value) {
    let state = record["state"].as_str().unwrap_or("?");
    println!("{}", "=".repeat(60).bright_blue());
    println!("{} {}", "Session:".bright_cyan(), record["id"].as_str().unwrap_or("?"));
    println!(
        "{} {}:{}",
        "System:".bright_cyan(),
        record["system"]["name"].as_str().unwrap_or("?"),
        record["system"]["version"].as_str().unwrap_or("?")
    );
    println!("{} {}", "State:".bright_cyan(), colored_state(state));
    if let Some(created) = format_timestamp(&record["created_at"]) {
        println!("{} {}", "Created:".bright_cyan(), created);
    }
    if let Some(finished) = format_timestamp(&record["finished_at"]) {
        println!("{} {}", "Finished:".bright_cyan(), finished);
    }
    if let Some(duration) = elapsed(&record["started_at"], &record["finished_at"]) {
        println!("{} {}", "Duration:".bright_cyan(), duration);
    }

    if let Some(outcome) = record.get("outcome").filter(|o| !o.is_null()) {
        if let Some(cause) = outcome["cause"].as_str() {
            println!("{} {}", "Cause:".bright_cyan(), cause.red());
        }
        if let Some(message) = outcome["message"].as_str() {
            println!("{} {}", "Message:".bright_cyan(), message);
        }
    }
    if let Some(code) = record["exit"]["code"].as_i64() {
        println!("{} {}", "Exit Code:".bright_cyan(), code);
    }

    if let Some(results) = record["results"].as_object().filter(|r| !r.is_empty()) {
        println!("\n{}", "RESULTS:".bright_green().bold());
        for (slot, artifact) in results {
            println!(
                "  {} {} ({} bytes)",
                slot,
                artifact["result_type"].as_str().unwrap_or("?"),
                artifact["size_bytes"]
            );
        }
    }

    if let Some(output) = record["output"].as_str().filter(|o| !o.is_empty()) {
        println!("\n{}", "OUTPUT:".bright_green().bold());
        println!("{}", output);
    }
    println!("{}", "=".repeat(60).bright_blue());
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = ApiClient::new(&cli.api_url);

    match cli.command {
        Commands::Create {
            system,
            syscfg,
            name,
            description,
            timeout,
            wait,
        } => {
            let (system_name, version) = split_system(&system)?;
            let syscfg: Option<Value> = match syscfg {
                Some(path) => {
                    let text = fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read SysCfg: {}", path.display()))?;
                    Some(serde_json::from_str(&text).context("SysCfg is not valid JSON")?)
                }
                None => None,
            };

            let request = json!({
                "system": { "name": system_name, "version": version },
                "syscfg": syscfg,
                "display_name": name,
                "description": description,
                "timeout_seconds": timeout,
            });

            let created: Value = api
                .send(api.client.post(api.url("/sessions")).json(&request))?
                .json()
                .context("Failed to parse response")?;
            let session_id = created["session_id"].as_str().context("Invalid response")?.to_string();
            println!("{} {}", "✓ Session created:".green(), session_id);

            if wait {
                let record = loop {
                    let record = api.get_json(&format!("/sessions/{}", session_id))?;
                    if is_terminal(record["state"].as_str().unwrap_or_default()) {
                        break record;
                    }
                    thread::sleep(Duration::from_secs(1));
                };
                print_record(&record);
            }
        }

        Commands::Get { session_id } => {
            let record = api.get_json(&format!("/sessions/{}", session_id))?;
            print_record(&record);
        }

        Commands::List { state, since } => {
            let mut query = Vec::new();
            if let Some(state) = state {
                query.push(("state", state));
            }
            if let Some(since) = since {
                query.push(("since", since));
            }

            let result: Value = api
                .send(api.client.get(api.url("/sessions")).query(&query))?
                .json()
                .context("Failed to parse response")?;
            let sessions = result["sessions"].as_array().context("Invalid response")?;

            println!("{}", "Sessions:".bright_cyan().bold());
            for session in sessions {
                let state = session["outcome"]
                    .as_str()
                    .or_else(|| session["state"].as_str())
                    .unwrap_or("?");
                println!(
                    "  {} {}:{} {} {}",
                    session["session_id"].as_str().unwrap_or("?"),
                    session["system"]["name"].as_str().unwrap_or("?"),
                    session["system"]["version"].as_str().unwrap_or("?"),
                    colored_state(state),
                    format_timestamp(&session["created_at"]).unwrap_or_default()
                );
            }
        }

        Commands::Cancel { session_id } => {
            let record: Value = api
                .send(api.client.delete(api.url(&format!("/sessions/{}", session_id))))?
                .json()
                .context("Failed to parse response")?;
            println!(
                "{} {}",
                "✓ Session cancelled:".green(),
                record["id"].as_str().unwrap_or(&session_id)
            );
        }

        Commands::Results { session_id } => {
            let result = api.get_json(&format!("/sessions/{}/results", session_id))?;
            let results = result["results"].as_array().context("Invalid response")?;

            println!("{}", "Result slots:".bright_cyan().bold());
            for slot in results {
                let status = if !slot["enabled"].as_bool().unwrap_or(false) {
                    "disabled".dimmed()
                } else if slot["artifact"].is_null() {
                    "empty".yellow()
                } else {
                    "filled".green()
                };
                println!(
                    "  {} [{}] {} {}",
                    slot["slot"].as_str().unwrap_or("?"),
                    slot["result_type"].as_str().unwrap_or("?"),
                    slot["path"].as_str().unwrap_or("?"),
                    status
                );
            }
        }

        Commands::Download {
            session_id,
            slot,
            output,
        } => {
            let response = api.send(
                api.client
                    .get(api.url(&format!("/sessions/{}/results/{}", session_id, slot))),
            )?;
            let content = response.bytes().context("Failed to read artifact")?;

            let output_path = output.unwrap_or_else(|| PathBuf::from(&slot));
            fs::write(&output_path, &content)
                .with_context(|| format!("Failed to write file: {}", output_path.display()))?;

            println!("{} {} ({} bytes)", "✓ Downloaded:".green(), output_path.display(), content.len());
        }

        Commands::Upload {
            session_id,
            slot,
            file,
            result_type,
        } => {
            let content = fs::read(&file)
                .with_context(|| format!("Failed to read file: {}", file.display()))?;

            let mut request = api
                .client
                .put(api.url(&format!("/sessions/{}/results/{}", session_id, slot)))
                .body(content);
            if let Some(result_type) = result_type {
                request = request.query(&[("type", result_type)]);
            }

            let stored: Value = api.send(request)?.json().context("Failed to parse response")?;
            println!("{} {}", "✓ Stored:".green(), stored["file_name"].as_str().unwrap_or(&slot));
            println!("{} {}", "  SHA-256:".cyan(), stored["sha256"].as_str().unwrap_or("?"));
        }

        Commands::Rtf { session_id, slot } => {
            let result = api.get_json(&format!("/sessions/{}/results/{}/rtf", session_id, slot))?;
            println!(
                "{} {}",
                "Real-time factor:".bright_cyan(),
                result["real_time_factor"]
            );
        }

        Commands::Systems { name } => {
            let path = match &name {
                Some(name) => format!("/systems/{}", name),
                None => "/systems".to_string(),
            };
            let result = api.get_json(&path)?;

            let entries = match result["systems"].as_array() {
                Some(systems) => systems.clone(),
                None => vec![result],
            };
            println!("{}", "Systems:".bright_cyan().bold());
            for entry in entries {
                let versions: Vec<&str> = entry["versions"]
                    .as_array()
                    .map(|v| v.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                println!("  {} {}", entry["name"].as_str().unwrap_or("?"), versions.join(", "));
            }
        }

        Commands::Syscfg { system } => {
            let (name, version) = split_system(&system)?;
            let syscfg = api.get_json(&format!("/systems/{}/{}/syscfg", name, version))?;
            println!("{}", serde_json::to_string_pretty(&syscfg)?);
        }

        Commands::Register { file } => {
            let text = fs::read_to_string(&file)
                .with_context(|| format!("Failed to read SysDef: {}", file.display()))?;
            let sysdef: Value = serde_json::from_str(&text).context("SysDef is not valid JSON")?;

            let system: Value = api
                .send(api.client.post(api.url("/systems")).json(&sysdef))?
                .json()
                .context("Failed to parse response")?;
            println!(
                "{} {}:{}",
                "✓ Registered:".green(),
                system["name"].as_str().unwrap_or("?"),
                system["version"].as_str().unwrap_or("?")
            );
        }

        Commands::Health => {
            let response = api.send(api.client.get(format!("{}/health", api.base)))?;
            let health: HealthResponse = response.json().context("Failed to parse response")?;

            println!("{}", "Runtime Manager Status".bright_cyan().bold());
            println!("{}", "=".repeat(40).bright_blue());
            println!(
                "{} {}",
                "Status:".cyan(),
                if health.status == "healthy" {
                    health.status.green()
                } else {
                    health.status.yellow()
                }
            );
            println!("{} {}", "Version:".cyan(), health.version);
            println!("{} {}s", "Uptime:".cyan(), health.uptime_seconds);
            println!("{} {}", "Active Sessions:".cyan(), health.active_sessions);
            println!("{} {}", "Systems:".cyan(), health.systems);
            println!(
                "{} {} {}",
                "Runtime:".cyan(),
                health.runtime,
                health.runtime_version.unwrap_or_else(|| "unavailable".into())
            );
        }
    }

    Ok(())
}
