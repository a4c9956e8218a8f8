//! concierge-cli — operator frontend for the Concierge HTTP API
//!
//! # Subcommands
//! - `status`                                      — server health
//! - `context <key>`                               — dump a stored context
//! - `history <session> [-n <limit>]`              — recent turns for a session
//! - `contexts`                                    — list known context keys
//! - `forget <key>`                                — delete a context
//! - `tool <name> --session <id> [--params <json>]` — run a booking tool directly
//! - `verify <token>`                              — check a staff token

use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8770";
const DEFAULT_LIMIT: usize = 20;
const PREVIEW_CHARS: usize = 120;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "concierge-cli", version, about = "Concierge context server operator CLI")]
struct Cli {
    /// Concierge HTTP server URL (overrides CONCIERGE_HTTP_URL env var)
    #[arg(long, env = "CONCIERGE_HTTP_URL", default_value = DEFAULT_SERVER, global = true)]
    server: String,

    /// Print raw JSON responses instead of formatted text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show server status
    Status,

    /// Show the stored context for a session or customer key
    Context { key: String },

    /// Show recent conversation turns
    History {
        session: String,

        /// Number of most recent turns to show
        #[arg(short = 'n', long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,
    },

    /// List context keys held by the server
    Contexts,

    /// Delete a stored context
    Forget { key: String },

    /// Invoke a booking tool against a session's context
    Tool {
        name: String,

        #[arg(long)]
        session: String,

        /// Tool parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
    },

    /// Verify a signed staff token
    Verify { token: String },
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryResponse {
    pub total: usize,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSummary {
    pub key: String,
    pub last_updated: String,
    #[serde(default)]
    pub durable: bool,
}

#[derive(Debug, Deserialize)]
pub struct ContextsResponse {
    pub count: usize,
    pub contexts: Vec<ContextSummary>,
}

// ============================================================================
// Formatting
// ============================================================================

/// One history line: `[role] content`, content flattened and capped.
pub fn format_turn(turn: &HistoryEntry) -> String {
    let flat = turn.content.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut preview: String = flat.chars().take(PREVIEW_CHARS).collect();
    if flat.chars().count() > PREVIEW_CHARS {
        preview.push_str("...");
    }
    match &turn.timestamp {
        Some(ts) => format!("{} [{}] {}", ts, turn.role, preview),
        None => format!("[{}] {}", turn.role, preview),
    }
}

pub fn format_summary(summary: &ContextSummary) -> String {
    let tier = if summary.durable { "durable" } else { "volatile" };
    format!("{:<40} {:<9} {}", summary.key, tier, summary.last_updated)
}

/// Tool parameters must be a JSON object.
pub fn parse_params(raw: &str) -> anyhow::Result<Value> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| anyhow::anyhow!("--params is not valid JSON: {}", e))?;
    if !value.is_object() {
        anyhow::bail!("--params must be a JSON object");
    }
    Ok(value)
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

struct Api {
    server: String,
    client: reqwest::blocking::Client,
}

impl Api {
    fn new(server: &str) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            server: server.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server, path)
    }

    /// Send a request; non-2xx responses become errors carrying the server's message.
    fn call(&self, req: reqwest::blocking::RequestBuilder) -> anyhow::Result<Value> {
        let resp = req
            .send()
            .map_err(|e| anyhow::anyhow!("cannot reach {}: {}", self.server, e))?;
        let status = resp.status();
        let body: Value = resp.json().unwrap_or(Value::Null);
        if !status.is_success() {
            let msg = body["error"].as_str().unwrap_or("no details");
            anyhow::bail!("server returned {}: {}", status, msg);
        }
        Ok(body)
    }

    fn get(&self, path: &str) -> anyhow::Result<Value> {
        self.call(self.client.get(self.url(path)))
    }

    fn post(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        self.call(self.client.post(self.url(path)).json(body))
    }

    fn delete(&self, path: &str) -> anyhow::Result<Value> {
        self.call(self.client.delete(self.url(path)))
    }
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn do_status(api: &Api, json: bool) -> anyhow::Result<()> {
    let body = api.get("/health")?;
    if json {
        return print_json(&body);
    }
    println!("Concierge server: {}", body["status"].as_str().unwrap_or("unknown"));
    println!("Version:          {}", body["version"].as_str().unwrap_or("?"));
    println!("Connections:      {}", body["connections"]);
    println!("Durable tier:     {}", body["durable"].as_str().unwrap_or("?"));
    println!("Uptime:           {}s", body["uptimeSeconds"]);
    Ok(())
}

fn do_context(api: &Api, key: &str) -> anyhow::Result<()> {
    let body = api.get(&format!("/api/context/{}", key))?;
    print_json(&body["context"])
}

fn do_history(api: &Api, session: &str, limit: usize, json: bool) -> anyhow::Result<()> {
    let body = api.get(&format!("/api/history/{}?limit={}", session, limit))?;
    if json {
        return print_json(&body);
    }
    let resp: HistoryResponse = serde_json::from_value(body)?;
    if resp.history.is_empty() {
        eprintln!("No history for: {}", session);
        return Ok(());
    }
    for turn in &resp.history {
        println!("{}", format_turn(turn));
    }
    println!("({} of {} turns)", resp.history.len(), resp.total);
    Ok(())
}

fn do_contexts(api: &Api, json: bool) -> anyhow::Result<()> {
    let body = api.get("/api/contexts")?;
    if json {
        return print_json(&body);
    }
    let resp: ContextsResponse = serde_json::from_value(body)?;
    for summary in &resp.contexts {
        println!("{}", format_summary(summary));
    }
    println!("{} context(s)", resp.count);
    Ok(())
}

fn do_forget(api: &Api, key: &str) -> anyhow::Result<()> {
    api.delete(&format!("/api/context/{}", key))?;
    println!("Deleted context {}", key);
    Ok(())
}

fn do_tool(api: &Api, name: &str, session: &str, params: &str) -> anyhow::Result<()> {
    let params = parse_params(params)?;
    let body = api.post(
        "/api/tools",
        &serde_json::json!({ "tool": name, "params": params, "sessionId": session }),
    )?;
    print_json(&body["result"])
}

fn do_verify(api: &Api, token: &str, json: bool) -> anyhow::Result<()> {
    let body = api.post("/api/verify-token", &serde_json::json!({ "token": token }))?;
    if json {
        return print_json(&body);
    }
    if body["isValid"].as_bool().unwrap_or(false) {
        println!("Token valid");
        print_json(&body["decoded"])
    } else {
        anyhow::bail!(
            "token rejected: {}",
            body["error"].as_str().unwrap_or("unknown reason")
        )
    }
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();

    let result = Api::new(&cli.server).and_then(|api| match &cli.command {
        Commands::Status => do_status(&api, cli.json),
        Commands::Context { key } => do_context(&api, key),
        Commands::History { session, limit } => do_history(&api, session, *limit, cli.json),
        Commands::Contexts => do_contexts(&api, cli.json),
        Commands::Forget { key } => do_forget(&api, key),
        Commands::Tool { name, session, params } => do_tool(&api, name, session, params),
        Commands::Verify { token } => do_verify(&api, token, cli.json),
    });

    if let Err(e) = result {
        eprintln!("concierge-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
