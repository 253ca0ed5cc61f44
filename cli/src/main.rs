use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://localhost:8080/api";

#[derive(Parser)]
#[command(name = "syncbridge-cli")]
#[command(author, version, about = "Dashboard client for the syncbridge API")]
#[command(after_help = "Examples:
  syncbridge-cli login s3cret
  syncbridge-cli connections create --name crm --kind bitrix24 --token abc
  syncbridge-cli mappings save --source 1 --target 2 --rule email:contact_email
  syncbridge-cli run 1 --file records.json
  syncbridge-cli logs --plan-id 1 --errors")]
struct Cli {
    /// API base URL [env: SYNCBRIDGE_API_URL]
    #[arg(long, value_name = "URL")]
    api_url: Option<String>,

    /// Emit raw JSON instead of tables
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store an API token for later requests
    Login {
        /// Bearer token configured on the server
        token: String,
    },
    /// Forget the stored API token
    Logout,
    /// Manage connections
    #[command(subcommand)]
    Connections(ConnectionCommand),
    /// Manage field mappings
    #[command(subcommand)]
    Mappings(MappingCommand),
    /// Manage webhooks
    #[command(subcommand)]
    Webhooks(WebhookCommand),
    /// Run a mapping plan over records from a JSON file
    Run {
        plan_id: u64,
        /// File containing a JSON array of records
        #[arg(long, short)]
        file: PathBuf,
    },
    /// Show sync logs
    Logs {
        #[arg(long)]
        plan_id: Option<u64>,
        /// RFC 3339 lower bound (inclusive)
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// RFC 3339 upper bound (inclusive)
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        /// Only runs with failures
        #[arg(long, conflicts_with = "ok")]
        errors: bool,
        /// Only runs without failures
        #[arg(long)]
        ok: bool,
    },
}

#[derive(Subcommand)]
enum ConnectionCommand {
    List,
    Create {
        #[arg(long)]
        name: String,
        /// bitrix24, facebook, hubspot or generic_http
        #[arg(long)]
        kind: String,
        /// Access token for the external system
        #[arg(long)]
        token: String,
        #[arg(long)]
        refresh_token: Option<String>,
    },
    /// Replace a connection's name, kind and credentials
    Update {
        id: u64,
        #[arg(long)]
        name: String,
        /// bitrix24, facebook, hubspot or generic_http
        #[arg(long)]
        kind: String,
        /// Access token for the external system
        #[arg(long)]
        token: String,
        #[arg(long)]
        refresh_token: Option<String>,
    },
    Disable {
        id: u64,
    },
    Enable {
        id: u64,
    },
    Delete {
        id: u64,
    },
}

#[derive(Subcommand)]
enum MappingCommand {
    List,
    Show {
        id: u64,
    },
    /// Save the rules for a connection pair
    Save {
        #[arg(long)]
        source: Option<u64>,
        #[arg(long)]
        target: Option<u64>,
        /// `source_field:target_field[:transform]`, repeatable
        #[arg(long = "rule", value_name = "RULE")]
        rules: Vec<String>,
        /// Read the whole request body from a JSON file instead
        #[arg(long, conflicts_with_all = ["source", "target", "rules"])]
        file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum WebhookCommand {
    List,
    Active,
    Deliveries,
    Create {
        #[arg(long)]
        url: String,
        /// Event kind, repeatable (sync.completed, sync.partial, mapping.saved,
        /// connection.disabled)
        #[arg(long = "event", required = true)]
        events: Vec<String>,
        #[arg(long)]
        secret: Option<String>,
        #[arg(long)]
        connection_id: Option<u64>,
    },
    Delete {
        id: u64,
    },
}

/// Error body returned by the server
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    kind: String,
    message: String,
    #[serde(default)]
    offending_rule: Option<Value>,
}

/// HTTP client for the `/api` surface
struct ApiClient {
    base: String,
    token: Option<String>,
    http: Client,
}

impl ApiClient {
    fn new(base: String, token: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            token,
            http,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn send(&self, builder: RequestBuilder) -> Result<Value> {
        let response = builder.send().context("Request to syncbridge failed")?;
        let status = response.status();
        let text = response.text().context("Failed to read response body")?;

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).context("Server returned invalid JSON");
        }

        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => {
                let mut message = format!("{} ({}): {}", status, body.error.kind, body.error.message);
                if let Some(rule) = body.error.offending_rule {
                    message.push_str(&format!("\n  offending rule: {}", rule));
                }
                bail!(message)
            }
            Err(_) => bail!("{}: {}", status, text),
        }
    }

    fn get(&self, path: &str) -> Result<Value> {
        self.send(self.request(Method::GET, path))
    }

    fn get_query(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        self.send(self.request(Method::GET, path).query(query))
    }

    fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(self.request(Method::POST, path).json(body))
    }

    fn put(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(self.request(Method::PUT, path).json(body))
    }

    fn delete(&self, path: &str) -> Result<Value> {
        self.send(self.request(Method::DELETE, path))
    }
}

fn token_file() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".syncbridge").join("token"))
}

/// `SYNCBRIDGE_TOKEN` wins over the stored token.
fn load_token() -> Option<String> {
    if let Ok(token) = env::var("SYNCBRIDGE_TOKEN") {
        if !token.trim().is_empty() {
            return Some(token.trim().to_string());
        }
    }
    let path = token_file().ok()?;
    fs::read_to_string(path)
        .ok()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn save_token(token: &str) -> Result<PathBuf> {
    let path = token_file()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    write_private(&path, token).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Write `contents` readable by the owner only.
#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies on create
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(contents.as_bytes())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    fs::write(path, contents)
}

fn connection_body(name: String, kind: String, token: String, refresh_token: Option<String>) -> Value {
    let mut credentials = json!({ "access_token": token });
    if let Some(refresh) = refresh_token {
        credentials["refresh_token"] = json!(refresh);
    }
    json!({ "name": name, "kind": kind, "credentials": credentials })
}

fn read_json_file(path: &Path) -> Result<Value> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path.display()))
}

/// Parse `source:target[:transform]`. The transform may itself contain
/// colons, e.g. `date:day:date-format:%d.%m.%Y`.
fn parse_rule(raw: &str) -> Result<Value> {
    let mut parts = raw.splitn(3, ':');
    let source = parts.next().unwrap_or_default().trim();
    let target = parts.next().unwrap_or_default().trim();
    if source.is_empty() || target.is_empty() {
        bail!("rule '{}' must look like source_field:target_field[:transform]", raw);
    }
    let mut rule = json!({ "source_field": source, "target_field": target });
    if let Some(transform) = parts.next().filter(|t| !t.is_empty()) {
        rule["transform"] = json!(transform);
    }
    Ok(rule)
}

fn data_array(response: &Value) -> &[Value] {
    response["data"].as_array().map(Vec::as_slice).unwrap_or(&[])
}

fn show_time(value: &Value) -> String {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn colored_status(status: &str) -> ColoredString {
    match status {
        "active" | "success" | "DELIVERED" => status.green(),
        "disabled" | "suspended" | "partial" | "FAILED" | "PENDING" | "DELIVERING" => {
            status.yellow()
        }
        _ => status.red(),
    }
}

fn print_connections(response: &Value) {
    let items = data_array(response);
    if items.is_empty() {
        println!("{}", "No connections.".dimmed());
        return;
    }
    println!(
        "{}",
        format!("{:<5} {:<24} {:<14} {:<10}", "ID", "NAME", "KIND", "STATUS").bold()
    );
    for c in items {
        println!(
            "{:<5} {:<24} {:<14} {}",
            c["id"],
            c["name"].as_str().unwrap_or("-"),
            c["kind"].as_str().unwrap_or("-"),
            colored_status(c["status"].as_str().unwrap_or("-"))
        );
    }
}

fn print_mappings(response: &Value) {
    let items = data_array(response);
    if items.is_empty() {
        println!("{}", "No mappings.".dimmed());
        return;
    }
    for plan in items {
        print_plan(plan);
    }
}

fn print_plan(plan: &Value) {
    println!(
        "{} {} (v{}) {} -> {} {}",
        "Plan".bold(),
        plan["id"],
        plan["version"],
        plan["source_connection_id"],
        plan["target_connection_id"],
        colored_status(plan["status"].as_str().unwrap_or("-"))
    );
    for rule in plan["rules"].as_array().map(Vec::as_slice).unwrap_or(&[]) {
        let transform = rule["transform"]
            .as_str()
            .map(|t| format!(" [{}]", t))
            .unwrap_or_default();
        println!(
            "    {} -> {}{}",
            rule["source_field"].as_str().unwrap_or("?"),
            rule["target_field"].as_str().unwrap_or("?"),
            transform.cyan()
        );
    }
}

fn print_webhooks(response: &Value) {
    let items = data_array(response);
    if items.is_empty() {
        println!("{}", "No webhooks.".dimmed());
        return;
    }
    for hook in items {
        let events: Vec<&str> = hook["events"]
            .as_array()
            .map(|e| e.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let state = if hook["enabled"].as_bool().unwrap_or(false) {
            "enabled".green()
        } else {
            "disabled".yellow()
        };
        println!(
            "{:<5} {} {} [{}]",
            hook["id"],
            state,
            hook["url"].as_str().unwrap_or("-"),
            events.join(", ")
        );
    }
}

fn print_deliveries(response: &Value) {
    let items = data_array(response);
    if items.is_empty() {
        println!("{}", "No deliveries.".dimmed());
        return;
    }
    for d in items {
        println!(
            "{} webhook {} {:<20} {} attempts={} {}",
            show_time(&d["updated_at"]),
            d["webhook_id"],
            d["event"].as_str().unwrap_or("-"),
            colored_status(d["state"].as_str().unwrap_or("-")),
            d["attempts"],
            d["last_error"].as_str().unwrap_or("").dimmed()
        );
    }
}

fn log_status(entry: &Value) -> &'static str {
    if entry["partial"].as_bool().unwrap_or(false) {
        "partial"
    } else if entry["failure_count"].as_u64().unwrap_or(0) > 0 || entry["error"].is_string() {
        "error"
    } else {
        "success"
    }
}

fn print_logs(response: &Value) {
    let items = data_array(response);
    if items.is_empty() {
        println!("{}", "No sync logs.".dimmed());
        return;
    }
    for entry in items {
        println!(
            "{} plan {} v{} {:<8} {}/{} ok, {} failed",
            show_time(&entry["timestamp"]),
            entry["plan_id"],
            entry["plan_version"],
            colored_status(log_status(entry)),
            entry["success_count"],
            entry["record_count"],
            entry["failure_count"]
        );
        if let Some(error) = entry["error"].as_str() {
            println!("    {}", error.dimmed());
        }
    }
}

fn print_run(response: &Value) {
    let entry = &response["data"]["entry"];
    println!(
        "{} plan {}: {}/{} records mapped, {} failed",
        colored_status(log_status(entry)),
        entry["plan_id"],
        entry["success_count"],
        entry["record_count"],
        entry["failure_count"]
    );
    for failure in response["data"]["failures"]
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or(&[])
    {
        println!(
            "    record {}: {}",
            failure["record_index"],
            failure["reason"].as_str().unwrap_or("?").red()
        );
    }
}

fn output(json_mode: bool, response: &Value, render: fn(&Value)) -> Result<()> {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(response)?);
    } else {
        render(response);
    }
    Ok(())
}

fn done(json_mode: bool, response: &Value, message: String) -> Result<()> {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(response)?);
    } else {
        println!("{} {}", "✓".green(), message);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Login { token } => {
            let path = save_token(token)?;
            println!("{} Token saved to {}", "✓".green(), path.display());
            return Ok(());
        }
        Commands::Logout => {
            let path = token_file()?;
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
            println!("{} Logged out", "✓".green());
            return Ok(());
        }
        _ => {}
    }

    let base = cli
        .api_url
        .clone()
        .or_else(|| env::var("SYNCBRIDGE_API_URL").ok())
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());
    let api = ApiClient::new(base, load_token())?;
    let json_mode = cli.json;

    match cli.command {
        Commands::Login { .. } | Commands::Logout => unreachable!("handled above"),

        Commands::Connections(cmd) => match cmd {
            ConnectionCommand::List => output(json_mode, &api.get("/connections")?, print_connections),
            ConnectionCommand::Create {
                name,
                kind,
                token,
                refresh_token,
            } => {
                let response = api.post(
                    "/connections",
                    &connection_body(name, kind, token, refresh_token),
                )?;
                done(
                    json_mode,
                    &response,
                    format!("Created connection {}", response["data"]["id"]),
                )
            }
            ConnectionCommand::Update {
                id,
                name,
                kind,
                token,
                refresh_token,
            } => {
                let response = api.put(
                    &format!("/connections/{}", id),
                    &connection_body(name, kind, token, refresh_token),
                )?;
                done(json_mode, &response, format!("Updated connection {}", id))
            }
            ConnectionCommand::Disable { id } => {
                let response = api.post(&format!("/connections/{}/disable", id), &json!({}))?;
                let suspended = response["suspended_plans"].to_string();
                done(
                    json_mode,
                    &response,
                    format!("Disabled connection {} (suspended plans: {})", id, suspended),
                )
            }
            ConnectionCommand::Enable { id } => {
                let response = api.post(&format!("/connections/{}/enable", id), &json!({}))?;
                done(json_mode, &response, format!("Enabled connection {}", id))
            }
            ConnectionCommand::Delete { id } => {
                let response = api.delete(&format!("/connections/{}", id))?;
                done(json_mode, &response, format!("Deleted connection {}", id))
            }
        },

        Commands::Mappings(cmd) => match cmd {
            MappingCommand::List => output(json_mode, &api.get("/mappings")?, print_mappings),
            MappingCommand::Show { id } => {
                let response = api.get(&format!("/mappings/{}", id))?;
                output(json_mode, &response, |r| print_plan(&r["data"]))
            }
            MappingCommand::Save {
                source,
                target,
                rules,
                file,
            } => {
                let body = match file {
                    Some(path) => read_json_file(&path)?,
                    None => {
                        let (Some(source), Some(target)) = (source, target) else {
                            bail!("--source and --target are required without --file");
                        };
                        let rules = rules
                            .iter()
                            .map(|r| parse_rule(r))
                            .collect::<Result<Vec<_>>>()?;
                        json!({
                            "source_connection_id": source,
                            "target_connection_id": target,
                            "rules": rules,
                        })
                    }
                };
                let response = api.post("/mappings", &body)?;
                done(
                    json_mode,
                    &response,
                    format!(
                        "Saved plan {} (version {})",
                        response["data"]["id"], response["data"]["version"]
                    ),
                )
            }
        },

        Commands::Webhooks(cmd) => match cmd {
            WebhookCommand::List => output(json_mode, &api.get("/webhooks")?, print_webhooks),
            WebhookCommand::Active => {
                output(json_mode, &api.get("/webhooks/active")?, print_webhooks)
            }
            WebhookCommand::Deliveries => output(
                json_mode,
                &api.get("/webhooks/deliveries")?,
                print_deliveries,
            ),
            WebhookCommand::Create {
                url,
                events,
                secret,
                connection_id,
            } => {
                let mut body = json!({ "url": url, "events": events });
                if let Some(secret) = secret {
                    body["secret"] = json!(secret);
                }
                if let Some(id) = connection_id {
                    body["connection_id"] = json!(id);
                }
                let response = api.post("/webhooks", &body)?;
                if !json_mode {
                    println!(
                        "{} Created webhook {}",
                        "✓".green(),
                        response["data"]["id"]
                    );
                    println!(
                        "  signing secret: {} {}",
                        response["data"]["secret"].as_str().unwrap_or("-").bold(),
                        "(shown once)".dimmed()
                    );
                    return Ok(());
                }
                output(json_mode, &response, |_| {})
            }
            WebhookCommand::Delete { id } => {
                let response = api.delete(&format!("/webhooks/{}", id))?;
                done(json_mode, &response, format!("Deleted webhook {}", id))
            }
        },

        Commands::Run { plan_id, file } => {
            let records = read_json_file(&file)?;
            if !records.is_array() {
                bail!("{} must contain a JSON array of records", file.display());
            }
            let response = api.post(
                &format!("/sync/{}/run", plan_id),
                &json!({ "records": records }),
            )?;
            output(json_mode, &response, print_run)
        }

        Commands::Logs {
            plan_id,
            since,
            until,
            errors,
            ok,
        } => {
            let mut query: Vec<(&str, String)> = Vec::new();
            if let Some(id) = plan_id {
                query.push(("plan_id", id.to_string()));
            }
            if let Some(since) = since {
                query.push(("since", since.to_rfc3339()));
            }
            if let Some(until) = until {
                query.push(("until", until.to_rfc3339()));
            }
            if errors {
                query.push(("has_error", "true".to_string()));
            } else if ok {
                query.push(("has_error", "false".to_string()));
            }
            output(json_mode, &api.get_query("/sync/logs", &query)?, print_logs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rule() {
        let rule = parse_rule("email:contact_email").unwrap();
        assert_eq!(rule["source_field"], "email");
        assert_eq!(rule["target_field"], "contact_email");
        assert!(rule.get("transform").is_none());

        let rule = parse_rule("born:birthday:date-format:%d.%m.%Y").unwrap();
        assert_eq!(rule["transform"], "date-format:%d.%m.%Y");

        assert!(parse_rule("email").is_err());
        assert!(parse_rule(":x").is_err());
    }

    #[test]
    fn test_log_status() {
        assert_eq!(log_status(&json!({"failure_count": 0})), "success");
        assert_eq!(log_status(&json!({"failure_count": 2})), "error");
        assert_eq!(
            log_status(&json!({"failure_count": 0, "partial": true})),
            "partial"
        );
    }

    #[test]
    fn test_client_trims_base() {
        let client = ApiClient::new("http://localhost:8080/api/".to_string(), None).unwrap();
        assert_eq!(client.base, "http://localhost:8080/api");
    }

    #[test]
    fn test_connection_body() {
        let body = connection_body("crm".into(), "hubspot".into(), "t".into(), None);
        assert_eq!(body["credentials"]["access_token"], "t");
        assert!(body["credentials"].get("refresh_token").is_none());

        let body = connection_body("crm".into(), "hubspot".into(), "t".into(), Some("r".into()));
        assert_eq!(body["credentials"]["refresh_token"], "r");
        assert_eq!(body["kind"], "hubspot");
    }

    #[test]
    fn test_update_command_parses() {
        let cli = Cli::try_parse_from([
            "syncbridge-cli",
            "connections",
            "update",
            "4",
            "--name",
            "crm",
            "--kind",
            "bitrix24",
            "--token",
            "t",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Connections(ConnectionCommand::Update { id: 4, .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_token_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        fs::write(&path, "old").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        write_private(&path, "s3cret").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(fs::read_to_string(&path).unwrap(), "s3cret");
    }

    #[test]
    fn test_data_array_handles_missing() {
        assert!(data_array(&json!({})).is_empty());
        assert_eq!(data_array(&json!({"data": [1, 2]})).len(), 2);
    }
}
