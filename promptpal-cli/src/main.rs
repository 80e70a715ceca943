//! promptpal-cli: operator client for the PromptPal HTTP API
//!
//! # Subcommands
//! - `status`                                   server health and version
//! - `projects [--limit N] [--cursor ID]`       list projects (admin token)
//! - `prompts [--project ID] [--public]`        list prompts
//! - `run <prompt-id> --project ID -v k=v ...`  run a prompt via the public API
//! - `top <project-id>`                         most called prompts, last 7 days
//!
//! Admin calls send `Authorization: Bearer <token>`; public calls send
//! `Authorization: API <token>` when an API token is given.

use std::collections::HashMap;

use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const DEFAULT_SERVER: &str = "http://127.0.0.1:7788";
const DEFAULT_LIMIT: i64 = 20;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "promptpal-cli", version, about = "PromptPal operator CLI")]
struct Cli {
    /// PromptPal HTTP server URL
    #[arg(long, env = "PROMPTPAL_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Session token from /api/v1/auth/login, for admin commands
    #[arg(long, env = "PROMPTPAL_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Public API token, for `run` and `prompts --public`
    #[arg(long, env = "PROMPTPAL_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    /// Print raw JSON instead of a table
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show server health and version
    Status,

    /// List projects
    Projects {
        #[arg(short = 'n', long, default_value_t = DEFAULT_LIMIT)]
        limit: i64,

        /// Only ids below this one
        #[arg(long)]
        cursor: Option<i64>,
    },

    /// List prompts
    Prompts {
        /// Only prompts of this project
        #[arg(long, conflicts_with = "public")]
        project: Option<i64>,

        /// List public prompts through the public API
        #[arg(long)]
        public: bool,

        #[arg(short = 'n', long, default_value_t = DEFAULT_LIMIT)]
        limit: i64,

        #[arg(long)]
        cursor: Option<i64>,
    },

    /// Run a saved prompt
    Run {
        prompt_id: i64,

        #[arg(long)]
        project: i64,

        /// Variable binding, repeatable
        #[arg(short = 'v', long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },

    /// Top prompts of a project by call count over the last 7 days
    Top { project_id: i64 },
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize, Serialize)]
pub struct ListResponse<T> {
    pub count: i64,
    pub data: Vec<T>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    #[serde(rename = "openAIModel")]
    pub openai_model: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptSummary {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub public_level: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TopEntry {
    pub prompt: PromptSummary,
    pub count: i64,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub message: String,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub total_tokens: i32,
    pub duration_ms: i64,
    pub model: String,
}

/// Error body returned by the server for every failure.
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    pub code: u16,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunRequest {
    project_id: i64,
    variables: HashMap<String, String>,
}

// ============================================================================
// Formatting
// ============================================================================

/// Parse a `name=value` binding. The value may itself contain `=`.
pub fn parse_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{}'", s)),
    }
}

/// `{server}{path}?cursor=..&limit=..`, omitting an absent cursor.
pub fn list_url(server: &str, path: &str, cursor: Option<i64>, limit: i64) -> String {
    match cursor {
        Some(c) => format!("{}{}?cursor={}&limit={}", server, path, c, limit),
        None => format!("{}{}?limit={}", server, path, limit),
    }
}

pub fn project_line(p: &ProjectSummary) -> String {
    let state = if p.enabled { "enabled" } else { "disabled" };
    format!("{:>6}  {:<24}  {:<8}  {}", p.id, p.name, state, p.openai_model)
}

pub fn prompt_line(p: &PromptSummary) -> String {
    format!(
        "{:>6}  {:<24}  project {:<6}  {}",
        p.id, p.name, p.project_id, p.public_level
    )
}

pub fn top_line(rank: usize, e: &TopEntry) -> String {
    format!("{:>2}. {:<24} {:>6} calls  (#{})", rank, e.prompt.name, e.count, e.prompt.id)
}

/// Turn a non-success response body into a readable message.
pub fn describe_failure(status: u16, body: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(e) => format!("server returned {}: {}", e.code, e.error),
        Err(_) if body.trim().is_empty() => format!("server returned {}", status),
        Err(_) => format!("server returned {}: {}", status, body.trim()),
    }
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

struct Client {
    http: reqwest::blocking::Client,
    server: String,
    token: Option<String>,
    api_token: Option<String>,
}

enum Auth {
    Session,
    Api,
}

impl Client {
    fn new(server: &str, token: Option<String>, api_token: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()?;
        Ok(Self {
            http,
            server: server.trim_end_matches('/').to_string(),
            token,
            api_token,
        })
    }

    fn authorize(
        &self,
        req: reqwest::blocking::RequestBuilder,
        auth: Auth,
    ) -> anyhow::Result<reqwest::blocking::RequestBuilder> {
        Ok(match auth {
            Auth::Session => {
                let token = self.token.as_deref().ok_or_else(|| {
                    anyhow::anyhow!("this command needs --token or PROMPTPAL_TOKEN")
                })?;
                req.bearer_auth(token)
            }
            Auth::Api => match self.api_token.as_deref() {
                Some(t) => req.header(reqwest::header::AUTHORIZATION, format!("API {}", t)),
                None => req,
            },
        })
    }

    fn send<T: DeserializeOwned>(
        &self,
        req: reqwest::blocking::RequestBuilder,
    ) -> anyhow::Result<T> {
        let resp = req
            .send()
            .map_err(|e| anyhow::anyhow!("connection failed to {}: {}", self.server, e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            anyhow::bail!(describe_failure(status.as_u16(), &body));
        }
        Ok(resp.json()?)
    }

    fn get<T: DeserializeOwned>(&self, url: &str, auth: Auth) -> anyhow::Result<T> {
        let req = self.authorize(self.http.get(url), auth)?;
        self.send(req)
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn do_status(client: &Client) -> anyhow::Result<()> {
    let url = format!("{}/health", client.server);
    let resp = client
        .http
        .get(&url)
        .send()
        .map_err(|e| anyhow::anyhow!("cannot reach {}: {}", url, e))?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().unwrap_or_default();

    if !status.is_success() {
        anyhow::bail!(
            "server unhealthy (HTTP {}): {}",
            status,
            body["error"].as_str().unwrap_or("?")
        );
    }

    println!("PromptPal server: {}", body["status"].as_str().unwrap_or("unknown"));
    println!("Version:          {}", body["version"].as_str().unwrap_or("?"));
    println!("Storage:          {}", body["storage"].as_str().unwrap_or("?"));
    Ok(())
}

fn do_projects(client: &Client, cursor: Option<i64>, limit: i64, json: bool) -> anyhow::Result<()> {
    let url = list_url(&client.server, "/api/v1/admin/projects", cursor, limit);
    let list: ListResponse<ProjectSummary> = client.get(&url, Auth::Session)?;
    if json {
        return print_json(&list);
    }
    for p in &list.data {
        println!("{}", project_line(p));
    }
    eprintln!("{} of {} projects", list.data.len(), list.count);
    Ok(())
}

fn do_prompts(
    client: &Client,
    project: Option<i64>,
    public: bool,
    cursor: Option<i64>,
    limit: i64,
    json: bool,
) -> anyhow::Result<()> {
    let (path, auth) = match (project, public) {
        (_, true) => ("/api/v1/public/prompts".to_string(), Auth::Api),
        (Some(id), false) => (format!("/api/v1/admin/projects/{}/prompts", id), Auth::Session),
        (None, false) => ("/api/v1/admin/prompts".to_string(), Auth::Session),
    };
    let url = list_url(&client.server, &path, cursor, limit);
    let list: ListResponse<PromptSummary> = client.get(&url, auth)?;
    if json {
        return print_json(&list);
    }
    for p in &list.data {
        println!("{}", prompt_line(p));
    }
    eprintln!("{} of {} prompts", list.data.len(), list.count);
    Ok(())
}

fn do_run(
    client: &Client,
    prompt_id: i64,
    project_id: i64,
    vars: Vec<(String, String)>,
    json: bool,
) -> anyhow::Result<()> {
    let url = format!("{}/api/v1/public/prompts/run/{}", client.server, prompt_id);
    let body = RunRequest {
        project_id,
        variables: vars.into_iter().collect(),
    };
    let req = client.authorize(client.http.post(&url).json(&body), Auth::Api)?;
    let result: RunResult = client.send(req)?;
    if json {
        return print_json(&result);
    }
    println!("{}", result.message);
    eprintln!(
        "[{}] {} tokens ({} prompt, {} completion) in {} ms",
        result.model,
        result.total_tokens,
        result.prompt_tokens,
        result.completion_tokens,
        result.duration_ms
    );
    Ok(())
}

fn do_top(client: &Client, project_id: i64, json: bool) -> anyhow::Result<()> {
    let url = format!("{}/api/v1/admin/projects/{}/top-prompts", client.server, project_id);
    let list: ListResponse<TopEntry> = client.get(&url, Auth::Session)?;
    if json {
        return print_json(&list);
    }
    if list.data.is_empty() {
        eprintln!("No calls in the last 7 days for project {}", project_id);
        return Ok(());
    }
    for (i, e) in list.data.iter().enumerate() {
        println!("{}", top_line(i + 1, e));
    }
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();

    let result = Client::new(&cli.server, cli.token, cli.api_token).and_then(|client| {
        match cli.command {
            Commands::Status => do_status(&client),
            Commands::Projects { limit, cursor } => do_projects(&client, cursor, limit, cli.json),
            Commands::Prompts {
                project,
                public,
                limit,
                cursor,
            } => do_prompts(&client, project, public, cursor, limit, cli.json),
            Commands::Run {
                prompt_id,
                project,
                vars,
            } => do_run(&client, prompt_id, project, vars, cli.json),
            Commands::Top { project_id } => do_top(&client, project_id, cli.json),
        }
    });

    if let Err(e) = result {
        eprintln!("promptpal-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
