use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use futures::StreamExt;
use serde_json::{Map, Value};
use shared::protocol::{
    BusMessage, ConnectRequest, RpcResponse, CONNECTION_STATUS_TOPIC, CONNECT_TOPIC,
    RUN_TERMINAL_FUNCTION_TOPIC,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

#[derive(Parser, Debug)]
#[command(about = "Drive a running terminal bridge over HTTP")]
struct Cli {
    #[arg(long, env = "BRIDGE_URL", default_value = "http://127.0.0.1:8765")]
    server_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enable or disable terminal connectivity.
    #[command(group(ArgGroup::new("toggle").required(true).args(["enable", "disable"])))]
    Connect {
        #[arg(long)]
        enable: bool,
        #[arg(long)]
        disable: bool,
    },
    Status,
    /// Run a terminal function, e.g. `run GetWorksheet name=Watchlist`.
    Run {
        function: String,
        args: Vec<String>,
    },
    /// Print bus events as they are published.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let server_url = cli.server_url.trim_end_matches('/').to_string();

    match cli.command {
        Command::Connect { enable, .. } => {
            let body = serde_json::to_value(ConnectRequest { connect: enable })?;
            print_response(call(&server_url, CONNECT_TOPIC, &body).await?)?;
        }
        Command::Status => {
            let body = Value::Object(Map::new());
            print_response(call(&server_url, CONNECTION_STATUS_TOPIC, &body).await?)?;
        }
        Command::Run { function, args } => {
            let body = build_run_body(&function, &args)?;
            print_response(call(&server_url, RUN_TERMINAL_FUNCTION_TOPIC, &body).await?)?;
        }
        Command::Watch => watch(&server_url).await?,
    }
    Ok(())
}

async fn call(server_url: &str, topic: &str, body: &Value) -> Result<RpcResponse> {
    let url = format!("{server_url}/rpc/{topic}");
    debug!(%url, "posting rpc");
    let response = reqwest::Client::new()
        .post(&url)
        .json(body)
        .send()
        .await
        .with_context(|| format!("failed to reach bridge at {url}"))?;
    let status = response.status();
    let parsed = response
        .json::<RpcResponse>()
        .await
        .with_context(|| format!("bridge returned {status} without an rpc envelope"))?;
    Ok(parsed)
}

fn print_response(response: RpcResponse) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&response)?);
    if !response.status {
        bail!(response
            .message
            .unwrap_or_else(|| "request failed".to_string()));
    }
    Ok(())
}

/// `key=value` pairs become fields. Values are parsed as JSON when they can
/// be, and `securities` is split on commas.
fn build_run_body(function: &str, args: &[String]) -> Result<Value> {
    let mut body = Map::new();
    body.insert("function".into(), Value::String(function.to_string()));
    for arg in args {
        let (key, raw) = arg
            .split_once('=')
            .ok_or_else(|| anyhow!("expected key=value, got '{arg}'"))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("empty key in '{arg}'");
        }
        body.insert(key.to_string(), parse_value(key, raw));
    }
    Ok(Value::Object(body))
}

fn parse_value(key: &str, raw: &str) -> Value {
    if key == "securities" && !raw.trim_start().starts_with('[') {
        let tickers = raw
            .split(',')
            .map(str::trim)
            .filter(|ticker| !ticker.is_empty())
            .map(|ticker| Value::String(ticker.to_string()))
            .collect();
        return Value::Array(tickers);
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn ws_url(server_url: &str) -> Result<Url> {
    let mut url = Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => bail!("server url must be http:// or https://, got {other}://"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot switch {server_url} to {scheme}"))?;
    url.set_path("/ws");
    Ok(url)
}

async fn watch(server_url: &str) -> Result<()> {
    let url = ws_url(server_url)?;
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect websocket: {url}"))?;
    let (_, mut ws_reader) = ws_stream.split();
    eprintln!("watching {url}; ctrl-c to stop");

    while let Some(msg) = ws_reader.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<BusMessage>(&text) {
                Ok(message) => println!(
                    "{} {} {}",
                    message.published_at.to_rfc3339(),
                    message.topic,
                    message.payload
                ),
                Err(err) => warn!(%err, "unexpected frame from bridge"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => return Err(err).context("websocket stream failed"),
        }
    }
    Ok(())
}
