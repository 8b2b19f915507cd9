mod logging;

use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use portlink::transport::native::{CommandSpawner, NativePortFactory, host_stdio_channel};
use portlink::{
    PeerOptions, RequestContext, RequestHandler, SerializedError, Session, SessionConfig,
    VersionInfo, serve,
};
use serde_json::{Value, json};

const USAGE: &str = "\
Usage:
  portlink probe [options] <program> [args...]
  portlink echo-host
  portlink version

Commands:
  probe        Spawn a native-messaging host, negotiate its version and invoke one action
  echo-host    Serve `echo` and `count` over stdin/stdout as a native-messaging host
  version      Print version information as JSON

Probe options:
  --peer <name>      Peer name used in logs [default: probe]
  --action <name>    Action to invoke after the handshake [default: none]
  --params <json>    Action parameters [default: {}]
  --timeout <ms>     Per-request timeout [default: PORTLINK_TIMEOUT_MS or 5000]";

#[derive(Debug, PartialEq)]
enum Command {
    Probe(ProbeArgs),
    EchoHost,
    Version,
}

#[derive(Debug, PartialEq)]
struct ProbeArgs {
    peer: String,
    program: String,
    args: Vec<String>,
    action: Option<String>,
    params: Value,
    timeout: Option<Duration>,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    logging::init_tracing();

    if let Err(e) = run(command) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let subcommand = args.get(1).ok_or("missing command")?;
    match subcommand.as_str() {
        "probe" => parse_probe(&args[2..]).map(Command::Probe),
        "echo-host" => Ok(Command::EchoHost),
        "version" => Ok(Command::Version),
        "--help" | "-h" => Err(String::new()),
        other => Err(format!("unknown command: {other}")),
    }
}

fn parse_probe(args: &[String]) -> Result<ProbeArgs, String> {
    let mut peer = "probe".to_string();
    let mut action = None;
    let mut params = json!({});
    let mut timeout = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--peer" => {
                i += 1;
                peer = args.get(i).ok_or("--peer requires a value")?.clone();
            }
            "--action" => {
                i += 1;
                action = Some(args.get(i).ok_or("--action requires a value")?.clone());
            }
            "--params" => {
                i += 1;
                let raw = args.get(i).ok_or("--params requires a value")?;
                params = serde_json::from_str(raw).map_err(|e| format!("invalid --params: {e}"))?;
            }
            "--timeout" => {
                i += 1;
                let raw = args.get(i).ok_or("--timeout requires a value")?;
                let ms: u64 = raw
                    .parse()
                    .map_err(|_| format!("invalid --timeout: {raw}"))?;
                timeout = Some(Duration::from_millis(ms));
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            program => {
                return Ok(ProbeArgs {
                    peer,
                    program: program.to_string(),
                    args: args[i + 1..].to_vec(),
                    action,
                    params,
                    timeout,
                });
            }
        }
        i += 1;
    }

    Err("missing required argument: <program>".to_string())
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Version => {
            println!("{}", serde_json::to_string(&VersionInfo::new())?);
            Ok(())
        }
        Command::Probe(args) => runtime()?.block_on(probe(args)),
        Command::EchoHost => {
            runtime()?.block_on(serve(
                host_stdio_channel("echo-host"),
                Arc::new(EchoHandler),
                PeerOptions::default(),
            ));
            Ok(())
        }
    }
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}

async fn probe(args: ProbeArgs) -> anyhow::Result<()> {
    let spawner = CommandSpawner::new(&args.program).args(args.args.iter().cloned());
    let mut config = SessionConfig::from_env(&args.peer);
    if let Some(timeout) = args.timeout {
        config = config.with_default_timeout(timeout);
    }
    let session = Session::new(config, Arc::new(NativePortFactory::command(spawner)));

    session
        .ensure_ready()
        .await
        .with_context(|| format!("handshake with {} failed", args.program))?;
    tracing::info!(peer = %args.peer, version = ?session.remote_version(), "Connected");

    let mut report = json!({ "version": session.remote_version() });
    if let Some(action) = args.action.as_deref() {
        let (sink, mut progress) = tokio::sync::mpsc::unbounded_channel();
        let outcome = session
            .invoke_with_progress(action, args.params.clone(), None, sink)
            .await;

        let mut events = Vec::new();
        while let Ok(event) = progress.try_recv() {
            events.push(Value::Array(event));
        }
        report["progress"] = Value::Array(events);

        session.disconnect().await;
        report["result"] = outcome.with_context(|| format!("{action} failed"))?;
    } else {
        session.disconnect().await;
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Reference native host: `echo` returns its params, `count` streams
/// `params.to` progress events before answering.
struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(
        &self,
        action: &str,
        params: Value,
        ctx: RequestContext,
    ) -> Result<Value, SerializedError> {
        match action {
            "echo" => Ok(params),
            "count" => {
                let to = params["to"].as_u64().unwrap_or(0);
                for index in 0..to {
                    ctx.progress(vec![json!({ "index": index, "count": to })])?;
                }
                Ok(json!(to))
            }
            other => Err(SerializedError::new(
                "UnknownAction",
                format!("unsupported action: {other}"),
            )),
        }
    }
}
