#[macro_use] extern crate clap;

use clap::{App, ArgMatches};
use env_logger::{from_env, Env};
use podvisor::{Context, ContainerRequest, SandboxRequest, Server, ServerConfig, ServerError};
use serde_json::{json, Value};
use std::{fs, path::Path, time::Duration};

#[tokio::main]
async fn main() {
    let yaml = load_yaml!("cli.yml");
    let matches = App::from_yaml(yaml).get_matches();

    let log_level = matches.value_of("log_level").unwrap_or("info");
    from_env(Env::default().default_filter_or(log_level)).init();

    let config = match matches.value_of("config") {
        Some(path) => ServerConfig::load(Path::new(path)).unwrap_or_else(|err| fail(err)),
        None => ServerConfig::default(),
    };
    let server = Server::builder()
        .config(config)
        .build()
        .unwrap_or_else(|err| fail(err));

    let report = server.restore().await.unwrap_or_else(|err| fail(err));
    if !report.unusable.is_empty() {
        log::warn!("{} stored entries could not be restored", report.unusable.len());
    }

    let ctx = match seconds(&matches, "timeout") {
        Some(timeout) => Context::with_timeout(timeout),
        None => Context::background(),
    };

    match run(&server, &ctx, &matches).await {
        Ok(output) => println!("{}", serde_json::to_string_pretty(&output).unwrap_or_default()),
        Err(err) => fail(err),
    }
}

async fn run(server: &Server, ctx: &Context, matches: &ArgMatches<'_>) -> Result<Value, ServerError> {
    match matches.subcommand() {
        ("run-sandbox", Some(sub)) => {
            let request: SandboxRequest = read_request(sub)?;
            let id = server.run_sandbox(ctx, &request).await?;
            Ok(json!({ "id": id }))
        }
        ("create-container", Some(sub)) => {
            let request: ContainerRequest = read_request(sub)?;
            let sandbox_id = sub.value_of("sandbox_id").unwrap_or_default();
            let id = server.create_container(ctx, sandbox_id, &request).await?;
            Ok(json!({ "id": id }))
        }
        ("start", Some(sub)) => {
            server.start_container(id(sub)).await?;
            Ok(json!({}))
        }
        ("stop-container", Some(sub)) => {
            let grace = seconds(sub, "grace").unwrap_or_else(|| server.config().infra_stop_timeout());
            server.stop_container(id(sub), grace).await?;
            Ok(json!({}))
        }
        ("remove-container", Some(sub)) => {
            server.remove_container(id(sub)).await?;
            Ok(json!({}))
        }
        ("stop-sandbox", Some(sub)) => {
            server.stop_sandbox(ctx, id(sub)).await?;
            Ok(json!({}))
        }
        ("remove-sandbox", Some(sub)) => {
            server.remove_sandbox(ctx, id(sub)).await?;
            Ok(json!({}))
        }
        ("list", _) => Ok(json!({
            "sandboxes": server.list_sandboxes(),
            "containers": server.list_containers(None),
        })),
        ("inspect", Some(sub)) => {
            let id = id(sub);
            match server.sandbox(id) {
                Ok(status) => Ok(serde_json::to_value(status)?),
                Err(_) => Ok(serde_json::to_value(server.container(id)?)?),
            }
        }
        (other, _) => Err(ServerError::InvalidRequest(format!("unknown command {:?}", other))),
    }
}

fn read_request<T: serde::de::DeserializeOwned>(matches: &ArgMatches) -> Result<T, ServerError> {
    let path = matches.value_of("request").unwrap_or_default();
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

fn id<'a>(matches: &'a ArgMatches) -> &'a str {
    matches.value_of("id").unwrap_or_default()
}

fn seconds(matches: &ArgMatches, name: &str) -> Option<Duration> {
    let value = matches.value_of(name)?;
    match value.parse::<f64>() {
        Ok(secs) if secs >= 0.0 => Some(Duration::from_secs_f64(secs)),
        _ => fail(format!("bad {} {:?}, expected seconds", name, value)),
    }
}

fn fail<E: std::fmt::Display>(err: E) -> ! {
    log::error!("{}", err);
    std::process::exit(1)
}
