use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use llmgate_common::load_config;
use llmgate_storage::{SeaOrmRepository, dsn_from_env};

mod cli;

use cli::{Cli, Command, ConfigAction};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Config { action: ConfigAction::Create { spec, out } } => scaffold_config(&spec, &out),
        Command::Worker { config } => run(async_main_worker(config)),
        Command::Gateway { config, host, port, workers } => run(async_main_gateway(config, host, port, workers)),
    }
}

fn run(fut: impl std::future::Future<Output = ExitCode>) -> ExitCode {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            tracing::error!(%err, "failed to start tokio runtime");
            return ExitCode::from(1);
        }
    };
    runtime.block_on(fut)
}

fn load_or_exit(path: &str) -> Result<llmgate_common::CompiledConfig, ExitCode> {
    let yaml = match std::fs::read_to_string(path) {
        Ok(yaml) => yaml,
        Err(err) => {
            tracing::error!(%err, path, "failed to read configuration file");
            return Err(ExitCode::from(2));
        }
    };
    load_config(&yaml).map_err(|report| {
        tracing::error!("{report}");
        ExitCode::from(2)
    })
}

async fn build_repo() -> Result<Arc<SeaOrmRepository>, ExitCode> {
    let dsn = match dsn_from_env() {
        Ok(dsn) => dsn,
        Err(err) => {
            tracing::error!(%err, "failed to resolve database DSN");
            return Err(ExitCode::from(2));
        }
    };
    let repo = SeaOrmRepository::connect(&dsn).await.map_err(|err| {
        tracing::error!(%err, "failed to connect to database");
        ExitCode::from(1)
    })?;
    repo.sync().await.map_err(|err| {
        tracing::error!(%err, "failed to sync database schema");
        ExitCode::from(1)
    })?;
    Ok(Arc::new(repo))
}

async fn async_main_worker(config_path: String) -> ExitCode {
    let compiled = match load_or_exit(&config_path) {
        Ok(compiled) => compiled,
        Err(code) => return code,
    };
    let repo = match build_repo().await {
        Ok(repo) => repo,
        Err(code) => return code,
    };
    let ctx = Arc::new(llmgate_core::AppContext::new(compiled, repo));
    tracing::info!(providers = ctx.providers.len(), "starting probe engine");
    let handles = llmgate_core::spawn_schedulers(ctx);
    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(%err, "probe scheduler task panicked");
        }
    }
    ExitCode::SUCCESS
}

async fn async_main_gateway(config_path: String, host: Option<String>, port: Option<u16>, workers: usize) -> ExitCode {
    let mut compiled = match load_or_exit(&config_path) {
        Ok(compiled) => compiled,
        Err(code) => return code,
    };
    if let Some(host) = &host {
        let port = port.unwrap_or(8080);
        compiled.gateway.listen = format!("{host}:{port}");
    } else if let Some(port) = port {
        let existing_host = compiled.gateway.listen.rsplit_once(':').map(|(h, _)| h.to_string()).unwrap_or_else(|| "0.0.0.0".to_string());
        compiled.gateway.listen = format!("{existing_host}:{port}");
    }
    let _ = workers; // tokio multi-thread runtime already schedules across OS threads

    let repo = match build_repo().await {
        Ok(repo) => repo,
        Err(code) => return code,
    };
    let listen = compiled.gateway.listen.clone();
    let ctx = Arc::new(llmgate_core::AppContext::new(compiled, repo));
    let _worker_handles = llmgate_core::spawn_schedulers(ctx.clone());

    let app = llmgate_core::router(ctx);
    let listener = match tokio::net::TcpListener::bind(&listen).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, listen, "failed to bind gateway listener");
            return ExitCode::from(1);
        }
    };
    tracing::info!(listen, "gateway listening");
    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!(%err, "gateway server error");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn scaffold_config(spec: &str, out: &str) -> ExitCode {
    use std::io::Write;

    let Some((kind, name)) = spec.split_once(':') else {
        eprintln!("expected <type>:<name>, e.g. openai_like:my-provider");
        return ExitCode::from(2);
    };
    let kind = match kind {
        "openai_like" => "openai_like",
        "gemini" => "gemini",
        other => {
            eprintln!("unknown provider type: {other} (expected openai_like or gemini)");
            return ExitCode::from(2);
        }
    };

    let block = format!(
        "  {name}:\n    name: {name}\n    kind: {kind}\n    base_url: \"https://example.invalid\"\n    models:\n      - \"model-id\"\n    shared_key_status: false\n    gateway_policy:\n      streaming_mode: auto\n      debug_mode: disabled\n    worker_health_policy: {{}}\n"
    );
    let mut contents = String::new();
    if !std::path::Path::new(out).exists() {
        contents.push_str("providers:\n");
    }
    contents.push_str(&block);

    let written = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(out)
        .and_then(|mut file| file.write_all(contents.as_bytes()));
    match written {
        Ok(()) => {
            println!("{out}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("failed to write {out}: {err}");
            ExitCode::from(1)
        }
    }
}
