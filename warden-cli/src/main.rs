//! Standalone batch-mode front end for the engine: reads a job spec as
//! JSON (file or stdin), runs it to completion, and prints the response as
//! JSON. Useful for smoke-testing a runtime registry without standing up
//! an HTTP or WebSocket adapter.

use std::{io::Read, path::PathBuf};

use clap::Parser;
use warden::{
    config::EngineConfig,
    job::JobRequest,
    protocol::{decode_files, resolve_limits, BatchResponse, JobSpec},
    registry::Registry,
    Engine,
};

#[derive(Parser, Debug)]
struct Opt {
    /// Directory of `<language>/<version>/metadata.toml` runtime manifests.
    #[arg(short = 'r', long = "registry")]
    registry_root: PathBuf,

    /// Engine config TOML. Falls back to built-in defaults if omitted.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Job spec JSON file; reads stdin if omitted.
    #[arg(short = 'f', long = "file")]
    job_file: Option<PathBuf>,

    /// Client identity used for the concurrency governor.
    #[arg(long, default_value = "cli")]
    client: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opt = Opt::parse();

    let config = match &opt.config {
        Some(path) => EngineConfig::load(path).unwrap_or_else(|err| {
            eprintln!("failed to load config: {err}");
            std::process::exit(1);
        }),
        None => EngineConfig::default(),
    };

    let registry = Registry::load_from_dir(&opt.registry_root).unwrap_or_else(|err| {
        eprintln!("failed to load registry: {err}");
        std::process::exit(1);
    });

    let engine = Engine::new(&config, registry).unwrap_or_else(|err| {
        eprintln!("failed to initialize engine: {err}");
        std::process::exit(1);
    });

    let raw = match &opt.job_file {
        Some(path) => std::fs::read_to_string(path).unwrap_or_else(|err| {
            eprintln!("failed to read {}: {err}", path.display());
            std::process::exit(1);
        }),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).unwrap_or_else(|err| {
                eprintln!("failed to read stdin: {err}");
                std::process::exit(1);
            });
            buf
        }
    };

    let spec: JobSpec = serde_json::from_str(&raw).unwrap_or_else(|err| {
        eprintln!("invalid job spec: {err}");
        std::process::exit(1);
    });

    let _token = engine.admit(&opt.client).unwrap_or_else(|err| {
        eprintln!("{err}");
        std::process::exit(1);
    });

    let files = decode_files(&spec.files).unwrap_or_else(|err| {
        eprintln!("{err}");
        std::process::exit(1);
    });
    let (run_ms, compile_ms, run_bytes, compile_bytes) = resolve_limits(&spec, 5_000, 10_000);

    let request = JobRequest {
        alias: spec.language.clone(),
        args: spec.args.clone(),
        files,
        compile_ms,
        run_ms,
        compile_bytes,
        run_bytes,
        max_output_bytes: engine.default_max_output_bytes(),
        stdin: spec.stdin.clone().into_bytes(),
    };

    let mut job = engine
        .prepare(&spec.language, &spec.version, request)
        .unwrap_or_else(|err| {
            eprintln!("{err}");
            std::process::exit(1);
        });

    let result = job.execute().await.unwrap_or_else(|err| {
        eprintln!("{err}");
        std::process::exit(1);
    });
    job.cleanup();

    let response = BatchResponse {
        language: result.language,
        version: result.version,
        compile: result.compile,
        run: result.run,
    };
    println!("{}", serde_json::to_string_pretty(&response).unwrap());
}
