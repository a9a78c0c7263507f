//! reqtx - contention simulator
//!
//! Runs concurrent requests that all increment the same row of the in-memory
//! serializable backend, each through the request transaction filter, and
//! reports how many attempts the conflicts cost.

use std::io::Write;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use log::{info, warn};
use serde_json::json;

use reqtx::backend::{MemoryConnection, MemoryDatabase};
use reqtx::filter::{
    BufferedRequest, CapturedResponse, FilterConfig, FilterError, HandlerError, HandlerResult,
    IncomingRequest, RequestContext, RequestTransactionFilter, ResponseBuffer,
};

const TABLE: &str = "counters";
const HOT_ROW: &str = "logins";

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    // Parse simple command line args.
    let mut requests: u64 = 200;
    let mut threads: u64 = 8;
    let mut max_attempts: Option<u32> = None;
    let mut config_path: Option<String> = None;
    let mut verbose = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-r" | "--requests" => {
                i += 1;
                match args.get(i).and_then(|v| v.parse().ok()) {
                    Some(n) => requests = n,
                    None => return usage_error("--requests expects a number"),
                }
            }
            "-t" | "--threads" => {
                i += 1;
                match args.get(i).and_then(|v| v.parse().ok()) {
                    Some(n) if n > 0 => threads = n,
                    _ => return usage_error("--threads expects a positive number"),
                }
            }
            "-a" | "--max-attempts" => {
                i += 1;
                match args.get(i).and_then(|v| v.parse().ok()) {
                    Some(n) => max_attempts = Some(n),
                    None => return usage_error("--max-attempts expects a number"),
                }
            }
            "-c" | "--config" => {
                i += 1;
                match args.get(i) {
                    Some(path) => config_path = Some(path.clone()),
                    None => return usage_error("--config expects a path"),
                }
            }
            "-v" | "--verbose" => {
                verbose = true;
            }
            "-h" | "--help" => {
                print_help();
                return ExitCode::SUCCESS;
            }
            "--version" => {
                println!("reqtx v{}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            arg => {
                eprintln!("Unknown option: {}", arg);
                return ExitCode::FAILURE;
            }
        }
        i += 1;
    }

    let default_filter = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut config = match config_path {
        Some(path) => match FilterConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading {}: {}", path, e);
                return ExitCode::FAILURE;
            }
        },
        None => FilterConfig::default(),
    };
    if let Some(n) = max_attempts {
        config = config.max_attempts(n);
    }
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    let db = MemoryDatabase::new();
    db.write_committed(TABLE, HOT_ROW, json!(0));
    let filter = RequestTransactionFilter::new(db.clone(), config);

    info!(
        "running {} requests on {} threads (max {} attempts)",
        requests,
        threads,
        filter.config().max_attempts
    );
    let stats = run(&filter, requests, threads);

    let counter = db
        .read_committed(TABLE, HOT_ROW)
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let consistent = counter == stats.succeeded.load(Ordering::SeqCst)
        && db.row_count("audit") as u64 == counter;

    print_summary(&stats, counter, consistent);

    let report = json!({
        "run": {
            "requests": requests,
            "threads": threads,
            "succeeded": stats.succeeded.load(Ordering::SeqCst),
            "exhausted": stats.exhausted.load(Ordering::SeqCst),
            "failed": stats.failed.load(Ordering::SeqCst),
            "attempts": stats.attempts.load(Ordering::SeqCst),
            "max_attempts_seen": stats.max_seen.load(Ordering::SeqCst),
            "elapsed_ms": stats.elapsed_ms.load(Ordering::SeqCst),
        },
        "backend": db.stats(),
        "config": filter.config(),
    });
    match serde_json::to_string_pretty(&report) {
        Ok(text) => println!("{}", text),
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    }

    if consistent {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[derive(Default)]
struct RunStats {
    succeeded: AtomicU64,
    exhausted: AtomicU64,
    failed: AtomicU64,
    attempts: AtomicU64,
    max_seen: AtomicU64,
    elapsed_ms: AtomicU64,
}

fn run(filter: &RequestTransactionFilter<MemoryDatabase>, requests: u64, threads: u64) -> RunStats {
    let stats = RunStats::default();
    let started = Instant::now();

    thread::scope(|scope| {
        for worker in 0..threads {
            let stats = &stats;
            scope.spawn(move || {
                let mut n = worker;
                while n < requests {
                    let request = IncomingRequest::new("POST", "/login")
                        .header("Content-Type", "application/json")
                        .body(json!({ "request": n }).to_string());
                    let mut sink = CapturedResponse::new();

                    match filter.do_filter(request, &mut sink, &record_login) {
                        Ok(summary) => {
                            stats.succeeded.fetch_add(1, Ordering::SeqCst);
                            stats.attempts.fetch_add(summary.attempts as u64, Ordering::SeqCst);
                            stats.max_seen.fetch_max(summary.attempts as u64, Ordering::SeqCst);
                        }
                        Err(e @ FilterError::RetriesExhausted { .. }) => {
                            warn!("request {}: {}", n, e);
                            stats.exhausted.fetch_add(1, Ordering::SeqCst);
                            stats.attempts.fetch_add(
                                e.attempt().unwrap_or(0) as u64,
                                Ordering::SeqCst,
                            );
                        }
                        Err(e) => {
                            warn!("request {} failed with status {}: {}", n, e.status_code(), e);
                            stats.failed.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    n += threads;
                }
            });
        }
    });

    stats
        .elapsed_ms
        .store(started.elapsed().as_millis() as u64, Ordering::SeqCst);
    stats
}

/// Increment the hot counter and write an audit row for the request.
fn record_login(
    request: &BufferedRequest,
    response: &mut ResponseBuffer,
    ctx: &RequestContext<MemoryConnection>,
) -> HandlerResult<()> {
    let body: serde_json::Value = request
        .body_json()
        .map_err(|e| HandlerError::failed(format!("bad request body: {}", e)))?;
    let id = body["request"].as_u64().unwrap_or_default();

    let mut tx = ctx.transaction();
    let conn = tx.connection();
    let current = conn.get(TABLE, HOT_ROW)?.and_then(|v| v.as_u64()).unwrap_or(0);
    conn.upsert(TABLE, HOT_ROW, json!(current + 1))?;
    conn.insert("audit", &id.to_string(), json!({ "attempt": ctx.attempt() }))?;

    response.set_header("Content-Type", "application/json");
    write!(response, "{}", json!({ "logins": current + 1 }))
        .map_err(|e| HandlerError::failed(e.to_string()))
}

fn print_summary(stats: &RunStats, counter: u64, consistent: bool) {
    let succeeded = stats.succeeded.load(Ordering::SeqCst);
    let attempts = stats.attempts.load(Ordering::SeqCst);
    println!("Requests succeeded:  {}", succeeded);
    println!("Retries exhausted:   {}", stats.exhausted.load(Ordering::SeqCst));
    println!("Other failures:      {}", stats.failed.load(Ordering::SeqCst));
    if succeeded > 0 {
        println!(
            "Attempts/request:    {:.2} (max {})",
            attempts as f64 / succeeded as f64,
            stats.max_seen.load(Ordering::SeqCst)
        );
    }
    println!("Counter value:       {}", counter);
    println!("Consistent:          {}", if consistent { "yes" } else { "NO" });
    println!("Elapsed:             {}ms", stats.elapsed_ms.load(Ordering::SeqCst));
    println!();
}

fn usage_error(message: &str) -> ExitCode {
    eprintln!("Error: {}", message);
    eprintln!("Try 'reqtx --help' for more information.");
    ExitCode::FAILURE
}

fn print_help() {
    println!("reqtx - request-scoped transactions with savepoint retry");
    println!();
    println!("Usage: reqtx [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -r, --requests N       Number of requests to run (default: 200)");
    println!("  -t, --threads N        Worker threads (default: 8)");
    println!("  -a, --max-attempts N   Attempts per request (default: 10)");
    println!("  -c, --config PATH      Load filter config from a JSON file");
    println!("  -v, --verbose          Enable debug logging");
    println!("  -h, --help             Show this help message");
    println!("  --version              Show version");
    println!();
    println!("Examples:");
    println!("  reqtx                          Run the default simulation");
    println!("  reqtx -r 1000 -t 32 -a 20      Heavier contention, larger budget");
    println!("  RUST_LOG=trace reqtx -r 5      Watch every lifecycle step");
}
