use std::env;
use std::io::{self, Write};
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use idgen::{
    DEFAULT_POSTFIX_DIGITS, IdError, NodeId, StateConfig, TimeBasedAlphanumericGen, TimeUuidGen,
    clock_sequence_of, parse_alphanumeric_id, uuid_time_of, uuid_time_to_datetime,
    validate_alphanumeric_id,
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct EmitOpts {
    postfix: usize,
    offset: Option<i64>,
    count: usize,
    json: bool,
}

impl Default for EmitOpts {
    fn default() -> Self {
        Self {
            postfix: DEFAULT_POSTFIX_DIGITS,
            offset: None,
            count: 0,
            json: false,
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn print_help() {
    eprintln!(
        "idgen - identifier generator CLI\n\n\
Usage:\n  idgen next [--postfix <n>] [--offset <ms>]\n  idgen stream [--postfix <n>] [--offset <ms>] [--count <n>]\n  idgen time <id> --offset <ms> [--postfix <n>] [--json]\n  idgen validate <id> [--postfix <n>]\n  idgen uuid [--count <n>] [--json]\n  idgen node [random | check <XX-XX-XX-XX-XX-XX>]\n  idgen healthcheck [--json]\n  idgen bench [--kind alnum|uuid] [--count <n>]\n  idgen selftest\n\n\
Environment:\n  IDGEN_STATE_FILE      node registry document used by `uuid`\n  IDGEN_STATE_MODE      read-only (default) | file\n  IDGEN_SYNCH_INTERVAL  registry flush interval in ms\n  RUST_LOG              log filter (default: warn)\n"
    );
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| format!("missing value for {flag}"))
}

fn parse_emit_flags(args: &[String], allow_count: bool) -> Result<EmitOpts, String> {
    let mut opts = EmitOpts::default();
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "--postfix" | "--P" => {
                opts.postfix = flag_value(args, i, "--postfix")?
                    .parse::<usize>()
                    .map_err(|_| "invalid integer for --postfix".to_string())?;
                i += 2;
            }
            "--offset" => {
                opts.offset = Some(
                    flag_value(args, i, "--offset")?
                        .parse::<i64>()
                        .map_err(|_| "invalid integer for --offset".to_string())?,
                );
                i += 2;
            }
            "--count" if allow_count => {
                opts.count = flag_value(args, i, "--count")?
                    .parse::<usize>()
                    .map_err(|_| "invalid integer for --count".to_string())?;
                i += 2;
            }
            "--json" => {
                opts.json = true;
                i += 1;
            }
            _ => return Err(format!("unknown flag: {}", args[i])),
        }
    }

    Ok(opts)
}

fn alnum_generator(opts: &EmitOpts) -> Result<TimeBasedAlphanumericGen, String> {
    match opts.offset {
        Some(offset) => TimeBasedAlphanumericGen::with_offset(opts.postfix, offset),
        None => TimeBasedAlphanumericGen::new(opts.postfix),
    }
    .map_err(|e| e.to_string())
}

/// How long a blocking call keeps retrying an exhausted tick before giving up.
const RETRY_WINDOW: Duration = Duration::from_millis(250);

/// Retry through exhausted milliseconds for at most [`RETRY_WINDOW`]; every
/// other error is final.
fn next_alnum_blocking(generator: &TimeBasedAlphanumericGen) -> Result<String, String> {
    let deadline = Instant::now() + RETRY_WINDOW;
    loop {
        match generator.next_id() {
            Ok(id) => return Ok(id),
            Err(IdError::CapacityExhausted { .. }) if Instant::now() < deadline => {
                thread::yield_now()
            }
            Err(e) => return Err(e.to_string()),
        }
    }
}

fn next_uuid_blocking(generator: &TimeUuidGen) -> Result<uuid::Uuid, String> {
    let deadline = Instant::now() + RETRY_WINDOW;
    loop {
        match generator.next_uuid() {
            Ok(id) => return Ok(id),
            Err(IdError::OverClocked) if Instant::now() < deadline => thread::yield_now(),
            Err(e) => return Err(e.to_string()),
        }
    }
}

fn run_next(args: &[String]) -> Result<(), String> {
    let opts = parse_emit_flags(args, false)?;
    let generator = alnum_generator(&opts)?;
    let id = next_alnum_blocking(&generator)?;
    if opts.json {
        let payload = json!({
            "id": id,
            "postfix": opts.postfix,
            "offset": generator.offset(),
        });
        println!(
            "{}",
            serde_json::to_string(&payload).map_err(|e| e.to_string())?
        );
    } else {
        println!("{}", id);
    }
    Ok(())
}

fn run_stream(args: &[String]) -> Result<(), String> {
    let opts = parse_emit_flags(args, true)?;
    let generator = alnum_generator(&opts)?;
    let mut emitted = 0usize;

    loop {
        if opts.count > 0 && emitted >= opts.count {
            break;
        }
        println!("{}", next_alnum_blocking(&generator)?);
        io::stdout().flush().map_err(|e| e.to_string())?;
        emitted += 1;
    }

    Ok(())
}

fn format_millis(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| "out of range".to_string())
}

fn run_time(args: &[String]) -> Result<(), String> {
    if args.is_empty() {
        return Err("time requires an id".to_string());
    }
    let id = args[0].clone();
    let opts = parse_emit_flags(&args[1..], false)?;
    let offset = opts
        .offset
        .ok_or_else(|| "time requires --offset".to_string())?;

    let parsed = parse_alphanumeric_id(&id, opts.postfix).map_err(|e| e.to_string())?;
    let millis = parsed.millis(offset);

    if opts.json {
        let payload = json!({
            "raw": parsed.raw,
            "elapsed": parsed.elapsed,
            "postfix": parsed.postfix,
            "millis": millis,
            "timestamp": format_millis(millis),
        });
        println!(
            "{}",
            serde_json::to_string(&payload).map_err(|e| e.to_string())?
        );
    } else {
        println!("{} {}", millis, format_millis(millis));
    }
    Ok(())
}

fn run_validate(args: &[String]) -> Result<(), String> {
    if args.is_empty() {
        return Err("validate requires an id".to_string());
    }
    let id = args[0].clone();
    let opts = parse_emit_flags(&args[1..], false)?;
    let ok = validate_alphanumeric_id(&id, opts.postfix);
    println!("{}", if ok { "true" } else { "false" });
    if ok {
        Ok(())
    } else {
        Err("invalid id".to_string())
    }
}

fn run_uuid(args: &[String]) -> Result<(), String> {
    let mut opts = parse_emit_flags(args, true)?;
    if opts.count == 0 {
        opts.count = 1;
    }

    let generator = TimeUuidGen::from_config(&StateConfig::from_env()).map_err(|e| e.to_string())?;
    for _ in 0..opts.count {
        let id = next_uuid_blocking(&generator)?;
        if opts.json {
            let payload = json!({
                "uuid": id.to_string(),
                "node": generator.node_id().to_string(),
                "clock_sequence": clock_sequence_of(&id),
                "timestamp": uuid_time_of(&id)
                    .and_then(uuid_time_to_datetime)
                    .map(|dt| dt.to_rfc3339()),
            });
            println!(
                "{}",
                serde_json::to_string(&payload).map_err(|e| e.to_string())?
            );
        } else {
            println!("{}", id);
        }
    }
    generator.close().map_err(|e| e.to_string())
}

fn run_node(args: &[String]) -> Result<(), String> {
    match args.first().map(String::as_str) {
        None | Some("random") => {
            println!("{}", NodeId::random());
            Ok(())
        }
        Some("check") => {
            let raw = args
                .get(1)
                .ok_or_else(|| "node check requires an address".to_string())?;
            let id: NodeId = raw.parse().map_err(|e: IdError| e.to_string())?;
            println!("{} multicast={}", id, id.is_multicast());
            Ok(())
        }
        Some(other) => Err(format!("unknown node subcommand: {}", other)),
    }
}

fn run_healthcheck(args: &[String]) -> Result<(), String> {
    let opts = parse_emit_flags(args, false)?;
    let generator = alnum_generator(&opts)?;
    let sample = next_alnum_blocking(&generator)?;
    let ok = validate_alphanumeric_id(&sample, opts.postfix)
        && sample.len() == generator.max_length();

    if opts.json {
        let payload = json!({
            "ok": ok,
            "postfix": opts.postfix,
            "length": generator.max_length(),
            "sample_id": sample,
        });
        println!(
            "{}",
            serde_json::to_string(&payload).map_err(|e| e.to_string())?
        );
    } else {
        println!(
            "ok={} postfix={} sample={}",
            if ok { "true" } else { "false" },
            opts.postfix,
            sample
        );
    }

    if ok {
        Ok(())
    } else {
        Err("healthcheck failed".to_string())
    }
}

fn run_bench(args: &[String]) -> Result<(), String> {
    let mut kind = "alnum".to_string();
    let mut tail: Vec<String> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--kind" {
            kind = flag_value(args, i, "--kind")?.to_string();
            i += 2;
        } else {
            tail.push(args[i].clone());
            i += 1;
        }
    }
    let mut opts = parse_emit_flags(&tail, true)?;
    if opts.count == 0 {
        opts.count = 100_000;
    }

    let start = Instant::now();
    match kind.as_str() {
        "alnum" => {
            let generator = alnum_generator(&opts)?;
            for _ in 0..opts.count {
                let _ = next_alnum_blocking(&generator)?;
            }
        }
        "uuid" => {
            let generator = TimeUuidGen::with_defaults().map_err(|e| e.to_string())?;
            for _ in 0..opts.count {
                let _ = next_uuid_blocking(&generator)?;
            }
        }
        _ => return Err("--kind must be one of: alnum, uuid".to_string()),
    }

    let secs = start.elapsed().as_secs_f64().max(1e-9);
    let payload = json!({
        "kind": kind,
        "postfix": opts.postfix,
        "n": opts.count,
        "seconds": secs,
        "ids_per_sec": opts.count as f64 / secs,
    });
    println!(
        "{}",
        serde_json::to_string(&payload).map_err(|e| e.to_string())?
    );
    Ok(())
}

fn run_selftest() -> Result<(), String> {
    let generator =
        TimeBasedAlphanumericGen::new(DEFAULT_POSTFIX_DIGITS).map_err(|e| e.to_string())?;
    let a = next_alnum_blocking(&generator)?;
    let b = next_alnum_blocking(&generator)?;
    if a >= b {
        return Err("selftest failed: non-monotonic".to_string());
    }
    let uuids = TimeUuidGen::with_defaults().map_err(|e| e.to_string())?;
    let x = next_uuid_blocking(&uuids)?;
    let y = next_uuid_blocking(&uuids)?;
    if x == y {
        return Err("selftest failed: duplicate uuid".to_string());
    }
    Ok(())
}

fn main() {
    init_logging();
    let args: Vec<String> = env::args().skip(1).collect();

    if args.is_empty() {
        print_help();
        process::exit(2);
    }

    if args[0] == "-h" || args[0] == "--help" || args[0] == "help" {
        print_help();
        return;
    }

    let cmd = args[0].as_str();
    let rest = &args[1..];

    let res = match cmd {
        "next" => run_next(rest),
        "stream" => run_stream(rest),
        "time" => run_time(rest),
        "validate" => run_validate(rest),
        "uuid" => run_uuid(rest),
        "node" => run_node(rest),
        "healthcheck" => run_healthcheck(rest),
        "bench" => run_bench(rest),
        "selftest" => run_selftest(),
        _ => Err(format!("unknown command: {}", cmd)),
    };

    if let Err(err) = res {
        eprintln!("error: {}", err);
        process::exit(1);
    }
}
