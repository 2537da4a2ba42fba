use std::env;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use getopts::Options;
use hickory_proto::rr::RecordType;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use swarmdns::resolve::msgs;
use swarmdns::resolve::pool::{Pool, MAX_QUERY_ATTEMPTS};
use swarmdns::resolve::nameserver::DEFAULT_TIMEOUT;

/// Resolvers used when none are supplied on the command line.
const FALLBACK_RESOLVERS: [&str; 3] = ["8.8.8.8", "1.1.1.1", "9.9.9.9"];

/// Upper bound on names being worked in parallel.
const MAX_IN_FLIGHT: usize = 500;

fn print_usage(program: &str, opts: Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

fn build_opts() -> Options {
    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    opts.optflag("q", "quiet", "suppress the progress line");
    opts.optopt("", "qps", "global queries-per-second cap, 0 for unlimited", "QPS");
    opts.optopt("c", "", "attempts per name before giving up", "COUNT");
    opts.optopt("", "timeout", "per-query timeout in milliseconds", "MS");
    opts.optopt(
        "t",
        "",
        "comma-separated query types: A, NS, CNAME, SOA, PTR, MX, TXT, AAAA",
        "TYPES",
    );
    opts.optopt("r", "", "comma-separated resolver addresses", "RESOLVERS");
    opts.optopt("", "rf", "file with one resolver address per line", "FILE");
    opts.optopt("d", "", "dedicated resolver for wildcard detection", "IP");
    opts.optopt("i", "", "file with one name per line, stdin when absent", "FILE");
    opts.optopt("o", "", "output file, stdout when absent", "FILE");
    opts.optopt("l", "", "log file, stderr when absent", "FILE");
    opts
}

fn init_logging(log_file: Option<&str>, quiet: bool) {
    let mut builder = env_logger::Builder::from_default_env();
    if quiet {
        builder.filter_level(log::LevelFilter::Warn);
    }
    if let Some(path) = log_file {
        match File::create(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => {
                eprintln!("cannot open log file {}: {}", path, e);
                process::exit(1);
            }
        }
    }
    let _ = builder.try_init();
}

fn parse_qtype(s: &str) -> Option<RecordType> {
    match s.trim().to_ascii_uppercase().as_str() {
        "A" => Some(RecordType::A),
        "NS" => Some(RecordType::NS),
        "CNAME" => Some(RecordType::CNAME),
        "SOA" => Some(RecordType::SOA),
        "PTR" => Some(RecordType::PTR),
        "MX" => Some(RecordType::MX),
        "TXT" => Some(RecordType::TXT),
        "AAAA" => Some(RecordType::AAAA),
        _ => None,
    }
}

fn read_lines(path: &str) -> io::Result<Vec<String>> {
    let reader = BufReader::new(File::open(path)?);
    Ok(reader
        .lines()
        .filter_map(|line| line.ok())
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect())
}

fn read_stdin_lines() -> Vec<String> {
    io::stdin()
        .lock()
        .lines()
        .filter_map(|line| line.ok())
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

enum Output {
    Stdout(io::Stdout),
    File(File),
}

impl Output {
    fn write_line(&mut self, line: &str) {
        let res = match self {
            Output::Stdout(out) => writeln!(out, "{}", line),
            Output::File(file) => writeln!(file, "{}", line),
        };
        if let Err(e) = res {
            log::error!("write failed: {}", e);
        }
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let opts = build_opts();
    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    if matches.opt_present("h") {
        print_usage(&program, build_opts());
        return;
    }

    let quiet = matches.opt_present("q");
    init_logging(matches.opt_str("l").as_deref(), quiet);

    let qps: u32 = match matches.opt_str("qps").map(|v| v.parse()) {
        Some(Ok(v)) => v,
        Some(Err(_)) => {
            eprintln!("invalid qps value");
            process::exit(1);
        }
        None => 0,
    };

    let attempts: usize = match matches.opt_str("c").map(|v| v.parse()) {
        Some(Ok(v)) if v > 0 => v,
        Some(_) => {
            eprintln!("invalid attempt count");
            process::exit(1);
        }
        None => MAX_QUERY_ATTEMPTS,
    };

    let timeout = match matches.opt_str("timeout").map(|v| v.parse::<u64>()) {
        Some(Ok(ms)) if ms > 0 => Duration::from_millis(ms),
        Some(_) => {
            eprintln!("invalid timeout");
            process::exit(1);
        }
        None => DEFAULT_TIMEOUT,
    };

    let qtypes: Vec<RecordType> = match matches.opt_str("t") {
        Some(list) => {
            let parsed: Option<Vec<RecordType>> = list.split(',').map(parse_qtype).collect();
            match parsed {
                Some(types) if !types.is_empty() => types,
                _ => {
                    eprintln!("invalid query type list: {}", list);
                    process::exit(1);
                }
            }
        }
        None => vec![RecordType::A],
    };

    let mut resolvers: Vec<String> = Vec::new();
    if let Some(list) = matches.opt_str("r") {
        resolvers.extend(
            list.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        );
    }
    if let Some(path) = matches.opt_str("rf") {
        match read_lines(&path) {
            Ok(lines) => resolvers.extend(lines),
            Err(e) => {
                eprintln!("cannot read resolvers file {}: {}", path, e);
                process::exit(1);
            }
        }
    }
    if resolvers.is_empty() {
        log::info!("no resolvers given, using built-in public resolvers");
        resolvers.extend(FALLBACK_RESOLVERS.iter().map(|s| s.to_string()));
    }

    let names: Vec<String> = match matches.opt_str("i") {
        Some(path) => match read_lines(&path) {
            Ok(lines) => lines,
            Err(e) => {
                eprintln!("cannot read input file {}: {}", path, e);
                process::exit(1);
            }
        },
        None => read_stdin_lines(),
    };
    if names.is_empty() {
        eprintln!("no names to resolve");
        process::exit(1);
    }

    let output = Arc::new(Mutex::new(match matches.opt_str("o") {
        Some(path) => match File::create(&path) {
            Ok(file) => Output::File(file),
            Err(e) => {
                eprintln!("cannot open output file {}: {}", path, e);
                process::exit(1);
            }
        },
        None => Output::Stdout(io::stdout()),
    }));

    let pool = match Pool::with_resolvers(qps, timeout, &resolvers) {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("failed to build resolver pool: {}", e);
            process::exit(1);
        }
    };

    if let Some(addr) = matches.opt_str("d") {
        if let Err(e) = pool.set_detection_resolver(&addr, timeout) {
            eprintln!("invalid detection resolver {}: {}", addr, e);
            process::exit(1);
        }
    }

    let total = names.len();
    let resolved = Arc::new(AtomicUsize::new(0));
    let attempted = Arc::new(AtomicUsize::new(0));
    let limiter = Arc::new(Semaphore::new(MAX_IN_FLIGHT));

    let progress = if quiet {
        None
    } else {
        let resolved = Arc::clone(&resolved);
        let attempted = Arc::clone(&attempted);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let done = resolved.load(Ordering::Relaxed);
                let tries = attempted.load(Ordering::Relaxed);
                let avg = if done > 0 {
                    tries as f64 / done as f64
                } else {
                    0.0
                };
                eprintln!(
                    "{} of {} names resolved, {:.1} attempts per resolved name",
                    done, total, avg
                );
            }
        }))
    };

    let mut handles = Vec::with_capacity(names.len());
    for name in names {
        let pool = pool.clone();
        let output = Arc::clone(&output);
        let resolved = Arc::clone(&resolved);
        let attempted = Arc::clone(&attempted);
        let limiter = Arc::clone(&limiter);
        let qtypes = qtypes.clone();

        handles.push(tokio::spawn(async move {
            let _permit = match limiter.acquire().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let mut any = false;

            for qtype in qtypes {
                for _ in 0..attempts {
                    attempted.fetch_add(1, Ordering::Relaxed);
                    let msg = match msgs::query_msg(&name, qtype) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::warn!("skipping {}: {}", name, e);
                            return;
                        }
                    };
                    if let Ok(resp) = pool.exchange(msg).await {
                        for answer in msgs::extract_answers(&resp) {
                            output.lock().write_line(&format!(
                                "{} {} {}",
                                answer.name, answer.rtype, answer.data
                            ));
                            any = true;
                        }
                        break;
                    }
                }
            }

            if any {
                resolved.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    futures::future::join_all(handles).await;

    if let Some(progress) = progress {
        progress.abort();
    }

    let done = resolved.load(Ordering::Relaxed);
    let tries = attempted.load(Ordering::Relaxed);
    if !quiet {
        let avg = if done > 0 {
            tries as f64 / done as f64
        } else {
            0.0
        };
        eprintln!(
            "finished: {} of {} names resolved, {:.1} attempts per resolved name",
            done, total, avg
        );
    }

    pool.stop();
}
