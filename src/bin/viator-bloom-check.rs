//! Viator Bloom Check - snapshot validation tool
//!
//! Verifies the checksum of a VDB snapshot and decodes every bloom object
//! with the same validation the server runs at startup.

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};
use viator_bloom::persistence::{VdbLoader, codec};
use viator_bloom::server::config::BLOOM_MEMORY_LIMIT_DEFAULT;
use viator_bloom::storage::{DbEntry, ExportedValue};
use viator_bloom::{BloomMetrics, SizeLimit};

fn print_usage() {
    println!(
        "Usage: viator-bloom-check [OPTIONS] <dump.vdb>

Check the integrity of a Viator Bloom snapshot.

Options:
  -v, --verbose          Print a summary line for every key
  --memory-limit <N>     Reject bloom objects larger than N bytes
                         (default: {BLOOM_MEMORY_LIMIT_DEFAULT})
  --no-limit             Decode without enforcing a memory limit
  --help                 Show this help message

Examples:
  viator-bloom-check dump.vdb
  viator-bloom-check -v --memory-limit 1048576 /var/lib/viator/dump.vdb
"
    );
}

struct Options {
    path: PathBuf,
    verbose: bool,
    limit: SizeLimit,
}

fn parse_args(args: &[String]) -> anyhow::Result<Option<Options>> {
    let mut verbose = false;
    let mut memory_limit = BLOOM_MEMORY_LIMIT_DEFAULT;
    let mut enforce = true;
    let mut path: Option<PathBuf> = None;

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-v" | "--verbose" => verbose = true,
            "--no-limit" => enforce = false,
            "--memory-limit" => {
                let value = iter.next().context("--memory-limit requires a value")?;
                memory_limit = value
                    .parse()
                    .with_context(|| format!("invalid memory limit: {value}"))?;
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(None);
            }
            _ if !arg.starts_with('-') => path = Some(PathBuf::from(arg)),
            _ => bail!("unknown option: {arg}"),
        }
    }

    let Some(path) = path else {
        print_usage();
        bail!("no snapshot file specified");
    };
    let limit = if enforce {
        SizeLimit::enforced(memory_limit)
    } else {
        SizeLimit::unchecked(memory_limit)
    };
    Ok(Some(Options {
        path,
        verbose,
        limit,
    }))
}

fn check(options: &Options) -> anyhow::Result<()> {
    let contents = VdbLoader::new(&options.path)
        .and_then(VdbLoader::read_contents)
        .with_context(|| format!("cannot read {}", options.path.display()))?;

    println!("[info] checksum OK");
    if let Some(version) = &contents.aux.version {
        println!("[info] writer version: {version}");
    }
    if let Some(ctime) = contents.aux.ctime {
        match DateTime::<Utc>::from_timestamp(ctime, 0) {
            Some(at) => println!("[info] created at: {}", at.to_rfc3339()),
            None => println!("[info] created at: {ctime} (out of range)"),
        }
    }

    let metrics = Arc::new(BloomMetrics::new());
    let mut blooms = 0usize;
    let mut strings = 0usize;
    // Objects must stay alive until the totals are read
    let mut decoded = Vec::new();

    for DbEntry { key, value } in contents.entries {
        let name = String::from_utf8_lossy(&key).into_owned();
        match value {
            ExportedValue::String(data) => {
                strings += 1;
                if options.verbose {
                    println!("{name}: string, {} bytes", data.len());
                }
            }
            ExportedValue::Bloom(raw) => {
                let bloom = codec::decode(&raw, options.limit, &metrics)
                    .with_context(|| format!("bloom object '{name}' failed validation"))?;
                blooms += 1;
                if options.verbose {
                    println!(
                        "{name}: bloom, filters={} capacity={} items={} size={} digest={}",
                        bloom.num_filters(),
                        bloom.capacity(),
                        bloom.cardinality(),
                        bloom.memory_usage(),
                        bloom.digest().to_hex(),
                    );
                }
                decoded.push(bloom);
            }
        }
    }

    let snapshot = metrics.snapshot();
    println!("[info] {blooms} bloom objects, {strings} strings");
    println!(
        "[info] {} filters, {} items, {} bytes",
        snapshot.num_filters, snapshot.num_items, snapshot.total_memory_bytes
    );
    drop(decoded);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(options) = parse_args(&args)? else {
        return Ok(());
    };

    check(&options)?;
    println!("Snapshot {} is valid", options.path.display());
    Ok(())
}
