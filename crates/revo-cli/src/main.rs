#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use revo::{
    BitmapAllocator, DeviceId, FileId, MemTransport, Pipeline, PipelineConfig, Segment,
    StreamMode,
};
use serde::Serialize;
use std::env;
use std::sync::Arc;

const BLOCK: u32 = 512;

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "simulate" => {
            let remaining: Vec<String> = args.collect();
            let options = SimulateOptions::parse(&remaining)?;
            simulate(&options)
        }
        "config" => {
            let json = args.any(|arg| arg == "--json");
            show_config(json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("revo-cli\n");
    println!("USAGE:");
    println!("  revo-cli simulate [--devices N] [--streams N] [--writes N] [--direct] [--json]");
    println!("  revo-cli config [--json]");
}

// ── simulate ────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SimulateOptions {
    devices: u16,
    streams: u64,
    writes: u64,
    direct: bool,
    json: bool,
}

impl SimulateOptions {
    fn parse(args: &[String]) -> Result<Self> {
        let mut options = Self {
            devices: 1,
            streams: 2,
            writes: 64,
            direct: false,
            json: false,
        };
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--devices" => options.devices = parse_value(&mut iter, "--devices")?,
                "--streams" => options.streams = parse_value(&mut iter, "--streams")?,
                "--writes" => options.writes = parse_value(&mut iter, "--writes")?,
                "--direct" => options.direct = true,
                "--json" => options.json = true,
                other => bail!("unknown simulate option: {other}"),
            }
        }
        if options.devices == 0 || options.streams == 0 {
            bail!("--devices and --streams must be at least 1");
        }
        Ok(options)
    }
}

fn parse_value<T: std::str::FromStr>(
    iter: &mut std::slice::Iter<'_, String>,
    flag: &str,
) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = iter
        .next()
        .with_context(|| format!("{flag} requires a value"))?;
    value
        .parse()
        .with_context(|| format!("invalid value for {flag}: {value}"))
}

#[derive(Debug, Serialize)]
struct SimulateReport {
    devices: Vec<revo::PipelineStats>,
}

/// Drive a synthetic capture session over in-memory devices and report the
/// resulting pipeline statistics.
fn simulate(options: &SimulateOptions) -> Result<()> {
    let pipeline = Pipeline::new(PipelineConfig {
        scratch_base: 0x80_0000,
        scratch_bytes: 4 * 1024 * 1024,
        ..PipelineConfig::default()
    });

    let mut transports = Vec::new();
    for d in 0..options.devices {
        let device = DeviceId(d);
        let transport = Arc::new(MemTransport::new(16 << 20));
        pipeline
            .attach_device(device, Arc::new(BitmapAllocator::new(1 << 16)), transport.clone())
            .with_context(|| format!("attach device {d}"))?;
        transports.push(transport);
    }

    for d in 0..options.devices {
        let device = DeviceId(d);
        pipeline.request_rt(device);

        let mode = StreamMode {
            real_time: true,
            direct: options.direct,
        };
        for s in 0..options.streams {
            let stream = pipeline
                .open_stream(device, FileId(s), mode)
                .with_context(|| format!("open stream {s} on device {d}"))?;
            for w in 0..options.writes {
                let addr = (w % 1024) * u64::from(BLOCK);
                if options.direct {
                    stream
                        .write_direct(addr, BLOCK)
                        .with_context(|| format!("direct write {w} on stream {s}"))?;
                } else {
                    stream
                        .write(vec![Segment { addr, len: BLOCK }])
                        .with_context(|| format!("write {w} on stream {s}"))?;
                }
            }
            stream.close().with_context(|| format!("close stream {s}"))?;
        }

        pipeline.clear_rt(device);
        pipeline
            .flush_now(device, false)
            .with_context(|| format!("flush device {d}"))?;
    }

    let report = SimulateReport {
        devices: (0..options.devices)
            .filter_map(|d| pipeline.stats(DeviceId(d)))
            .collect(),
    };

    if options.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        println!("Revo capture simulation");
        for stats in &report.devices {
            println!("device {}:", stats.device);
            println!("  rt_state: {}", stats.rt_state);
            println!("  submitted: {}", stats.reservoir.submitted);
            println!("  drains: {}", stats.reservoir.drains);
            println!(
                "  contiguous/fallback: {}/{}",
                stats.reservoir.contiguous_drains, stats.reservoir.fallback_drains
            );
            println!("  dispatched: {}", stats.transport.dispatched);
            println!("  padding: {}", stats.transport.padding_dispatched);
            println!("  bytes_moved: {}", stats.transport.bytes_moved);
        }
    }
    Ok(())
}

// ── config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ConfigOutput {
    target_depth: usize,
    descriptor_budget: usize,
    block_bytes: u32,
    claim_retries: u32,
    flush_max_retries: u32,
    page_bytes: u32,
    page_entries: usize,
    min_unit: u32,
    scratch_bytes: u64,
}

fn show_config(json: bool) -> Result<()> {
    let config = PipelineConfig::default();
    let output = ConfigOutput {
        target_depth: config.reservoir.target_depth,
        descriptor_budget: config.reservoir.descriptor_budget,
        block_bytes: config.reservoir.block_bytes,
        claim_retries: config.reservoir.claim_retries,
        flush_max_retries: config.flush.max_retries,
        page_bytes: config.sg.page_bytes,
        page_entries: config.sg.page_entries,
        min_unit: config.sg.min_unit,
        scratch_bytes: config.scratch_bytes,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize config")?
        );
    } else {
        println!("Revo effective configuration");
        println!("target_depth: {}", output.target_depth);
        println!("descriptor_budget: {}", output.descriptor_budget);
        println!("block_bytes: {}", output.block_bytes);
        println!("claim_retries: {}", output.claim_retries);
        println!("flush_max_retries: {}", output.flush_max_retries);
        println!("page_bytes: {}", output.page_bytes);
        println!("page_entries: {}", output.page_entries);
        println!("min_unit: {}", output.min_unit);
        println!("scratch_bytes: {}", output.scratch_bytes);
    }
    Ok(())
}
