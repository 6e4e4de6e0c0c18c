use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;

use cachesim_mesi::mesi::{CoreId, SimConfig};
use cachesim_mesi::utils::read_core_traces;
use cachesim_mesi::{SimReport, Simulation};

#[derive(Parser, Debug)]
#[command(
    name = "cachesim-mesi",
    about = "Simulate MESI-coherent private caches on a multi-core machine."
)]
struct Args {
    /// Number of cores; core i runs <input-dir>/<prefix><i>.txt
    #[arg(long, default_value_t = 2)]
    cores: usize,

    /// Cache lines per core
    #[arg(long, default_value_t = 2)]
    cache_lines: usize,

    /// Lines per set (1 = direct-mapped)
    #[arg(long, default_value_t = 1)]
    ways: usize,

    /// Words of main memory
    #[arg(long, default_value_t = 24)]
    memory_size: usize,

    /// Directory holding the per-core instruction files
    #[arg(long, value_name = "DIR", default_value = ".")]
    input_dir: PathBuf,

    /// File name prefix of the per-core instruction files
    #[arg(long, default_value = "input_")]
    prefix: String,

    /// Do not print a line per executed instruction
    #[arg(long, action = clap::ArgAction::SetTrue)]
    quiet: bool,

    /// Print cache contents and memory after the run
    #[arg(long, action = clap::ArgAction::SetTrue)]
    dump: bool,
}

fn main() -> anyhow::Result<()> {
    // logging
    let env = Env::default()
        .filter_or("MESI_LOG_LEVEL", "warn")
        .write_style_or("MESI_LOG_STYLE", "auto");
    env_logger::init_from_env(env);

    let args = Args::parse();
    let config = SimConfig {
        num_cores: args.cores,
        cache_lines: args.cache_lines,
        ways: args.ways,
        memory_size: args.memory_size,
    };
    let sim = Simulation::new(config).context("invalid machine configuration")?;
    let streams = read_core_traces(&args.input_dir, &args.prefix, args.cores)
        .context("failed to load instruction streams")?;

    let quiet = args.quiet;
    let report = sim.run_with(streams, |event| {
        if !quiet {
            println!("{event}");
        }
    })?;

    print_summary(&report);
    if args.dump {
        print_dump(&report);
    }
    Ok(())
}

fn print_summary(report: &SimReport) {
    println!();
    for core in &report.cores {
        let s = &core.stats;
        println!(
            "core {}: {} instructions ({} reads, {} writes), {} hits, {} misses, {} upgrades",
            core.id, s.executed, s.reads, s.writes, s.hits, s.misses, s.upgrades
        );
        if let Some(e) = &core.error {
            println!("core {}: stopped early: {}", core.id, e);
        }
    }
    let b = &report.bus;
    println!(
        "bus: {} transactions ({} read misses, {} write misses, {} upgrades)",
        b.transactions(),
        b.read_misses,
        b.write_misses,
        b.upgrades
    );
    println!(
        "bus: {} peer supplies, {} memory fills, {} invalidations, {} snoop write-backs",
        b.peer_supplies, b.memory_fills, b.invalidations, b.snoop_write_backs
    );
    println!("bus: {} evictions, {} with write-back", b.evictions, b.eviction_write_backs);
}

fn print_dump(report: &SimReport) {
    for (i, lines) in report.caches.iter().enumerate() {
        println!("Core {} cache:", CoreId(i));
        for line in lines {
            println!("\t{line}");
        }
    }
    println!("Memory:");
    for (addr, value) in report.memory.iter().enumerate() {
        println!("\t{addr:02}: {value}");
    }
}
