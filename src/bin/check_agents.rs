//! Validate an agent registry file and print its hand-off graph.

use anyhow::Context;
use parley::{AgentRegistry, ParleyConfig};
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parley=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("parley-check failed: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        None | Some("help" | "--help" | "-h") => {
            print_usage();
            Ok(())
        }
        Some(path) => {
            check_registry(Path::new(path))?;
            if let Some(config) = args.get(2) {
                check_config(Path::new(config))?;
            }
            Ok(())
        }
    }
}

fn check_registry(path: &Path) -> anyhow::Result<()> {
    let registry = AgentRegistry::from_file(path)
        .with_context(|| format!("invalid agent registry {}", path.display()))?;
    println!(
        "{} agents, entry point: {}",
        registry.len(),
        registry.entry_point()
    );
    for (agent, edges) in registry.handoff_graph() {
        if edges.is_empty() {
            println!("{agent}");
            continue;
        }
        for (tool, target) in edges {
            println!("{agent} --{tool}--> {target}");
        }
    }
    Ok(())
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = ParleyConfig::from_file(path)
        .with_context(|| format!("invalid config {}", path.display()))?;
    println!(
        "config ok: queue capacity {}, barge-in threshold {} chars, cycle depth {}",
        config.turn_queue.capacity,
        config.recognition.min_partial_chars,
        config.handoff.cycle_depth
    );
    Ok(())
}

fn print_usage() {
    println!("usage: parley-check <agents.toml> [parley.toml]");
}
