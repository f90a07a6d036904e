use std::{env, fs, time::Instant};

use anyhow::{Context, Result};
use log::info;
use pow_network_sim::prelude::*;
use simple_logger::SimpleLogger;

fn main() -> Result<()> {
    let config = match env::args().nth(1) {
        Some(path) => SimulationConfig::from_path(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => SimulationConfig::default(),
    };

    SimpleLogger::new()
        .with_level(config.log_level()?)
        .env()
        .init()?;

    let start = Instant::now();
    let output = config.output.clone();
    let num_selfish = config.selfish.len();
    let num_peers = config.peers;

    let results_builder = config.into_builder().build()?.run_all()?;

    if let Some(path) = &output.snapshot {
        let yaml = serde_yaml::to_string(&results_builder.snapshots())?;
        fs::write(path, yaml).with_context(|| {
            format!("writing snapshot to {}", path.display())
        })?;
        info!("wrote snapshot to {}", path.display());
    }

    // Per-peer columns for the selfish peers, or for everyone if all peers
    // are honest.
    let shown = if num_selfish > 0 { num_selfish } else { num_peers };
    let mut results = results_builder
        .only_peers((0..shown).map(PeerId::from))
        .all()
        .average(output.average)
        .format(output.format);
    if let (Some(gamma), true) = (output.gamma, num_selfish > 0) {
        results = results
            .constant("Gamma", gamma)
            .mining_power_func(
                PeerId::from(0),
                format!("Ideal SM Revenue (gamma={})", gamma),
                selfish_revenue(gamma),
            );
    }

    println!("{}", results.build());
    info!("elapsed time: {:.4} secs", start.elapsed().as_secs_f64());

    Ok(())
}
