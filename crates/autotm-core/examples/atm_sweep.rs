//! ATM Sweep Tool
//!
//! Runs a reflection sweep and a small LUT generation, either against a real
//! ATM board or against the built-in simulator.
//!
//! Usage:
//!   cargo run --example atm_sweep -- [OPTIONS]
//!
//! Options:
//!   --port PORT       Serial port (default: simulator)
//!   --start MHZ       Sweep start (default: 81)
//!   --stop MHZ        Sweep stop (default: 83)
//!   --lut-step MHZ    LUT step over the same range (default: 0.5)
//!   --save-lut FILE   Write the generated LUT as JSON
//!
//! Set RUST_LOG=autotm_core=debug to see the protocol traffic.

use anyhow::{bail, Context, Result};
use autotm_core::prelude::*;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut port: Option<String> = None;
    let mut start = 81.0;
    let mut stop = 83.0;
    let mut lut_step = 0.5;
    let mut save_lut: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1).cloned();
        match args[i].as_str() {
            "--port" | "-p" => port = value,
            "--start" => start = value.context("--start needs a value")?.parse()?,
            "--stop" => stop = value.context("--stop needs a value")?.parse()?,
            "--lut-step" => lut_step = value.context("--lut-step needs a value")?.parse()?,
            "--save-lut" => save_lut = value,
            other => bail!("unknown argument '{}'", other),
        }
        i += 2;
    }

    let mut session = AtmSession::default();
    session.observe(|event| match event {
        AtmEvent::Info(text) => println!("[device] {}", text),
        AtmEvent::Error(text) => eprintln!("[error] {}", text),
        _ => {}
    });

    match &port {
        Some(name) => session.connect(name)?,
        None => {
            println!("No port given, using the simulator");
            let sim = SimulatedAtm::new();
            let model = *sim.model();
            let center = (start + stop) / 2.0;
            let tuning = ((center - model.base_frequency_mhz) / model.tuning_slope_mhz_per_v)
                .clamp(0.0, session.config().sweep.max_voltage);
            session.attach_transport(Box::new(sim));
            // park the simulated resonance in the middle of the sweep
            session.set_voltages(model.optimal_matching_v, tuning)?;
        }
    }

    session.start_measurement_sweep(start, stop)?;
    if !session.wait_until_idle(Duration::from_secs(30))? {
        bail!("sweep did not finish within 30s");
    }

    let detector = session.config().detector;
    if let Some(measurement) = session.measurement() {
        println!("Sweep: {} points", measurement.len());
        if let Some((frequency, return_loss)) = measurement.best_match(&detector) {
            println!(
                "Best match: {:.3} MHz at {:.1} dB return loss",
                frequency / 1e6,
                return_loss
            );
        }
    }

    session.generate_lut(start, stop, lut_step)?;
    if !session.wait_until_idle(Duration::from_secs(120))? {
        bail!("LUT generation did not finish within 120s");
    }

    if let Some(lut) = session.lut() {
        println!("{:>10} {:>10} {:>10}", "MHz", "tuning", "matching");
        for entry in lut.entries() {
            if let Some((tuning, matching)) = entry.voltages.pair() {
                println!("{:>10.3} {:>10.3} {:>10.3}", entry.frequency, tuning, matching);
            }
        }
    }

    if let Some(path) = save_lut {
        session.export_lut(&path)?;
        println!("LUT written to {}", path);
    }

    session.disconnect();
    Ok(())
}
