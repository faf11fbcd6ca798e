//! Sample Request Generator
//!
//! Writes synthetic classify requests as newline-delimited JSON to stdout,
//! for piping into the classifier binary.
//!
//! Usage: sample_requests [count] [false_positive_rate] [invalid_rate] [seed]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::{json, Value};
use std::io::{BufWriter, Write};
use tracing::info;

/// Request line matching the classifier's input format
#[derive(Debug, Clone, Serialize)]
struct SampleRequest {
    id: String,
    orbital_period: Value,
    duration: Value,
    transit_depth: Value,
    radius: Value,
    star_temp: Value,
    star_radius: Value,
    model_snr: Value,
}

/// Request generator for testing
struct RequestGenerator {
    rng: StdRng,
    request_counter: u64,
}

impl RequestGenerator {
    fn new(seed: Option<u64>) -> Self {
        Self {
            rng: match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            },
            request_counter: 0,
        }
    }

    fn next_id(&mut self) -> String {
        self.request_counter += 1;
        format!("obs_{:08}", self.request_counter)
    }

    /// Small planet, shallow transit, strong detection
    fn generate_planet_like(&mut self) -> SampleRequest {
        SampleRequest {
            id: self.next_id(),
            orbital_period: json!(self.rng.gen_range(1.0..60.0)),
            duration: json!(self.rng.gen_range(1.5..6.0)),
            transit_depth: json!(self.rng.gen_range(80.0..2000.0)),
            radius: json!(self.rng.gen_range(0.8..4.0)),
            star_temp: json!(self.rng.gen_range(4500.0..6500.0)),
            star_radius: json!(self.rng.gen_range(0.7..1.3)),
            model_snr: json!(self.rng.gen_range(20.0..90.0)),
        }
    }

    /// Deep eclipse from an implausibly large companion
    fn generate_false_positive_like(&mut self) -> SampleRequest {
        SampleRequest {
            id: self.next_id(),
            orbital_period: json!(self.rng.gen_range(0.5..10.0)),
            duration: json!(self.rng.gen_range(1.0..4.0)),
            transit_depth: json!(self.rng.gen_range(8000.0..60000.0)),
            radius: json!(self.rng.gen_range(15.0..80.0)),
            star_temp: json!(self.rng.gen_range(5000.0..7500.0)),
            star_radius: json!(self.rng.gen_range(0.8..2.5)),
            model_snr: json!(self.rng.gen_range(8.0..40.0)),
        }
    }

    /// A planet-like request with one field blanked out or made non-numeric
    fn generate_invalid(&mut self) -> SampleRequest {
        let mut request = self.generate_planet_like();
        let broken = if self.rng.gen_bool(0.5) {
            json!("")
        } else {
            json!("n/a")
        };
        match self.rng.gen_range(0..3) {
            0 => request.model_snr = broken,
            1 => request.transit_depth = broken,
            _ => request.orbital_period = broken,
        }
        request
    }
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr, stdout carries the requests
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sample_requests=info".parse()?),
        )
        .init();

    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    let count: u64 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(100);
    let fp_rate: f64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(0.3);
    let invalid_rate: f64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(0.05);
    let seed: Option<u64> = args.get(4).and_then(|s| s.parse().ok());

    info!(
        count = count,
        fp_rate = fp_rate,
        invalid_rate = invalid_rate,
        seed = ?seed,
        "Configuration loaded"
    );

    let mut generator = RequestGenerator::new(seed);
    let mut out = BufWriter::new(std::io::stdout().lock());

    let mut planet_count = 0;
    let mut fp_count = 0;
    let mut invalid_count = 0;

    for _ in 0..count {
        let roll: f64 = generator.rng.gen();
        let request = if roll < invalid_rate.clamp(0.0, 1.0) {
            invalid_count += 1;
            generator.generate_invalid()
        } else if generator.rng.gen_bool(fp_rate.clamp(0.0, 1.0)) {
            fp_count += 1;
            generator.generate_false_positive_like()
        } else {
            planet_count += 1;
            generator.generate_planet_like()
        };

        serde_json::to_writer(&mut out, &request)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;

    info!(
        "Completed! Wrote {} requests ({} planet-like, {} false-positive-like, {} invalid)",
        count, planet_count, fp_count, invalid_count
    );

    Ok(())
}
