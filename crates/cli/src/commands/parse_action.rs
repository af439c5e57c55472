//! `toolwright parse-action`: Parse text-marker actions from model output.

use std::io::Read;
use std::path::Path;

use toolwright_engine::{ScaleFactors, parse_prediction};

use super::load_config;

/// Parse `WIDTH,HEIGHT` (or `WIDTHxHEIGHT`) into scale factors.
fn parse_factors(raw: &str) -> Result<ScaleFactors, String> {
    let (w, h) = raw
        .split_once(',')
        .or_else(|| raw.split_once(['x', 'X']))
        .ok_or_else(|| format!("expected WIDTH,HEIGHT, got '{raw}'"))?;
    let parse = |s: &str| -> Result<f64, String> {
        let value: f64 = s.trim().parse().map_err(|_| format!("'{}' is not a number", s.trim()))?;
        if value.is_finite() && value > 0.0 {
            Ok(value)
        } else {
            Err(format!("scale factors must be positive, got {value}"))
        }
    };
    Ok(ScaleFactors {
        width: parse(w)?,
        height: parse(h)?,
    })
}

pub async fn run(
    text: Option<String>,
    factors: Option<String>,
    config: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let factors = match factors {
        Some(raw) => parse_factors(&raw)?,
        None => {
            let [width, height] = load_config(config)?.engine.factors;
            ScaleFactors { width, height }
        }
    };

    let text = match text {
        Some(text) => text,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let actions = parse_prediction(&text, &factors);
    tracing::debug!(count = actions.len(), "Parsed actions");
    println!("{}", serde_json::to_string_pretty(&actions)?);
    Ok(())
}
