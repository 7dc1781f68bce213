//! Generate JSON Schema for the rwin configuration file
//!
//! Usage:
//!   cargo run --bin generate_schema > config-schema.json

use remote_window::config::Config;
use schemars::schema_for;

fn main() -> Result<(), serde_json::Error> {
    let schema = schema_for!(Config);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
