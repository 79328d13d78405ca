//! Dump the wallet API's OpenAPI document
//!
//! ```text
//! cargo run --bin export_openapi                       # stdout
//! cargo run --bin export_openapi -- --output api.json  # file
//! ```

use anyhow::Context;
use utoipa::OpenApi;
use wallet_ledger::gateway::openapi::ApiDoc;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let output = args
        .iter()
        .position(|a| a == "--output" || a == "-o")
        .and_then(|i| args.get(i + 1));

    let json = ApiDoc::openapi()
        .to_pretty_json()
        .context("Failed to serialize OpenAPI document")?;

    match output {
        Some(path) => {
            std::fs::write(path, &json).with_context(|| format!("Failed to write {}", path))?;
            eprintln!("OpenAPI document written to {}", path);
        }
        None => println!("{}", json),
    }
    Ok(())
}
