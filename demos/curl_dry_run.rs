//! Prints the curl command bulkhttp would have issued for a batch, without
//! sending anything. Run with: `cargo run --example curl_dry_run`.

use bulkhttp::{DataSource, DryRun, RunConfig};
use serde::{Deserialize, Serialize};

#[derive(Clone, Serialize, Deserialize)]
struct Event {
    id: u32,
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), bulkhttp::Error> {
    let records = vec![
        Event { id: 1, name: "Alice".into() },
        Event { id: 2, name: "Bob".into() },
    ];

    let config = RunConfig::builder("https://example.com/ingest", DataSource::Materialized(records))
        .batch_size(2)
        .dry_run(DryRun::Curl)
        .header("Authorization", "Bearer token")
        .build()?;

    let summary = bulkhttp::run(config).await?;
    for entry in &summary.responses {
        if let bulkhttp::ResponseEntry::Curl(command) = entry {
            println!("{command}");
        }
    }

    Ok(())
}
