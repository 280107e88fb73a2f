//! sighting_report - list recorded sightings from the sighting database

use anyhow::Result;
use clap::Parser;

use sighting_kernel::storage::{RecordStore, SqliteRecordStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the sighting database.
    #[arg(long, env = "SIGHTING_DB_PATH", default_value = "sightings.db")]
    db_path: String,
    /// Only show sightings from this camera.
    #[arg(long)]
    camera: Option<String>,
    /// Maximum rows to print.
    #[arg(long, default_value_t = 20)]
    limit: usize,
    /// Print JSON instead of a table.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut store = SqliteRecordStore::open(&args.db_path)?;

    let rows = match &args.camera {
        Some(camera) => store.recent_for_camera(camera, args.limit)?,
        None => store.recent(args.limit)?,
    };
    let counts = store.counts_by_camera()?;

    if args.json {
        let report = serde_json::json!({ "recent": rows, "counts": counts });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("no sightings recorded in {}", args.db_path);
    } else {
        println!(
            "{:>6}  {:<19}  {:<20}  {:>6}  image",
            "id", "time", "camera", "conf"
        );
        for row in &rows {
            println!(
                "{:>6}  {:<19}  {:<20}  {:>5.1}%  {}",
                row.id, row.timestamp, row.camera_id, row.confidence, row.image_path
            );
        }
    }

    println!();
    println!("sightings per camera:");
    for (camera, count) in &counts {
        println!("  {:<20} {}", camera, count);
    }
    Ok(())
}
