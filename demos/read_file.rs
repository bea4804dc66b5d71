use scifi_readers::{ingest, Result};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <path-to-data-file>", args[0]);
        std::process::exit(1);
    }

    let path = &args[1];
    let datasets = ingest(path)?;

    println!("=== {} ===", path);
    println!("Datasets: {}", datasets.len());

    for (i, ds) in datasets.iter().enumerate() {
        println!("\n[{}] {}", i, ds.summary());
        println!("=== Instrument Metadata ===");
        for (key, value) in &ds.original_metadata {
            println!("  {}: {:?}", key, value);
        }
    }

    Ok(())
}
