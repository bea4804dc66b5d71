use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use scifi_readers::dataset::map_to_json;
use scifi_readers::{ingest, Dataset, MetaValue, ReaderKind};

#[derive(Parser)]
#[command(name = "scifi-readers")]
#[command(version, about = "Read scientific instrument files into datasets", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display the datasets extracted from a file
    Info {
        /// Path to the data file
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Force a specific reader instead of probing
        #[arg(short, long, value_name = "NAME")]
        reader: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// List the registered readers
    Readers {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Print the instrument metadata of the first dataset
    Metadata {
        /// Path to the data file
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Force a specific reader instead of probing
        #[arg(short, long, value_name = "NAME")]
        reader: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Download a data file from a URL
    Fetch {
        /// Source URL
        url: String,

        /// Destination directory
        #[arg(short = 'p', long = "path", value_name = "DIR", default_value = ".")]
        dest: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Info { input, reader, json } => {
            let datasets = read_with(&input, reader.as_deref())?;
            print_info(&input, &datasets, json);
        }
        Commands::Readers { json } => print_readers(json),
        Commands::Metadata { input, reader, json } => {
            let datasets = read_with(&input, reader.as_deref())?;
            print_metadata(&datasets, json)?;
        }
        Commands::Fetch { url, dest } => {
            let saved = fetch(&url, &dest)?;
            println!("Saved to {}", saved.display());
        }
    }

    Ok(())
}

fn read_with(input: &Path, forced: Option<&str>) -> anyhow::Result<Vec<Dataset>> {
    match forced {
        Some(name) => {
            let kind = ReaderKind::from_name(name)
                .with_context(|| format!("unknown reader '{}', see the readers command", name))?;
            Ok(kind.read(input)?)
        }
        None => Ok(ingest(input)?),
    }
}

fn print_info(input: &Path, datasets: &[Dataset], json: bool) {
    if json {
        let entries: Vec<serde_json::Value> = datasets
            .iter()
            .map(|ds| {
                serde_json::json!({
                    "title": ds.title,
                    "kind": ds.data_kind,
                    "dtype": ds.data.dtype(),
                    "shape": ds.shape(),
                    "quantity": ds.quantity,
                    "units": ds.units,
                    "modality": ds.modality,
                    "source": ds.source,
                    "dims": ds.dims.iter().map(|d| {
                        serde_json::json!({
                            "name": d.name,
                            "quantity": d.quantity,
                            "units": d.units,
                            "kind": d.kind,
                            "length": d.len(),
                        })
                    }).collect::<Vec<_>>(),
                })
            })
            .collect();
        let output = serde_json::json!({
            "file": input.display().to_string(),
            "count": datasets.len(),
            "datasets": entries,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).expect("JSON serialization failed")
        );
    } else {
        println!("=== {} ===", input.display());
        println!("Datasets: {}\n", datasets.len());
        for (i, ds) in datasets.iter().enumerate() {
            let shape = ds
                .shape()
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(" x ");
            println!("[{}] {}", i, ds.title);
            println!("    Kind: {}", ds.data_kind);
            println!("    Data: {} ({})", shape, ds.data.dtype());
            println!("    Quantity: {} [{}]", ds.quantity, ds.units);
            println!("    Source: {}", ds.source);
            for dim in &ds.dims {
                println!(
                    "    Axis {}: {} [{}], {}, {} points",
                    dim.name,
                    dim.quantity,
                    dim.units,
                    dim.kind,
                    dim.len()
                );
            }
            println!();
        }
    }
}

fn print_readers(json: bool) {
    if json {
        let entries: Vec<serde_json::Value> = ReaderKind::ALL
            .iter()
            .map(|kind| {
                serde_json::json!({
                    "name": kind.name(),
                    "description": kind.description(),
                    "extensions": kind.extensions(),
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).expect("JSON serialization failed")
        );
    } else {
        println!("Registered readers ({} total):", ReaderKind::ALL.len());
        for kind in ReaderKind::ALL {
            println!(
                "  {:<12} {} [{}]",
                kind.name(),
                kind.description(),
                kind.extensions().join(", ")
            );
        }
    }
}

fn print_metadata(datasets: &[Dataset], json: bool) -> anyhow::Result<()> {
    let first = datasets
        .first()
        .context("the file produced no datasets")?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&map_to_json(&first.original_metadata))
                .expect("JSON serialization failed")
        );
    } else {
        print_meta_map(&first.original_metadata, 0);
    }
    Ok(())
}

fn print_meta_map(map: &scifi_readers::MetaMap, indent: usize) {
    let pad = "  ".repeat(indent);
    for (key, value) in map {
        match value {
            MetaValue::Map(nested) => {
                println!("{}{}:", pad, key);
                print_meta_map(nested, indent + 1);
            }
            MetaValue::List(items) => {
                println!("{}{}: [{} items]", pad, key, items.len());
            }
            other => {
                println!("{}{}: {}", pad, key, scalar_text(other));
            }
        }
    }
}

fn scalar_text(value: &MetaValue) -> String {
    match value {
        MetaValue::Bool(v) => v.to_string(),
        MetaValue::Int(v) => v.to_string(),
        MetaValue::UInt(v) => v.to_string(),
        MetaValue::Float(v) => v.to_string(),
        MetaValue::String(v) => v.clone(),
        MetaValue::Bytes(v) => format!("<{} bytes>", v.len()),
        MetaValue::List(items) => format!("[{} items]", items.len()),
        MetaValue::Map(map) => format!("{{{} entries}}", map.len()),
    }
}

/// Download `url` into `dest`, naming the file after the last URL path
/// segment. Existing files are never overwritten.
fn fetch(url: &str, dest: &Path) -> anyhow::Result<PathBuf> {
    let name = filename_from_url(url);
    std::fs::create_dir_all(dest)
        .with_context(|| format!("cannot create {}", dest.display()))?;
    let target = dest.join(name);
    anyhow::ensure!(
        !target.exists(),
        "refusing to overwrite {}",
        target.display()
    );

    let response = reqwest::blocking::get(url).with_context(|| format!("GET {}", url))?;
    anyhow::ensure!(
        response.status().is_success(),
        "server returned {} for {}",
        response.status(),
        url
    );

    let bar = match response.content_length() {
        Some(len) => {
            let bar = ProgressBar::new(len);
            bar.set_style(
                ProgressStyle::with_template(
                    "{bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})",
                )
                .expect("progress template"),
            );
            bar
        }
        None => ProgressBar::new_spinner(),
    };

    let mut source = bar.wrap_read(response);
    let mut file = File::create(&target)
        .with_context(|| format!("cannot create {}", target.display()))?;
    std::io::copy(&mut source, &mut file)
        .with_context(|| format!("writing {}", target.display()))?;
    bar.finish_and_clear();
    Ok(target)
}

/// Last non-empty path segment of the URL, query and fragment stripped.
fn filename_from_url(url: &str) -> String {
    let trimmed = url.split(&['?', '#'][..]).next().unwrap_or(url);
    trimmed
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|seg| !seg.is_empty() && !seg.contains(':'))
        .unwrap_or("download.bin")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::filename_from_url;

    #[test]
    fn filenames_derive_from_the_last_url_segment() {
        assert_eq!(filename_from_url("https://host/data/scan.gwy"), "scan.gwy");
        assert_eq!(filename_from_url("https://host/scan.spe?dl=1"), "scan.spe");
        assert_eq!(filename_from_url("https://host/data/"), "data");
        assert_eq!(filename_from_url("https://host:8080/"), "download.bin");
    }
}
