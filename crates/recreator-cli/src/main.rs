use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use recreator_core::{
	deserialize_archive_file, BackupLayout, BackupRecreation, ConversionTable, ManifestDb,
	RecreateConfig, ResolverConfig, RunSummary, DEFAULT_BATCH_SIZE,
};
use tracing::Level;

#[derive(Parser, Debug)]
#[command(name = "recreator", version, about = "Recreate the original file layout of a device backup")]
struct Cli {
	/// Log every entry step
	#[arg(long, short, global = true, conflicts_with = "quiet")]
	verbose: bool,
	/// Only log warnings and errors
	#[arg(long, short, global = true)]
	quiet: bool,
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Recreate the file tree and metadata index of a backup
	Recreate {
		/// Backup directory (contains Manifest.plist, Info.plist and Manifest.db)
		backup_dir: PathBuf,
		/// Output directory; a Device_<serial>_Folders directory is created inside it
		#[arg(long)]
		out: PathBuf,
		/// Worker threads for decode and copy
		#[arg(long, default_value_t = 1)]
		workers: usize,
		/// Metadata rows buffered before each index flush
		#[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
		batch_size: usize,
		/// Maximum nesting depth when resolving archived objects
		#[arg(long, default_value_t = 64)]
		max_depth: usize,
		/// Reference hops followed per value
		#[arg(long, default_value_t = 1)]
		max_hops: usize,
		/// Values resolved per metadata record before it is rejected
		#[arg(long, default_value_t = 100_000)]
		max_nodes: usize,
		/// Decode archives structurally, without common object conversions
		#[arg(long)]
		structural: bool,
		/// Print the run summary as JSON
		#[arg(long)]
		json: bool,
	},
	/// Show backup descriptor information
	Inspect {
		backup_dir: PathBuf,
	},
	/// Resolve a standalone keyed archive file and print it as JSON
	Deserialize {
		plist_file: PathBuf,
		/// Decode structurally, without common object conversions
		#[arg(long)]
		structural: bool,
	},
}

fn conversions(structural: bool) -> ConversionTable {
	if structural {
		ConversionTable::Structural
	} else {
		ConversionTable::Common
	}
}

fn main() -> Result<()> {
	let cli = Cli::parse();

	let level = if cli.verbose {
		Level::DEBUG
	} else if cli.quiet {
		Level::WARN
	} else {
		Level::INFO
	};
	tracing_subscriber::fmt()
		.with_max_level(level)
		.with_writer(std::io::stderr)
		.init();

	match cli.command {
		Commands::Recreate {
			backup_dir,
			out,
			workers,
			batch_size,
			max_depth,
			max_hops,
			max_nodes,
			structural,
			json,
		} => {
			let config = RecreateConfig {
				batch_size,
				resolver: ResolverConfig {
					max_depth,
					max_reference_hops: max_hops,
					max_nodes,
				},
				conversions: conversions(structural),
				workers,
				..Default::default()
			};

			let mut recreation = match BackupRecreation::prepare(&backup_dir, &out, config) {
				Ok(recreation) => recreation,
				Err(e) => {
					eprintln!("❌ Cannot recreate {}: {}", backup_dir.display(), e);
					return Err(e.into());
				}
			};

			let layout = recreation.layout();
			if !json {
				println!("📱 Device: {} ({})", layout.device_name.as_deref().unwrap_or("unknown"), layout.serial_number);
			}

			let progress = if json || cli.quiet {
				ProgressBar::hidden()
			} else {
				let bar = ProgressBar::new(0);
				bar.set_style(
					ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
						.context("Invalid progress template")?,
				);
				bar
			};
			let bar = progress.clone();
			recreation.recreator_mut().set_progress_callback(move |update| {
				if let Some(total) = update.total_entries {
					bar.set_length(total);
				}
				bar.set_position(update.entries_processed);
				bar.set_message(update.current_path.clone());
			});

			let report = recreation.run()?;
			progress.finish_and_clear();

			if json {
				println!("{}", serde_json::to_string_pretty(&report)?);
			} else {
				println!("✅ Recreation completed");
				println!("📁 File tree: {}", report.recreated_tree.display());
				println!("🗃️  Metadata index: {}", report.metadata_index.display());
				print_summary(&report.summary);
			}
		}
		Commands::Inspect { backup_dir } => {
			println!("🔍 Inspecting backup: {}", backup_dir.display());
			let layout = BackupLayout::read(&backup_dir)?;

			println!("📱 Device Name: {}", layout.device_name.as_deref().unwrap_or("unknown"));
			println!("🔢 Serial Number: {}", layout.serial_number);
			if let Some(version) = &layout.product_version {
				println!("🧾 Product Version: {}", version);
			}
			if let Some(version) = &layout.version {
				println!("📦 Backup Version: {}", version);
			}
			println!("🔒 Encrypted: {}", if layout.is_encrypted { "yes" } else { "no" });
			if !layout.has_status {
				println!("⚠️  Status.plist not found");
			}

			match layout.require_manifest_db() {
				Ok(path) => {
					let manifest = ManifestDb::open(path)?;
					println!("📈 Manifest Entries: {}", manifest.count()?);
				}
				Err(e) => println!("❌ {}", e),
			}
		}
		Commands::Deserialize { plist_file, structural } => {
			let value = deserialize_archive_file(&plist_file, conversions(structural), ResolverConfig::default())?;
			println!("{}", serde_json::to_string_pretty(&value)?);
		}
	}
	Ok(())
}

fn print_summary(summary: &RunSummary) {
	println!("📊 Entries Processed: {}", summary.entries_processed);
	println!("📂 Directories Created: {}", summary.directories_created);
	println!("📄 Files Copied: {} ({} bytes)", summary.files_copied, summary.bytes_copied);
	if summary.unsupported_entries > 0 {
		println!("❔ Unsupported Entries: {}", summary.unsupported_entries);
	}
	println!("🗂️  Index Rows Written: {}", summary.index.rows_written);
	if summary.entries_with_errors() > 0 {
		println!("⚠️  Entries With Errors: {}", summary.entries_with_errors());
		println!("   decode: {}, reconstruction: {}, manifest: {}",
			summary.decode_failures, summary.reconstruction_failures, summary.manifest_row_failures);
	}
	if summary.timestamp_failures > 0 {
		println!("⏱️  Timestamp Restore Failures: {}", summary.timestamp_failures);
	}
	if summary.index.rows_failed > 0 {
		println!("❌ Index Rows Lost: {}", summary.index.rows_failed);
	}
	if summary.cancelled {
		println!("🛑 Run was cancelled before completion");
	}
}
