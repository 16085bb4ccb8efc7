use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use indicatif::{ProgressBar, ProgressStyle};
use lazarus_core::search::{find_by_name, select_strategy};
use lazarus_core::{
	copy_node, mount_volumes, open_path, try_load, Disk, FileSystem, Node, NodeMetadata, ReadPolicy,
	ScanConfig, ScanProgress, ScanState, Scanner,
};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "lazarus", version, about = "Lazarus - deleted file recovery for NTFS and FAT volumes")]
#[command(group(ArgGroup::new("action").required(true).args(["list_disks", "list_files", "dump_file"])))]
struct Cli {
	/// Disk image or block device (repeatable, or comma separated in LAZARUS_DISKS)
	#[arg(long = "disk", env = "LAZARUS_DISKS", value_delimiter = ',')]
	disks: Vec<PathBuf>,

	/// List disks and the volumes found on them
	#[arg(long)]
	list_disks: bool,

	/// Scan a volume (e.g. disk0p1) and list its deleted files
	#[arg(long, value_name = "VOLUME")]
	list_files: Option<String>,

	/// Write a file's contents to stdout
	#[arg(long, num_args = 2, value_names = ["VOLUME", "NAME"])]
	dump_file: Option<Vec<String>>,

	/// Search strategy (mft-scan, folder-walk, cluster-scan)
	#[arg(long)]
	strategy: Option<String>,

	/// Fail on unreadable sectors and broken chains instead of zero-filling
	#[arg(long)]
	strict: bool,

	/// JSON scan configuration file
	#[arg(long, value_name = "FILE")]
	config: Option<PathBuf>,

	/// Print listings as JSON
	#[arg(long)]
	json: bool,

	/// Log engine progress to stderr
	#[arg(short, long)]
	verbose: bool,
}

#[derive(Serialize)]
struct VolumeListing {
	disk: String,
	path: String,
	label: String,
	partition_type: Option<u8>,
	filesystem: Option<String>,
	description: Option<String>,
}

fn main() -> ExitCode {
	let cli = match Cli::try_parse() {
		Ok(cli) => cli,
		Err(e) => {
			let _ = e.print();
			// --help and --version end up here too
			return if e.use_stderr() { ExitCode::from(1) } else { ExitCode::SUCCESS };
		}
	};

	// Logs go to stderr so --dump-file output stays clean
	tracing_subscriber::fmt()
		.with_writer(io::stderr)
		.with_max_level(if cli.verbose { tracing::Level::INFO } else { tracing::Level::WARN })
		.init();

	match run(cli) {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			eprintln!("❌ {:#}", e);
			ExitCode::from(1)
		}
	}
}

fn load_config(cli: &Cli) -> Result<ScanConfig> {
	let mut config = match &cli.config {
		Some(path) => ScanConfig::from_json_file(path)?,
		None => ScanConfig::default(),
	};
	if cli.strict {
		config.read_policy = ReadPolicy::Strict;
	}
	if cli.strategy.is_some() {
		config.strategy = cli.strategy.clone();
	}
	Ok(config)
}

fn open_disks(cli: &Cli, policy: ReadPolicy) -> Vec<(PathBuf, Disk)> {
	let mut disks = Vec::new();
	for (index, path) in cli.disks.iter().enumerate() {
		match Disk::open(path, index, policy) {
			Ok(disk) => disks.push((path.clone(), disk)),
			Err(e) => eprintln!("⚠️  Skipping {}: {:#}", path.display(), e),
		}
	}
	disks
}

fn run(cli: Cli) -> Result<()> {
	let config = load_config(&cli)?;
	if cli.disks.is_empty() {
		println!("No disks given; use --disk or set LAZARUS_DISKS");
		return Ok(());
	}
	let disks = open_disks(&cli, config.read_policy);

	if cli.list_disks {
		return list_disks(&disks, &config, cli.json);
	}

	let (volume, name) = match (&cli.list_files, &cli.dump_file) {
		(Some(volume), _) => (volume.as_str(), None),
		(None, Some(args)) if args.len() == 2 => (args[0].as_str(), Some(args[1].as_str())),
		_ => anyhow::bail!("nothing to do"),
	};

	let Some(fs) = find_volume(&disks, volume, &config)? else {
		println!("Volume {} not found", volume);
		return Ok(());
	};

	match name {
		None => list_files(fs, &config, cli.json),
		Some(name) => dump_file(fs, &config, name),
	}
}

fn list_disks(disks: &[(PathBuf, Disk)], config: &ScanConfig, json: bool) -> Result<()> {
	let mut listings = Vec::new();
	for (path, disk) in disks {
		for volume in &disk.volumes {
			let fs = match try_load(volume.stream.clone(), &volume.label, config) {
				Ok(fs) => fs,
				Err(e) => {
					tracing::warn!("{}: {:#}", volume.label, e);
					None
				}
			};
			listings.push(VolumeListing {
				disk: disk.label.clone(),
				path: path.display().to_string(),
				label: volume.label.clone(),
				partition_type: volume.partition_type,
				filesystem: fs.as_ref().map(|fs| fs.fs_type().to_string()),
				description: fs.as_ref().map(|fs| fs.describe()),
			});
		}
	}

	if json {
		println!("{}", serde_json::to_string_pretty(&listings)?);
		return Ok(());
	}

	let mut current_disk = None;
	for listing in &listings {
		if current_disk != Some(&listing.disk) {
			println!("💾 {}  {}", listing.disk, listing.path);
			current_disk = Some(&listing.disk);
		}
		match &listing.description {
			Some(description) => println!("   {}", description),
			None => println!("   {}  (no recognised file system)", listing.label),
		}
	}
	Ok(())
}

fn find_volume(
	disks: &[(PathBuf, Disk)],
	label: &str,
	config: &ScanConfig,
) -> Result<Option<Arc<dyn FileSystem>>> {
	for (_, disk) in disks {
		if let Some(volume) = disk.volume(label) {
			return try_load(volume.stream.clone(), &volume.label, config);
		}
		// A whole-disk volume also answers to its first partition's name
		if disk.volumes.len() == 1 && label.eq_ignore_ascii_case(&format!("{}p1", disk.label)) {
			return Ok(mount_volumes(disk, config).into_iter().next());
		}
	}
	Ok(None)
}

fn progress_bar() -> ProgressBar {
	if !atty::is(atty::Stream::Stderr) {
		return ProgressBar::hidden();
	}
	let bar = ProgressBar::new(1000);
	bar.set_style(
		ProgressStyle::with_template("{spinner} [{elapsed_precise}] {wide_bar} {msg}")
			.unwrap_or_else(|_| ProgressStyle::default_bar()),
	);
	bar
}

fn list_files(fs: Arc<dyn FileSystem>, config: &ScanConfig, json: bool) -> Result<()> {
	let scanner = Scanner::new(fs.clone(), config.clone());
	let progress = scanner.progress();
	scanner.start_scan()?;

	let bar = progress_bar();
	for message in progress.iter() {
		match message {
			ScanProgress::Started { strategy, .. } => {
				bar.set_message(format!("{} on {}", strategy, fs.label()))
			}
			ScanProgress::Progress { fraction, visited, found } => {
				bar.set_position((fraction * 1000.0) as u64);
				bar.set_message(format!("{} visited, {} deleted", visited, found));
			}
			ScanProgress::Failed { message } => {
				bar.finish_and_clear();
				anyhow::bail!("scan failed: {}", message);
			}
			final_message @ (ScanProgress::Finished { .. } | ScanProgress::Cancelled { .. }) => {
				bar.finish_and_clear();
				tracing::info!("{:?}", final_message);
				break;
			}
		}
	}
	if scanner.wait() != ScanState::Finished {
		anyhow::bail!("scan did not finish");
	}

	let files = scanner.deleted_files();
	let stdout = io::stdout();
	let mut out = BufWriter::new(stdout.lock());
	if json {
		serde_json::to_writer_pretty(&mut out, &files)?;
		writeln!(out)?;
	} else {
		for file in &files {
			print_entry(&mut out, file)?;
		}
		writeln!(out, "{} deleted entries on {}", files.len(), fs.label())?;
	}
	out.flush()?;
	Ok(())
}

fn print_entry(out: &mut impl Write, file: &NodeMetadata) -> io::Result<()> {
	let kind = if file.is_folder() { "dir " } else { "file" };
	let modified = file
		.modified
		.map(|time| time.format("%Y-%m-%d %H:%M").to_string())
		.unwrap_or_else(|| "-".repeat(16));
	writeln!(
		out,
		"{}  {:>12}  {}  {:<21}  {}",
		kind,
		file.size,
		modified,
		file.recovery.to_string(),
		file.display_path()
	)
}

fn dump_file(fs: Arc<dyn FileSystem>, config: &ScanConfig, name: &str) -> Result<()> {
	let meta = if name.contains('/') {
		open_path(fs.as_ref(), name)?.map(Node::into_meta)
	} else {
		let strategy = select_strategy(fs.clone(), config.strategy.as_deref())
			.with_context(|| format!("no search strategy available on {}", fs.label()))?;
		find_by_name(strategy.as_ref(), name)?
	};

	let Some(meta) = meta else {
		eprintln!("File {} not found on {}", name, fs.label());
		return Ok(());
	};
	if meta.is_folder() {
		anyhow::bail!("{} is a folder", meta.display_path());
	}

	let stdout = io::stdout();
	let mut out = BufWriter::new(stdout.lock());
	let written = copy_node(fs.as_ref(), &meta, &mut out)?;
	tracing::info!("Wrote {} bytes of {}", written, meta.display_path());
	Ok(())
}
