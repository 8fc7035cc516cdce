//! Command surface of the `gm` binary.
//!
//! Every command opens the store at `--db`, applies migrations and prints a
//! pretty JSON report on stdout. Logs and progress bars go to stderr.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use glyph_match_core::{
    alpha_mask, analyze_gray_background, choose_rgb_background, flatten, hash_file, list_pngs,
    match_glyphs, merge_alpha, pairwise_distances, restore_alpha, subview, GlyphHashRow, GlyphHashes, GlyphName,
    GrayBackground, HashConfig, MatchOptions, MatchSummary, PixelBox, ReferenceHashRow,
    ReferenceName, RestoreStats, RgbBackground, DEFAULT_RESTORE_THRESHOLD,
};
use glyph_match_store_sqlite::{ExportTable, SqliteGlyphStore};
use image::{RgbImage, RgbaImage};
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Placeholder glyph in the `sbix` strike; it has no artwork worth analysing.
const HIDDEN_GLYPH: &str = "glyph-hiddenglyph.png";

#[derive(Debug, Parser)]
#[command(name = "gm")]
#[command(about = "Glyph perceptual-hash matching CLI")]
pub struct Cli {
    #[arg(long, default_value = "./glyph_match.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Hash a directory of glyphs or reference images into the store.
    Hash {
        #[command(subcommand)]
        command: Box<HashCommand>,
    },
    /// Match stored glyphs against stored references.
    Join(JoinArgs),
    /// Write every comparable glyph/reference distance triple as TSV.
    Distances(DistancesArgs),
    /// Write a stored table as TSV.
    Export(ExportArgs),
    /// List glyphs without any match.
    Unmatched,
    Summary,
    Background {
        #[command(subcommand)]
        command: Box<BackgroundCommand>,
    },
    Composite {
        #[command(subcommand)]
        command: Box<CompositeCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum HashCommand {
    Glyphs(HashArgs),
    References(HashArgs),
}

#[derive(Debug, Args)]
pub struct HashArgs {
    #[arg(long)]
    dir: PathBuf,
    #[arg(long, default_value_t = 32)]
    resize: u32,
    #[arg(long, default_value_t = 16)]
    hash_size: u32,
    #[arg(long, default_value_t = 12)]
    color_bits: u32,
}

#[derive(Debug, Args)]
pub struct JoinArgs {
    /// Keep every equally-distant hash candidate.
    #[arg(long)]
    no_tie_break: bool,
    /// Write the references claimed by codepoint, one per line.
    #[arg(long)]
    claimed_out: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct DistancesArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(value_enum)]
    table: ExportTableArg,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum BackgroundCommand {
    Gray(DirArgs),
    Rgb(DirArgs),
}

#[derive(Debug, Args)]
pub struct DirArgs {
    #[arg(long)]
    dir: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum CompositeCommand {
    /// Flatten glyphs onto their stored background.
    Flatten(FlattenArgs),
    /// Save each glyph's alpha channel as a grayscale image.
    ExtractAlpha(ExtractAlphaArgs),
    /// Put source alpha back onto enlarged, flattened glyphs.
    RestoreAlpha(RestoreAlphaArgs),
    /// Compare a source region with the same region of its enlargement.
    Subview(SubviewArgs),
}

#[derive(Debug, Args)]
pub struct FlattenArgs {
    #[arg(long)]
    dir: PathBuf,
    #[arg(long)]
    out_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = BackgroundModeArg::Gray)]
    mode: BackgroundModeArg,
}

#[derive(Debug, Args)]
pub struct ExtractAlphaArgs {
    #[arg(long)]
    dir: PathBuf,
    #[arg(long)]
    out_dir: PathBuf,
}

#[derive(Debug, Args)]
pub struct RestoreAlphaArgs {
    #[arg(long)]
    enlarged_dir: PathBuf,
    #[arg(long)]
    source_dir: PathBuf,
    #[arg(long)]
    out_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = BackgroundModeArg::Gray)]
    mode: BackgroundModeArg,
    #[arg(long, default_value_t = DEFAULT_RESTORE_THRESHOLD)]
    threshold: u8,
    /// Take alpha from enlarged masks in this directory instead of the source glyph.
    #[arg(long)]
    alpha_dir: Option<PathBuf>,
    #[arg(long)]
    overwrite: bool,
}

#[derive(Debug, Args)]
pub struct SubviewArgs {
    #[arg(long)]
    source: PathBuf,
    #[arg(long)]
    enlarged: PathBuf,
    /// Region of the source image as `x0,y0,x1,y1`.
    #[arg(long = "box")]
    bounds: PixelBox,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    allow_rounding: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ExportTableArg {
    Glyphs,
    References,
    Matches,
    Multimatches,
    GrayBackgrounds,
    RgbBackgrounds,
}

impl From<ExportTableArg> for ExportTable {
    fn from(value: ExportTableArg) -> Self {
        match value {
            ExportTableArg::Glyphs => Self::Glyphs,
            ExportTableArg::References => Self::References,
            ExportTableArg::Matches => Self::Matches,
            ExportTableArg::Multimatches => Self::Multimatches,
            ExportTableArg::GrayBackgrounds => Self::GrayBackgrounds,
            ExportTableArg::RgbBackgrounds => Self::RgbBackgrounds,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackgroundModeArg {
    Gray,
    Rgb,
}

#[derive(Debug, Serialize)]
struct HashReport {
    kind: &'static str,
    dir: String,
    config: HashConfig,
    hashed: usize,
    skipped: Vec<String>,
}

#[derive(Debug, Serialize)]
struct JoinReport {
    summary: MatchSummary,
    rows_written: usize,
    unmatched: Vec<String>,
    claimed_out: Option<String>,
}

#[derive(Debug, Serialize)]
struct FileReport {
    out: String,
    rows: usize,
}

#[derive(Debug, Serialize)]
struct UnmatchedReport {
    count: usize,
    glyphs: Vec<String>,
}

#[derive(Debug, Serialize)]
struct BatchReport {
    mode: &'static str,
    written: usize,
    skipped: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RestoreReport {
    written: usize,
    skipped: Vec<String>,
    stats: RestoreStats,
}

#[derive(Debug, Serialize)]
struct SubviewReport {
    out: String,
    width: u32,
    height: u32,
}

/// Installs the stderr log subscriber; `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Executes a parsed `gm` invocation.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, or when the
/// requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = open_store(&cli.db)?;
    run_command(cli.command, &mut store)
}

fn open_store(db: &Path) -> Result<SqliteGlyphStore> {
    let store = SqliteGlyphStore::open(db)?;
    store.migrate()?;
    Ok(store)
}

/// Executes a store-backed command against an existing store handle.
///
/// # Errors
/// Returns an error when reading inputs, persisting results or writing
/// outputs fails.
pub fn run_command(command: Command, store: &mut SqliteGlyphStore) -> Result<()> {
    match command {
        Command::Hash { command } => {
            let report = match *command {
                HashCommand::Glyphs(args) => hash_glyphs(&args, store)?,
                HashCommand::References(args) => hash_references(&args, store)?,
            };
            print_json(&report)
        }
        Command::Join(args) => {
            let glyphs = store.list_glyph_hashes()?;
            let references = store.list_reference_hashes()?;
            tracing::info!(
                glyphs = glyphs.len(),
                references = references.len(),
                "matching glyphs"
            );
            let options = MatchOptions {
                tie_break: !args.no_tie_break,
            };
            let report = match_glyphs(&glyphs, &references, &options);
            let rows_written = store.replace_matches(&report)?;

            if let Some(path) = &args.claimed_out {
                let mut out = create_output(path)?;
                for filename in &report.codepoint_claimed {
                    writeln!(out, "{filename}")
                        .with_context(|| format!("failed to write {}", path.display()))?;
                }
                out.flush()
                    .with_context(|| format!("failed to write {}", path.display()))?;
            }

            print_json(&JoinReport {
                summary: report.summary(),
                rows_written,
                unmatched: report.unmatched,
                claimed_out: args.claimed_out.map(|path| path.display().to_string()),
            })
        }
        Command::Distances(args) => {
            let glyphs = store.list_glyph_hashes()?;
            let references = store.list_reference_hashes()?;
            let mut tsv = csv::WriterBuilder::new()
                .delimiter(b'\t')
                .has_headers(false)
                .from_writer(create_output(&args.out)?);
            let mut rows = 0_usize;
            for pair in pairwise_distances(&glyphs, &references) {
                tsv.write_record([
                    pair.glyph_filename,
                    pair.reference_filename,
                    pair.average.to_string(),
                    pair.color.to_string(),
                    pair.difference.to_string(),
                ])
                .with_context(|| format!("failed to write {}", args.out.display()))?;
                rows += 1;
            }
            tsv.flush()
                .with_context(|| format!("failed to write {}", args.out.display()))?;
            print_json(&FileReport {
                out: args.out.display().to_string(),
                rows,
            })
        }
        Command::Export(args) => {
            let rows = store.export_tsv(args.table.into(), create_output(&args.out)?)?;
            print_json(&FileReport {
                out: args.out.display().to_string(),
                rows,
            })
        }
        Command::Unmatched => {
            let glyphs = store.unmatched_glyphs()?;
            print_json(&UnmatchedReport {
                count: glyphs.len(),
                glyphs,
            })
        }
        Command::Summary => print_json(&store.summary()?),
        Command::Background { command } => {
            let (args, mode) = match *command {
                BackgroundCommand::Gray(args) => (args, BackgroundModeArg::Gray),
                BackgroundCommand::Rgb(args) => (args, BackgroundModeArg::Rgb),
            };
            print_json(&analyze_backgrounds(&args.dir, mode, store)?)
        }
        Command::Composite { command } => run_composite(*command, store),
    }
}

fn run_composite(command: CompositeCommand, store: &SqliteGlyphStore) -> Result<()> {
    match command {
        CompositeCommand::Flatten(args) => run_flatten(&args, store),
        CompositeCommand::RestoreAlpha(args) => run_restore_alpha(&args, store),
        CompositeCommand::ExtractAlpha(args) => run_extract_alpha(&args),
        CompositeCommand::Subview(args) => run_subview(&args),
    }
}

fn print_json<T: Serialize>(report: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

fn hash_config(args: &HashArgs) -> Result<HashConfig> {
    let config = HashConfig {
        resize: args.resize,
        hash_size: args.hash_size,
        color_bits: args.color_bits,
    };
    config.validate()?;
    Ok(config)
}

fn progress_bar(len: usize, prefix: &'static str) -> Result<ProgressBar> {
    let bar = ProgressBar::new(u64::try_from(len).unwrap_or(u64::MAX));
    bar.set_style(
        ProgressStyle::with_template("{prefix:>10} [{bar:40}] {pos}/{len} ({eta})")
            .context("invalid progress bar template")?
            .progress_chars("=> "),
    );
    bar.set_prefix(prefix);
    Ok(bar)
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("file name is not valid UTF-8: {}", path.display()))
}

/// Hashes every PNG under `dir` in parallel; files that fail are logged and
/// reported back by name instead of aborting the batch.
fn hash_dir<T, F>(
    dir: &Path,
    prefix: &'static str,
    config: &HashConfig,
    row: F,
) -> Result<(Vec<T>, Vec<String>)>
where
    T: Send,
    F: Fn(String, GlyphHashes) -> Result<T> + Sync,
{
    let paths = list_pngs(dir)?;
    let bar = progress_bar(paths.len(), prefix)?;

    let results = paths
        .par_iter()
        .progress_with(bar.clone())
        .map(|path| {
            let filename = file_name(path)?;
            let hashes = hash_file(path, config)?;
            row(filename, hashes)
        })
        .collect::<Vec<_>>();
    bar.finish_and_clear();

    let mut rows = Vec::with_capacity(results.len());
    let mut skipped = Vec::new();
    for (path, result) in paths.iter().zip(results) {
        match result {
            Ok(value) => rows.push(value),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping file");
                skipped.push(path.display().to_string());
            }
        }
    }
    Ok((rows, skipped))
}

fn hash_glyphs(args: &HashArgs, store: &mut SqliteGlyphStore) -> Result<HashReport> {
    let config = hash_config(args)?;
    let (rows, skipped) = hash_dir(&args.dir, "glyphs", &config, |filename, hashes| {
        let name = GlyphName::parse(&filename)?;
        Ok(GlyphHashRow {
            filename: name.filename,
            codepoint_part: name.codepoint_part,
            hashes,
        })
    })?;
    let hashed = store.upsert_glyph_hashes(&rows)?;
    tracing::info!(hashed, skipped = skipped.len(), "hashed glyphs");
    Ok(HashReport {
        kind: "glyphs",
        dir: args.dir.display().to_string(),
        config,
        hashed,
        skipped,
    })
}

fn hash_references(args: &HashArgs, store: &mut SqliteGlyphStore) -> Result<HashReport> {
    let config = hash_config(args)?;
    let (rows, skipped) = hash_dir(&args.dir, "references", &config, |filename, hashes| {
        let name = ReferenceName::parse(&filename)?;
        Ok(ReferenceHashRow {
            filename: name.filename,
            descriptor: name.descriptor,
            codepoint: name.codepoint,
            hashes,
        })
    })?;
    let hashed = store.upsert_reference_hashes(&rows)?;
    tracing::info!(hashed, skipped = skipped.len(), "hashed references");
    Ok(HashReport {
        kind: "references",
        dir: args.dir.display().to_string(),
        config,
        hashed,
        skipped,
    })
}

fn open_rgba(path: &Path) -> Result<RgbaImage> {
    Ok(image::open(path)
        .with_context(|| format!("failed to read image {}", path.display()))?
        .to_rgba8())
}

fn open_rgb(path: &Path) -> Result<RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("failed to read image {}", path.display()))?
        .to_rgb8())
}

fn create_output(path: &Path) -> Result<BufWriter<File>> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory {}", path.display()))
}

fn mode_name(mode: BackgroundModeArg) -> &'static str {
    match mode {
        BackgroundModeArg::Gray => "gray",
        BackgroundModeArg::Rgb => "rgb",
    }
}

/// Glyph PNGs worth compositing, in file-name order.
fn artwork_pngs(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    list_pngs(dir)?
        .into_iter()
        .map(|path| Ok((file_name(&path)?, path)))
        .filter(|entry| !matches!(entry, Ok((name, _)) if name == HIDDEN_GLYPH))
        .collect()
}

enum Analysis {
    Gray(GrayBackground),
    Rgb(Option<RgbBackground>),
}

fn analyze(image: &RgbaImage, mode: BackgroundModeArg) -> Analysis {
    match mode {
        BackgroundModeArg::Gray => Analysis::Gray(analyze_gray_background(image)),
        BackgroundModeArg::Rgb => Analysis::Rgb(choose_rgb_background(image)),
    }
}

fn analyze_backgrounds(
    dir: &Path,
    mode: BackgroundModeArg,
    store: &SqliteGlyphStore,
) -> Result<BatchReport> {
    let files = artwork_pngs(dir)?;
    let bar = progress_bar(files.len(), "background")?;
    let analyses = files
        .par_iter()
        .progress_with(bar.clone())
        .map(|(_, path)| open_rgba(path).map(|image| analyze(&image, mode)))
        .collect::<Vec<_>>();
    bar.finish_and_clear();

    let mut written = 0_usize;
    let mut skipped = Vec::new();
    for ((filename, path), analysis) in files.iter().zip(analyses) {
        match analysis {
            Ok(Analysis::Gray(background)) => {
                if background.furthest_shade.is_none() {
                    tracing::warn!(%filename, "every gray shade occurs in the glyph");
                }
                store.upsert_gray_background(filename, &background)?;
                written += 1;
            }
            Ok(Analysis::Rgb(Some(background))) => {
                store.upsert_rgb_background(filename, &background)?;
                written += 1;
            }
            Ok(Analysis::Rgb(None)) => {
                tracing::warn!(%filename, "no rgb background is free of glyph colours");
                skipped.push(filename.clone());
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping file");
                skipped.push(filename.clone());
            }
        }
    }

    Ok(BatchReport {
        mode: mode_name(mode),
        written,
        skipped,
    })
}

/// The stored background for `filename`, analysed from `image` when the
/// store has none.
fn background_for(
    store: &SqliteGlyphStore,
    filename: &str,
    image: &RgbaImage,
    mode: BackgroundModeArg,
) -> Result<Option<[u8; 3]>> {
    match mode {
        BackgroundModeArg::Gray => {
            let stored = store.gray_background(filename)?;
            let background = match stored {
                Some(background) => background,
                None => {
                    tracing::debug!(%filename, "no stored gray background, analysing");
                    analyze_gray_background(image)
                }
            };
            Ok(background.furthest_shade.map(|shade| [shade; 3]))
        }
        BackgroundModeArg::Rgb => {
            let stored = match store.rgb_background(filename)? {
                Some(background) => Some(background),
                None => {
                    tracing::debug!(%filename, "no stored rgb background, analysing");
                    choose_rgb_background(image)
                }
            };
            Ok(stored.map(|background| background.rgb))
        }
    }
}

fn run_flatten(args: &FlattenArgs, store: &SqliteGlyphStore) -> Result<()> {
    ensure_dir(&args.out_dir)?;
    let mut written = 0_usize;
    let mut skipped = Vec::new();
    for (filename, path) in artwork_pngs(&args.dir)? {
        let image = match open_rgba(&path) {
            Ok(image) => image,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping file");
                skipped.push(filename);
                continue;
            }
        };
        let Some(background) = background_for(store, &filename, &image, args.mode)? else {
            tracing::warn!(%filename, "no usable background, not flattening");
            skipped.push(filename);
            continue;
        };
        let out = args.out_dir.join(&filename);
        flatten(&image, background)
            .save(&out)
            .with_context(|| format!("failed to write {}", out.display()))?;
        written += 1;
    }
    tracing::info!(written, skipped = skipped.len(), "flattened glyphs");
    print_json(&BatchReport {
        mode: mode_name(args.mode),
        written,
        skipped,
    })
}

fn run_extract_alpha(args: &ExtractAlphaArgs) -> Result<()> {
    ensure_dir(&args.out_dir)?;
    let mut written = 0_usize;
    let mut skipped = Vec::new();
    for (filename, path) in artwork_pngs(&args.dir)? {
        let image = match open_rgba(&path) {
            Ok(image) => image,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping file");
                skipped.push(filename);
                continue;
            }
        };
        let out = args.out_dir.join(&filename);
        alpha_mask(&image)
            .save(&out)
            .with_context(|| format!("failed to write {}", out.display()))?;
        written += 1;
    }
    tracing::info!(written, skipped = skipped.len(), "extracted alpha masks");
    print_json(&BatchReport {
        mode: "alpha",
        written,
        skipped,
    })
}

fn run_restore_alpha(args: &RestoreAlphaArgs, store: &SqliteGlyphStore) -> Result<()> {
    ensure_dir(&args.out_dir)?;
    let mut stats = RestoreStats::default();
    let mut written = 0_usize;
    let mut skipped = Vec::new();

    for (filename, enlarged_path) in artwork_pngs(&args.enlarged_dir)? {
        let out = args.out_dir.join(&filename);
        if out.exists() && !args.overwrite {
            tracing::debug!(path = %out.display(), "output exists, skipping");
            skipped.push(filename);
            continue;
        }
        let source_path = args.source_dir.join(&filename);
        if !source_path.exists() {
            tracing::warn!(%filename, "no source glyph for enlarged image");
            skipped.push(filename);
            continue;
        }

        let mask_path = args.alpha_dir.as_ref().map(|dir| dir.join(&filename));
        if let Some(mask_path) = mask_path.as_ref().filter(|path| !path.exists()) {
            tracing::warn!(path = %mask_path.display(), "no alpha mask for enlarged image");
            skipped.push(filename);
            continue;
        }

        let loaded = open_rgba(&source_path).and_then(|source| {
            let enlarged = open_rgb(&enlarged_path)?;
            let mask = mask_path.as_deref().map(open_rgb).transpose()?;
            Ok((source, enlarged, mask))
        });
        let (source, enlarged, mask) = match loaded {
            Ok(loaded) => loaded,
            Err(err) => {
                tracing::warn!(%filename, error = %err, "skipping file");
                skipped.push(filename);
                continue;
            }
        };
        let Some(background) = background_for(store, &filename, &source, args.mode)? else {
            tracing::warn!(%filename, "no usable background, not restoring");
            skipped.push(filename);
            continue;
        };
        let (restored, file_stats) = match &mask {
            Some(mask) => match merge_alpha(&enlarged, mask, background) {
                Ok(merged) => merged,
                Err(err) => {
                    tracing::warn!(%filename, error = %err, "skipping file");
                    skipped.push(filename);
                    continue;
                }
            },
            None => restore_alpha(&enlarged, &source, background, args.threshold),
        };
        restored
            .save(&out)
            .with_context(|| format!("failed to write {}", out.display()))?;
        stats.absorb(&file_stats);
        written += 1;
    }

    tracing::info!(
        written,
        decomposited = stats.decomposited,
        fallback = stats.fallback,
        "restored alpha"
    );
    print_json(&RestoreReport {
        written,
        skipped,
        stats,
    })
}

fn run_subview(args: &SubviewArgs) -> Result<()> {
    let source = open_rgba(&args.source)?;
    let enlarged = open_rgba(&args.enlarged)?;
    let view = subview(&source, &enlarged, args.bounds, args.allow_rounding)?;
    view.save(&args.out)
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    print_json(&SubviewReport {
        out: args.out.display().to_string(),
        width: view.width(),
        height: view.height(),
    })
}
