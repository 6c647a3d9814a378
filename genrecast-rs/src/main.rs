use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::*;
use genrecast::dataset::{prepare_dataset, PrepareOptions, SplitRatios};
use genrecast::{
    expand_audio_files, DummyClassifier, GenreScore, GenreService, LastFmClient, ServiceConfig,
};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "genrecast", about = "Music genre classification and recommendations")]
struct Args {
    /// Service config JSON (defaults to the 5 s GTZAN preset)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend: dummy | tract (requires --model)
    #[arg(long, global = true, default_value = "dummy")]
    backend: String,

    /// ONNX model; its manifest (<model>.json or manifest.json) sits next to it
    #[arg(long, global = true)]
    model: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rank genres for files or directories of audio
    Predict {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        #[arg(long = "top-k", default_value_t = 3)]
        top_k: usize,

        /// Output JSON (array) to stdout only
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Show pretty table (stderr); disable with --show-table false
        #[arg(long = "show-table", default_value_t = true, action = clap::ArgAction::Set)]
        show_table: bool,
    },
    /// Last.fm tracks for the predicted top genre (needs LASTFM_API_KEY)
    Recommend {
        path: PathBuf,

        #[arg(long, default_value_t = 5)]
        limit: usize,

        /// Skip per-track album art lookups
        #[arg(long, default_value_t = false)]
        no_images: bool,
    },
    /// Print model and feature metadata as JSON
    Info,
    /// Build train/val/test feature records from raw/<genre>/<audio>
    Prepare {
        raw: PathBuf,
        out: PathBuf,

        #[arg(long, default_value_t = 42)]
        seed: u64,

        #[arg(long, default_value_t = 0.8)]
        train: f32,

        #[arg(long, default_value_t = 0.1)]
        val: f32,

        #[arg(long, default_value_t = 0.1)]
        test: f32,

        /// Also write each window as WAV
        #[arg(long, default_value_t = false)]
        write_windows: bool,
    },
}

#[derive(Serialize)]
struct FilePrediction {
    file: PathBuf,
    genres: Vec<GenreScore>,
}

fn load_config(args: &Args) -> anyhow::Result<ServiceConfig> {
    match &args.config {
        Some(path) => ServiceConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(ServiceConfig::default()),
    }
}

fn build_service(args: &Args) -> anyhow::Result<GenreService> {
    let config = load_config(args)?;
    match args.backend.as_str() {
        "dummy" => {
            let clf = DummyClassifier::new(config.label_order.len());
            Ok(GenreService::new(config, clf)?)
        }
        #[cfg(feature = "tract")]
        "tract" => {
            let model = args
                .model
                .as_ref()
                .context("--model is required for the tract backend")?;
            GenreService::from_model(model, config)
                .with_context(|| format!("loading model {}", model.display()))
        }
        other => bail!("unknown backend {:?}", other),
    }
}

fn format_genres(genres: &[GenreScore]) -> String {
    genres
        .iter()
        .map(|g| format!("{} {:.3}", g.label, g.confidence))
        .collect::<Vec<_>>()
        .join(", ")
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("genrecast=info"))
        .init();
    let args = Args::parse();

    match &args.command {
        Command::Predict {
            paths,
            top_k,
            json,
            show_table,
        } => {
            let service = build_service(&args)?;
            let files = expand_audio_files(paths.clone())?;
            if files.is_empty() {
                bail!("no supported audio files in the given paths");
            }
            let mut results = Vec::new();
            let mut failed = 0usize;
            for file in files {
                match service.predict_genres(file.clone(), *top_k) {
                    Ok(genres) => results.push(FilePrediction { file, genres }),
                    Err(e) => {
                        failed += 1;
                        eprintln!("{} {}: {}", "error".red().bold(), file.display(), e);
                    }
                }
            }

            // Table to stderr if requested
            if *show_table && !*json {
                let mut table = comfy_table::Table::new();
                table.set_header(vec!["File".bold(), "Genres (top-k)".bold()]);
                for r in &results {
                    let fname = r.file.file_name().and_then(|s| s.to_str()).unwrap_or("?");
                    table.add_row(vec![fname.to_string(), format_genres(&r.genres)]);
                }
                eprintln!("{}", "Predictions".green().bold());
                eprintln!("{}", table);
            }
            println!("{}", serde_json::to_string_pretty(&results)?);
            if failed > 0 {
                bail!("{} file(s) could not be classified", failed);
            }
        }
        Command::Recommend {
            path,
            limit,
            no_images,
        } => {
            let mut client = LastFmClient::from_env()?;
            if *no_images {
                client = client.without_images();
            }
            let service = build_service(&args)?.with_recommender(client);
            let recs = service
                .get_recommendations(path.clone(), *limit)
                .with_context(|| format!("recommendations for {}", path.display()))?;
            if let Some(first) = recs.first() {
                let mut table = comfy_table::Table::new();
                table.set_header(vec!["#".bold(), "Title".bold(), "Artist".bold()]);
                for r in &recs {
                    table.add_row(vec![r.rank.to_string(), r.title.clone(), r.artist.clone()]);
                }
                eprintln!("{} {}", "Top tracks for".green().bold(), first.genre.as_str().bold());
                eprintln!("{}", table);
            }
            println!("{}", serde_json::to_string_pretty(&recs)?);
        }
        Command::Info => {
            let service = build_service(&args)?;
            println!("{}", serde_json::to_string_pretty(&service.info())?);
        }
        Command::Prepare {
            raw,
            out,
            seed,
            train,
            val,
            test,
            write_windows,
        } => {
            let config = load_config(&args)?;
            let opts = PrepareOptions {
                ratios: SplitRatios {
                    train: *train,
                    val: *val,
                    test: *test,
                },
                seed: *seed,
                write_windows: *write_windows,
            };
            let summary = prepare_dataset(raw, out, &config, &opts)
                .with_context(|| format!("preparing dataset from {}", raw.display()))?;
            eprintln!(
                "{} {} songs, {} windows, {} skipped",
                "Prepared".green().bold(),
                summary.songs,
                summary.windows,
                summary.skipped
            );
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}
