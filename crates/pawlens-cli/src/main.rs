use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pawlens_contracts::events::EventWriter;
use pawlens_contracts::profile::{PetProfile, PetStatus};
use pawlens_contracts::tasks::{AnalysisTask, TaskRegistry};
use pawlens_engine::{
    AnalysisEngine, AnalysisInput, AnalysisOutcome, DryrunService, GeminiService, RemoteInference,
};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "pawlens", version, about = "Pet media analysis over the Gemini API")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Assess a pet video's mood.
    Video(MediaArgs),
    /// Judge ingredient quality from a food label or bowl photo.
    Image(MediaArgs),
    /// Draft a one-day feeding plan from a pet profile.
    Plan(PlanArgs),
}

#[derive(Debug, Parser)]
struct MediaArgs {
    /// Media file to analyze.
    #[arg(long)]
    file: PathBuf,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Parser)]
struct PlanArgs {
    #[arg(long)]
    breed: String,
    /// Age in years.
    #[arg(long)]
    age: f64,
    /// Body weight in kilograms.
    #[arg(long)]
    weight: f64,
    /// neutered, intact, overweight, senior or growing.
    #[arg(long, default_value = "neutered")]
    status: PetStatus,
    /// Free-text food preference interpolated into the prompt.
    #[arg(long)]
    preference: Option<String>,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Parser)]
struct CommonArgs {
    /// Override the candidate model list for this task, cheapest first.
    /// Repeat the flag once per model.
    #[arg(long = "model")]
    models: Vec<String>,
    /// Append pipeline events to this events.jsonl path.
    #[arg(long)]
    events: Option<PathBuf>,
    /// API key; defaults to GEMINI_API_KEY or GOOGLE_API_KEY.
    #[arg(long)]
    api_key: Option<String>,
    /// Answer from the offline stand-in service instead of the remote API.
    #[arg(long)]
    dryrun: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("pawlens error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Video(args) => run_media(AnalysisTask::VideoMood, args),
        Command::Image(args) => run_media(AnalysisTask::ImageIngredients, args),
        Command::Plan(args) => run_plan(args),
    }
}

fn run_media(task: AnalysisTask, args: MediaArgs) -> Result<i32> {
    let bytes = fs::read(&args.file)
        .with_context(|| format!("failed reading {}", args.file.display()))?;
    let declared_name = args
        .file
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("upload.bin")
        .to_string();
    let engine = build_engine(&args.common, task)?;
    let outcome = engine.analyze(
        task,
        AnalysisInput::Media {
            bytes,
            declared_name,
        },
    )?;
    print_outcome(&outcome)?;
    Ok(0)
}

fn run_plan(args: PlanArgs) -> Result<i32> {
    let profile = PetProfile {
        breed: args.breed.clone(),
        age_years: args.age,
        weight_kg: args.weight,
        status: args.status,
        preference: args.preference.clone(),
    };
    let engine = build_engine(&args.common, AnalysisTask::DietPlan)?;
    let outcome = engine.analyze(AnalysisTask::DietPlan, AnalysisInput::Profile(profile))?;
    print_outcome(&outcome)?;
    Ok(0)
}

fn build_engine(common: &CommonArgs, task: AnalysisTask) -> Result<AnalysisEngine> {
    let service: Box<dyn RemoteInference> = if common.dryrun {
        Box::new(DryrunService)
    } else {
        let api_key = common
            .api_key
            .clone()
            .or_else(|| non_empty_env("GEMINI_API_KEY"))
            .or_else(|| non_empty_env("GOOGLE_API_KEY"))
            .context(
                "no API key: pass --api-key, set GEMINI_API_KEY / GOOGLE_API_KEY, or use --dryrun",
            )?;
        Box::new(GeminiService::new(api_key))
    };
    let mut registry = TaskRegistry::default();
    if !common.models.is_empty() {
        registry
            .set_candidates(task, common.models.clone())
            .map_err(|message| anyhow::anyhow!(message))?;
    }
    let events = match &common.events {
        Some(path) => Some(
            EventWriter::create(path, uuid::Uuid::new_v4().to_string())
                .with_context(|| format!("failed opening event stream {}", path.display()))?,
        ),
        None => None,
    };
    Ok(AnalysisEngine::new(service, registry, events))
}

fn print_outcome(outcome: &AnalysisOutcome) -> Result<()> {
    let rendered = serde_json::to_string_pretty(&json!({
        "model": outcome.model,
        "record": outcome.record.to_value(),
    }))?;
    println!("{rendered}");
    Ok(())
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
