use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use secrecy::SecretString;

use place_verifier::config::{GENERATOR_KEY_ALIAS, PLACES_KEY_ALIAS, STORAGE_TOKEN_ALIAS};
use place_verifier::regions::{self, RegionTier};
use place_verifier::rejects::RejectLog;
use place_verifier::{
    AppContext, Category, JobSpec, PlaceMention, RegistrationRequest, ReverifyOptions, RunOptions,
};

#[derive(Parser, Debug)]
#[command(
    name = "place-verifier",
    version,
    about = "Generates place candidates and keeps only those a map search confirms"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate and verify candidates for one region or a whole tier.
    Run(RunArgs),
    /// Retry name mismatches from a reject file with looser matching.
    Reverify(ReverifyArgs),
    /// Verify and store places mentioned in a JSON file.
    Register(RegisterArgs),
    /// List reject side files awaiting reverification.
    Rejects,
    /// List known regions.
    Regions,
    /// Print the effective configuration without secrets.
    Config,
    /// Manage credentials kept in the OS keychain.
    Credentials {
        #[command(subcommand)]
        action: CredentialAction,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, required_unless_present = "tier", conflicts_with = "tier")]
    region: Option<String>,

    /// Required with --region; optional with --tier.
    #[arg(long)]
    category: Option<String>,

    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=3))]
    tier: Option<u8>,

    /// Verify without writing to the place store.
    #[arg(long)]
    dry_run: bool,

    /// Delete existing rows for each region/category first.
    #[arg(long)]
    replace: bool,

    /// Target candidate count per job.
    #[arg(long)]
    count: Option<usize>,

    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ReverifyArgs {
    #[arg(long)]
    region: String,

    #[arg(long)]
    category: String,

    /// Only retry entries naming a well-known chain.
    #[arg(long)]
    priority: bool,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct RegisterArgs {
    /// JSON file with a registration request or a bare list of mentions.
    #[arg(long, value_name = "FILE")]
    file: PathBuf,

    #[arg(long)]
    region_hint: Option<String>,
}

#[derive(Subcommand, Debug)]
enum CredentialAction {
    /// Store a credential. Reads the value from stdin when omitted.
    Set {
        name: CredentialName,
        value: Option<String>,
    },
    Delete {
        name: CredentialName,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CredentialName {
    Places,
    Generator,
    Storage,
}

impl CredentialName {
    fn alias(self) -> &'static str {
        match self {
            CredentialName::Places => PLACES_KEY_ALIAS,
            CredentialName::Generator => GENERATOR_KEY_ALIAS,
            CredentialName::Storage => STORAGE_TOKEN_ALIAS,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let context = AppContext::initialize().context("initializing")?;

    match cli.command {
        Command::Run(args) => run(&context, args).await,
        Command::Reverify(args) => reverify(&context, args).await,
        Command::Register(args) => register(&context, args).await,
        Command::Rejects => {
            let log = RejectLog::new(&context.config().rejects_dir);
            for file in log.list()? {
                println!(
                    "{:<12} {:<11} {:>4}  {}",
                    file.region,
                    file.category.as_str(),
                    file.entries,
                    file.path.display()
                );
            }
            Ok(())
        }
        Command::Regions => {
            for region in regions::REGIONS {
                println!(
                    "{:<12} tier {}  {} / {}",
                    region.key, region.tier as u8, region.label, region.native_label
                );
            }
            Ok(())
        }
        Command::Config => {
            println!(
                "{}",
                serde_json::to_string_pretty(&context.config().public_profile())?
            );
            Ok(())
        }
        Command::Credentials { action } => credentials(&context, action),
    }
}

async fn run(context: &AppContext, args: RunArgs) -> Result<()> {
    let category = args.category.as_deref().map(Category::parse).transpose()?;
    let jobs = match (&args.region, args.tier) {
        (Some(region), _) => {
            let region = regions::require(region)?;
            let Some(category) = category else {
                bail!("--category is required with --region");
            };
            vec![JobSpec::new(region.key, category)]
        }
        (None, Some(tier)) => JobSpec::for_tier(RegionTier::parse(tier)?, category),
        (None, None) => bail!("either --region or --tier is required"),
    };

    let pipeline = context.pipeline()?;
    let report = pipeline
        .run(
            &jobs,
            RunOptions {
                dry_run: args.dry_run,
                replace: args.replace,
                count: args.count,
            },
        )
        .await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report.summary())?);
    } else {
        print!("{report}");
    }
    if !report.failed_jobs().is_empty() && report.failed_jobs().len() == report.jobs.len() {
        bail!("every job failed");
    }
    Ok(())
}

async fn reverify(context: &AppContext, args: ReverifyArgs) -> Result<()> {
    let region = regions::require(&args.region)?;
    let category = Category::parse(&args.category)?;
    let report = context
        .reverifier()?
        .reverify(
            region.key,
            category,
            ReverifyOptions {
                priority_only: args.priority,
                dry_run: args.dry_run,
            },
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn register(context: &AppContext, args: RegisterArgs) -> Result<()> {
    let raw = std::fs::read_to_string(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    let mut request = match serde_json::from_str::<RegistrationRequest>(&raw) {
        Ok(request) => request,
        Err(_) => RegistrationRequest {
            mentions: serde_json::from_str::<Vec<PlaceMention>>(&raw)
                .with_context(|| format!("parsing {}", args.file.display()))?,
            region_hint: None,
        },
    };
    if args.region_hint.is_some() {
        request.region_hint = args.region_hint;
    }

    let registrar = Arc::new(context.registrar()?);
    let report = registrar
        .submit(request)
        .await
        .context("registration task panicked")??;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn credentials(context: &AppContext, action: CredentialAction) -> Result<()> {
    match action {
        CredentialAction::Set { name, value } => {
            let value = match value {
                Some(value) => value,
                None => {
                    let mut line = String::new();
                    io::stdin().lock().read_line(&mut line)?;
                    line
                }
            };
            let value = value.trim();
            if value.is_empty() {
                bail!("empty credential");
            }
            context
                .vault()
                .write_secret(name.alias(), &SecretString::new(value.into()))?;
            println!("stored {}", name.alias());
        }
        CredentialAction::Delete { name } => {
            context.vault().delete(name.alias())?;
            println!("deleted {}", name.alias());
        }
    }
    Ok(())
}
