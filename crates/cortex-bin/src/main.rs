use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cortex_config::CortexConfig;

mod stats;
mod stub_llm;

use stub_llm::StubProvider;

/// Local inspection front end for the cortex router core.
#[derive(Parser)]
#[command(name = "cortex", version, about, long_about = None)]
struct Cli {
    /// Path to a cortex.toml config file (defaults embedded if absent)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single utterance through the routing cascade
    Route {
        utterance: String,
    },
    /// Print per-component row counts from every `.db` file
    Stats,
    /// Run the fixed exam question set through the non-LLM path
    Exam,
    /// Show the resolved configuration and any validation warnings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
}

fn init_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)))
        .with_target(false)
        .init();
}

fn load_config(path: Option<&std::path::Path>) -> CortexConfig {
    match path {
        Some(p) => CortexConfig::load(p).unwrap_or_default(),
        None => {
            let default_path = PathBuf::from("cortex.toml");
            if default_path.exists() {
                CortexConfig::load(&default_path).unwrap_or_default()
            } else {
                CortexConfig::default()
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    let config = load_config(cli.config.as_deref());

    let result = match cli.command {
        Commands::Route { utterance } => cmd_route(&config, &utterance).await,
        Commands::Stats => stats::cmd_stats(&config),
        Commands::Exam => cmd_exam(&config).await,
        Commands::Config { action } => match action {
            ConfigAction::Show => cmd_config_show(&config),
        },
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn cmd_route(config: &CortexConfig, utterance: &str) -> cortex_core::Result<()> {
    let mut patterns = cortex_patterns::LearnedPatterns::open(&config.db_path("learned_patterns"))?;
    let mut sentences = cortex_embeddings::SentenceEmbeddings::open(&config.db_path("sentence_embeddings"), config.embeddings.dim)?;
    let mut words = cortex_embeddings::WordEmbeddings::open(&config.db_path("word_embeddings"), config.embeddings.dim)?;
    let mut router = cortex_router::IntentRouter::new(config.routing.tier1_min_confidence, config.routing.tier25_threshold);
    let mut active_learning = cortex_learning::ActiveLearning::open(&config.db_path("active_learning"))?;

    let known_words_fraction = words.known_words_fraction(utterance);
    let decision = router.route(utterance, &mut patterns, &mut sentences, &mut words);

    let route_source_str = decision.as_ref().map(|d| match d.source {
        cortex_router::RouteSource::LearnedPattern => "learned_pattern",
        cortex_router::RouteSource::Rule => "rule",
        cortex_router::RouteSource::EmbeddingClassifier => "embedding_classifier",
    });
    let route_signal = decision.as_ref().map(|d| cortex_learning::RouteSignal {
        confidence: d.confidence,
        source: route_source_str.unwrap(),
        intent: d.intent.as_str(),
    });
    let assessment = active_learning.assess_confidence(utterance, route_signal, known_words_fraction, &[])?;

    match decision {
        Some(decision) => {
            println!("intent:      {}", decision.intent);
            println!("agent:       {}", decision.agent);
            println!("confidence:  {:.3}", decision.confidence);
            println!("source:      {:?}", decision.source);
            if !decision.slots.is_empty() {
                println!("slots:");
                for (k, v) in &decision.slots {
                    println!("  {k} = {v}");
                }
            }
        }
        None => {
            println!("no tier matched — would escalate to the LLM planner (tier 3)");
            let reply = StubProvider.canned_reply(utterance);
            println!("stub reply:  {reply}");
        }
    }
    println!("gated action: {:?} (confidence {:.3})", assessment.action, assessment.confidence);
    if let Some(phrase) = &assessment.phrase {
        println!("phrase:      {phrase}");
    }
    Ok(())
}

async fn cmd_exam(config: &CortexConfig) -> cortex_core::Result<()> {
    let mut self_play = cortex_learning::SelfPlay::open(&config.db_path("self_play"))?;
    let result = self_play.run_exam(|question| Ok(StubProvider.canned_reply(question))).await?;

    println!("questions:   {}", result.total_questions);
    println!("avg score:   {:.2}", result.avg_score);
    println!("pass rate:   {:.0}%", result.pass_rate * 100.0);
    if !result.by_category.is_empty() {
        println!("by category:");
        for (category, score) in &result.by_category {
            println!("  {category}: {score:.2}");
        }
    }
    for improvement in &result.improvements {
        println!("note: {improvement}");
    }
    Ok(())
}

fn cmd_config_show(config: &CortexConfig) -> cortex_core::Result<()> {
    println!("{config:#?}");
    let warnings = config.validate();
    if warnings.is_empty() {
        println!("\nno validation warnings");
    } else {
        println!("\nwarnings:");
        for warning in &warnings {
            println!("  {warning}");
        }
    }
    Ok(())
}
