use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use textbridge::agent::{AgentHooks, AgentLoop, IterationResult, TaskOutcome};
use textbridge::compiler::{CommandCompiler, Compiler, NoopCompiler};
use textbridge::config::Config;
use textbridge::events::{EventBus, EventType, Subsystem};
use textbridge::llm::{ModelClient, OpenAiClient, ScriptedModel};
use textbridge::logging;
use textbridge::metrics::LoopMetrics;
use textbridge::protocol::{translate, BlockRegistry, CommandStreamParser, ExecutableUnit};
use textbridge::workspace::DiskWorkspace;

#[derive(Parser, Debug)]
#[command(name = "textbridge", version, about = "Drive a code-writing model through a streamed text protocol")]
struct Cli {
    /// Project directory the model works in
    #[arg(long, global = true, default_value = ".")]
    workdir: PathBuf,

    /// Override the iteration ceiling
    #[arg(long, global = true)]
    max_iterations: Option<usize>,

    /// Print Prometheus metrics when the task ends
    #[arg(long, global = true)]
    metrics: bool,

    /// Echo the model output and debug logs
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a task against a live OpenAI-compatible model
    Run {
        #[arg(long)]
        task: String,
        #[arg(long, env = "TEXTBRIDGE_MODEL")]
        model: Option<String>,
        #[arg(long, env = "TEXTBRIDGE_BASE_URL")]
        base_url: Option<String>,
    },
    /// Run a task against recorded responses, one file per iteration
    Replay {
        #[arg(long)]
        task: String,
        #[arg(required = true)]
        responses: Vec<PathBuf>,
        /// Characters per streamed chunk
        #[arg(long, default_value_t = 16)]
        chunk_size: usize,
    },
    /// Print the commands decoded from a response file
    Parse {
        file: PathBuf,
        #[arg(long, default_value_t = 16)]
        chunk_size: usize,
    },
}

/// Prints progress to stderr and, when verbose, the model text to stdout
struct ConsoleHooks {
    echo: bool,
}

impl AgentHooks for ConsoleHooks {
    fn on_stream_content(&self, content: &str) {
        if self.echo {
            use std::io::Write;
            print!("{}", content);
            let _ = std::io::stdout().flush();
        }
    }

    fn on_unit_executed(&self, unit: &ExecutableUnit) {
        let status = if unit.success { "ok" } else { "FAILED" };
        let partial = if unit.complete { "" } else { " (incomplete)" };
        eprintln!("  [{}] {}{}", status, unit.describe(), partial);
    }

    fn on_iteration_finished(&self, iteration: usize, result: &IterationResult) {
        if !result.discarded_units.is_empty() {
            eprintln!(
                "  iteration {}: {} operation(s) discarded",
                iteration,
                result.discarded_units.len()
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = Config::load(&cli.workdir)?;
    let level = if cli.verbose { "debug" } else { config.log.level() };
    logging::init(level)?;

    if let Some(n) = cli.max_iterations {
        config.agent.max_iterations = Some(n);
    }

    match &cli.command {
        Command::Parse { file, chunk_size } => parse_file(file, *chunk_size),
        Command::Run {
            task,
            model,
            base_url,
        } => {
            if model.is_some() {
                config.model.model = model.clone();
            }
            if base_url.is_some() {
                config.model.base_url = base_url.clone();
            }
            let client = OpenAiClient::new(
                config.model.base_url(),
                config.model.model(),
                config.model.resolve_api_key(),
            )?
            .with_temperature(config.model.temperature)
            .with_max_tokens(config.model.max_tokens);
            finish(run_task(&cli, &config, Arc::new(client), task).await?)
        }
        Command::Replay {
            task,
            responses,
            chunk_size,
        } => {
            let model = ScriptedModel::from_files(responses)?.with_chunk_chars(*chunk_size);
            finish(run_task(&cli, &config, Arc::new(model), task).await?)
        }
    }
}

fn build_compiler(config: &Config, workdir: &Path) -> Result<Arc<dyn Compiler>> {
    let Some(command) = &config.compile.command else {
        return Ok(Arc::new(NoopCompiler));
    };
    let mut compiler = CommandCompiler::new(workdir, command, config.compile.timeout())?;
    if let Some(check) = &config.compile.check_command {
        compiler = compiler.with_check(check)?;
    }
    Ok(Arc::new(compiler))
}

async fn run_task(
    cli: &Cli,
    config: &Config,
    model: Arc<dyn ModelClient>,
    task: &str,
) -> Result<TaskOutcome> {
    let events = EventBus::new();
    let metrics = LoopMetrics::new()?;
    metrics.attach(&events);
    events.subscribe_filtered(vec![Subsystem::Run], |event| {
        if let EventType::IterationStarted { iteration } = &event.event_type {
            eprintln!("--- iteration {}", iteration);
        }
    });

    let workspace = Arc::new(DiskWorkspace::new(&cli.workdir));
    let compiler = build_compiler(config, &cli.workdir)?;
    let mut agent = AgentLoop::new(
        model,
        workspace,
        compiler,
        Arc::clone(&events),
        config.agent.loop_config(),
    )
    .with_hooks(Arc::new(ConsoleHooks { echo: cli.verbose }));

    let outcome = agent.run(task).await?;
    if cli.metrics {
        println!("{}", metrics.render()?);
        println!("{}", serde_json::to_string_pretty(&metrics.snapshot())?);
    }
    Ok(outcome)
}

fn finish(outcome: TaskOutcome) -> Result<()> {
    let status = if outcome.success { "completed" } else { "failed" };
    let title = outcome
        .title
        .as_deref()
        .map(|t| format!(" ({})", t))
        .unwrap_or_default();
    eprintln!(
        "Task {}{} after {} iteration(s): {}",
        status, title, outcome.iterations, outcome.message
    );
    if !outcome.success {
        std::process::exit(1);
    }
    Ok(())
}

fn parse_file(file: &Path, chunk_size: usize) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let blocks = BlockRegistry::builtin();
    let mut parser = CommandStreamParser::new(&blocks);

    let chars: Vec<char> = text.chars().collect();
    let mut commands = Vec::new();
    for piece in chars.chunks(chunk_size.max(1)) {
        commands.extend(parser.feed(&piece.iter().collect::<String>()));
    }
    commands.extend(parser.flush());

    for command in commands {
        let unit = translate(&blocks, command.clone());
        println!("{}", serde_json::to_string(&command)?);
        println!("  -> {}", unit.describe());
    }
    Ok(())
}
