use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::thread;
use wod_core::*;

/// Steps taken by `run` without a command list before giving up
const AUTO_STEP_LIMIT: usize = 10_000;

#[derive(Parser)]
#[command(name = "wod")]
#[command(about = "Workout script runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text, jsonl)
    #[arg(long, global = true)]
    format: Option<String>,

    /// Use this config file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script on a virtual clock
    Run {
        /// Parsed script (JSON)
        script: PathBuf,

        /// Comma-separated commands, e.g. "start,next,tick:500"
        #[arg(long)]
        commands: Option<String>,

        /// Print the final runtime snapshot as JSON
        #[arg(long)]
        snapshot: bool,
    },

    /// Show which strategy compiles each statement
    Inspect {
        /// Parsed script (JSON)
        script: PathBuf,
    },

    /// Run a script against the wall clock, reading commands from stdin
    Live {
        /// Parsed script (JSON)
        script: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    wod_core::logging::init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let format = match &cli.format {
        Some(f) => f.parse::<OutputFormat>()?,
        None => config.output.format,
    };

    match cli.command {
        Commands::Run {
            script,
            commands,
            snapshot,
        } => cmd_run(&script, commands.as_deref(), snapshot, format, &config),
        Commands::Inspect { script } => cmd_inspect(&script),
        Commands::Live { script } => cmd_live(&script, format, &config),
    }
}

/// One step of a scripted session
#[derive(Debug, PartialEq)]
enum Step {
    Event(EventKind),
    /// Advance the clock by this many ms, then tick
    Tick(i64),
}

fn parse_steps(commands: &str, tick_interval_ms: u64) -> Result<Vec<Step>> {
    commands
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|c| match c.split_once(':') {
            Some(("tick", ms)) => ms
                .trim()
                .parse::<i64>()
                .map(Step::Tick)
                .map_err(|_| Error::Other(format!("Invalid tick duration: {}", ms))),
            Some(_) => Err(Error::Other(format!("Unknown command: {}", c))),
            None if c.eq_ignore_ascii_case("tick") => Ok(Step::Tick(tick_interval_ms as i64)),
            None => c.parse::<EventKind>().map(Step::Event),
        })
        .collect()
}

fn make_sink(format: OutputFormat, config: &Config) -> Box<dyn ActionSink> {
    match format {
        OutputFormat::Text => Box::new(TextSink { out: io::stdout() }),
        OutputFormat::Jsonl => Box::new(JsonlSink::new(io::stdout(), config.cast.clone())),
    }
}

fn cmd_run(
    path: &Path,
    commands: Option<&str>,
    snapshot: bool,
    format: OutputFormat,
    config: &Config,
) -> Result<()> {
    let script = Script::load_validated(path)?;
    tracing::info!(path = %path.display(), ?format, "Running script on virtual clock");
    let mut clock: DateTime<Utc> = Utc::now();
    let mut runtime = Runtime::starting_at(script, build_default_registry(), clock);
    let mut sink = make_sink(format, config);

    emit_all(sink.as_mut(), runtime.dispatch(), clock)?;

    match commands {
        Some(commands) => {
            for step in parse_steps(commands, config.runtime.tick_interval_ms)? {
                let kind = match step {
                    Step::Event(kind) => kind,
                    Step::Tick(ms) => {
                        clock += Duration::milliseconds(ms);
                        EventKind::Tick
                    }
                };
                runtime.enqueue(RuntimeEvent::new(kind, clock));
                emit_all(sink.as_mut(), runtime.dispatch(), clock)?;
            }
        }
        None => {
            // Start, then move through every block one Next at a time
            runtime.enqueue(RuntimeEvent::new(EventKind::Start, clock));
            emit_all(sink.as_mut(), runtime.dispatch(), clock)?;

            let mut steps = 0;
            while runtime.status() != RunStatus::Done && steps < AUTO_STEP_LIMIT {
                clock += Duration::seconds(1);
                runtime.enqueue(RuntimeEvent::new(EventKind::Next, clock));
                emit_all(sink.as_mut(), runtime.dispatch(), clock)?;
                steps += 1;
            }
        }
    }

    if snapshot {
        println!("{}", serde_json::to_string_pretty(&runtime.snapshot())?);
    }
    Ok(())
}

fn emit_all(sink: &mut dyn ActionSink, actions: Vec<RuntimeAction>, at: DateTime<Utc>) -> Result<()> {
    for action in &actions {
        sink.emit(action, at)?;
    }
    Ok(())
}

fn cmd_inspect(path: &Path) -> Result<()> {
    let script = Script::load(path)?;

    let errors = script.validate();
    if !errors.is_empty() {
        eprintln!("Script validation errors:");
        for error in &errors {
            eprintln!("  - {}", error);
        }
        return Err(Error::Script(format!("{} problems", errors.len())));
    }

    let registry = build_default_registry();
    println!("Strategies: {}", registry.strategy_names().join(" > "));
    println!();

    for statement in script.statements() {
        let depth = ancestors(&script, statement);
        println!(
            "{:>5}  {:<12} {}{}",
            statement.id.to_string(),
            registry.select(statement).name(),
            "  ".repeat(depth),
            statement.label()
        );
    }
    Ok(())
}

fn ancestors(script: &Script, statement: &Statement) -> usize {
    let mut depth = 0;
    let mut cursor = statement.parent;
    while let Some(id) = cursor {
        depth += 1;
        cursor = script.get(id).and_then(|s| s.parent);
    }
    depth
}

fn cmd_live(path: &Path, format: OutputFormat, config: &Config) -> Result<()> {
    let script = Script::load_validated(path)?;
    tracing::info!(
        path = %path.display(),
        tick_ms = config.runtime.tick_interval_ms,
        "Running script live"
    );
    let mut runtime = Runtime::new(script);
    let mut sink = make_sink(format, config);

    let feed = EventFeed::new();
    let commands = feed.sender();
    let ticker = feed.start_ticker(std::time::Duration::from_millis(
        config.runtime.tick_interval_ms,
    ));

    eprintln!("Commands: start, pause, next, stop, reset (Ctrl-D to stop)");
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<EventKind>() {
                Ok(kind) => {
                    if commands.send(RuntimeEvent::now(kind)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!(input = %line, "Ignoring unknown command");
                    eprintln!("{}", e);
                }
            }
        }
        let _ = commands.send(RuntimeEvent::now(EventKind::Stop));
    });

    runtime.run(feed.into_receiver(), sink.as_mut())?;
    ticker.stop();
    Ok(())
}

/// Human-readable action log
struct TextSink<W: Write> {
    out: W,
}

impl<W: Write> ActionSink for TextSink<W> {
    fn emit(&mut self, action: &RuntimeAction, _at: DateTime<Utc>) -> Result<()> {
        writeln!(self.out, "{}", describe(action))?;
        Ok(())
    }
}

fn describe(action: &RuntimeAction) -> String {
    match action {
        RuntimeAction::DisplayUpdate(d) => {
            let mut line = format!(
                "display  {}  {}",
                d.label,
                script::format_duration(d.elapsed_ms)
            );
            if let Some(remaining) = d.remaining_ms {
                line.push_str(&format!("  ({} left)", script::format_duration(remaining)));
            }
            if let (Some(round), Some(total)) = (d.round, d.total_rounds) {
                line.push_str(&format!("  round {}/{}", round, total));
            }
            line
        }
        RuntimeAction::SetButtons { buttons } => {
            let names: Vec<String> = buttons
                .iter()
                .map(|b| format!("{:?}", b).to_lowercase())
                .collect();
            format!("buttons  {}", names.join(", "))
        }
        RuntimeAction::SetResult(r) => format!(
            "result   {} [{:?}] {}",
            r.label,
            r.block_type,
            script::format_duration(r.elapsed_ms)
        ),
        RuntimeAction::PushBlock { source } => format!("push     {}", source),
        RuntimeAction::PopBlock { block_key } => format!("pop      {}", block_key),
        RuntimeAction::Error {
            severity, message, ..
        } => format!("{:<8} {}", format!("{:?}", severity).to_lowercase(), message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_steps() {
        let steps = parse_steps("start, tick:500,next,tick", 100).unwrap();
        assert_eq!(
            steps,
            vec![
                Step::Event(EventKind::Start),
                Step::Tick(500),
                Step::Event(EventKind::Next),
                Step::Tick(100),
            ]
        );
        assert!(parse_steps("start,jump", 100).is_err());
        assert!(parse_steps("tick:soon", 100).is_err());
    }

    #[test]
    fn test_describe_buttons() {
        let line = describe(&RuntimeAction::SetButtons {
            buttons: vec![Button::Pause, Button::Next],
        });
        assert_eq!(line, "buttons  pause, next");
    }
}
