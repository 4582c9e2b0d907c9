use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use chatwars_commands::{
    builtin, validate, CommandParser, ParseError, ParserConfig, TokenTarget, VerbTableDocument,
    BUILTIN_PROFILES,
};
use chatwars_runtime::{
    ChatMessage, ControlHook, LoggingBackend, MessageOutcome, RemoteInputServer, RuntimeConfig,
    TeamHub, TeamSnapshot,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "chatwars", version, about = "Chat commands to timed game input")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs every configured team, reading chat lines from stdin.
    Run {
        #[arg(long, default_value = "chatwars.toml")]
        config: PathBuf,
        /// Seconds to wait for pending releases on exit.
        #[arg(long, default_value_t = 2)]
        grace_secs: u64,
    },
    /// Parses one message against a profile and prints the requests.
    Parse {
        #[arg(long, default_value = "towerfall_keyboard")]
        profile: String,
        /// Custom profile document instead of a built-in one.
        #[arg(long)]
        profile_file: Option<PathBuf>,
        #[arg(long, default_value = "+")]
        prefix: String,
        text: String,
    },
    /// Accepts remote input frames and logs them.
    Serve {
        #[arg(long, default_value = "127.0.0.1:33000")]
        bind: String,
    },
    /// Lists built-in profiles and their verbs.
    Profiles,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, grace_secs } => run(config, Duration::from_secs(grace_secs)).await,
        Commands::Parse {
            profile,
            profile_file,
            prefix,
            text,
        } => parse(&profile, profile_file, prefix, &text),
        Commands::Serve { bind } => serve(&bind).await,
        Commands::Profiles => profiles(),
    }
}

async fn run(config_path: PathBuf, grace: Duration) -> Result<()> {
    let config = RuntimeConfig::load(&config_path)?;
    let hub = TeamHub::from_config(&config, Arc::new(LoggingBackend))
        .context("failed to start teams")?;
    for failed in hub.failed() {
        eprintln!("team {} disabled: {}", failed.name, failed.error);
    }
    if hub.names().next().is_none() {
        bail!("no team could be started");
    }
    println!(
        "chatwars ready with teams: {}. Lines are 'team<TAB>author<TAB>text'; '!help' lists controls.",
        hub.names().collect::<Vec<_>>().join(", ")
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if let Some(control) = line.strip_prefix('!') {
            match handle_control(&hub, control) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(err) => {
                    eprintln!("{err:#}");
                    continue;
                }
            }
        }
        let mut fields = line.splitn(3, '\t');
        let (Some(team), Some(author), Some(text)) = (fields.next(), fields.next(), fields.next())
        else {
            eprintln!("expected 'team<TAB>author<TAB>text'");
            continue;
        };
        match hub.route(&ChatMessage::now(team, author, text)) {
            Ok(MessageOutcome::Scheduled {
                batch,
                requests,
                dropped,
            }) => println!("{team}: {} with {requests} actions ({dropped} dropped)", batch.id()),
            Ok(MessageOutcome::NothingToRun { dropped }) => {
                println!("{team}: nothing to run ({dropped} dropped)");
            }
            Ok(MessageOutcome::Duplicate) => println!("{team}: duplicate ignored"),
            Ok(MessageOutcome::NotACommand) => {}
            Err(err) => eprintln!("{err}"),
        }
    }

    hub.shutdown(grace).await;
    Ok(())
}

/// Returns `false` when the loop should stop.
fn handle_control(hub: &TeamHub, line: &str) -> Result<bool> {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let team = parts.next();
    let hook = match command {
        "cancel" => ControlHook::CancelAll,
        "random" => ControlHook::InjectRandom,
        "reset" => ControlHook::Reset,
        "random-on" => ControlHook::RandomInputs(true),
        "random-off" => ControlHook::RandomInputs(false),
        "stats" => {
            let diagnostics = match team {
                Some(name) => vec![hub.team(name).ok_or_else(|| anyhow!("unknown team {name}"))?.diagnostics()],
                None => hub.diagnostics(),
            };
            println!("{}", serde_json::to_string_pretty(&diagnostics)?);
            return Ok(true);
        }
        "macro" => {
            handle_macro(hub, line.trim_start_matches("macro").trim())?;
            return Ok(true);
        }
        "snapshot" => {
            let name = team.ok_or_else(|| anyhow!("usage: !snapshot <team> [file]"))?;
            let runtime = hub.team(name).ok_or_else(|| anyhow!("unknown team {name}"))?;
            let json = serde_json::to_string_pretty(&runtime.snapshot())?;
            match parts.next() {
                Some(path) => std::fs::write(path, json).with_context(|| format!("writing {path}"))?,
                None => println!("{json}"),
            }
            return Ok(true);
        }
        "restore" => {
            let (Some(name), Some(path)) = (team, parts.next()) else {
                bail!("usage: !restore <team> <file>");
            };
            let runtime = hub.team(name).ok_or_else(|| anyhow!("unknown team {name}"))?;
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
            let snapshot: TeamSnapshot = serde_json::from_str(&raw)?;
            for rejected in runtime.restore(snapshot) {
                eprintln!("{name}: {rejected}");
            }
            return Ok(true);
        }
        "quit" | "exit" => return Ok(false),
        "help" => {
            print_help();
            return Ok(true);
        }
        other => bail!("unknown control '{other}', try !help"),
    };
    let report = hub.control(team, hook)?;
    info!(?hook, affected = report.affected, failed = report.failed.len(), "control hook applied");
    for failed in &report.failed {
        eprintln!("{}: {}", failed.name, failed.error);
    }
    Ok(true)
}

fn handle_macro(hub: &TeamHub, args: &str) -> Result<()> {
    let mut parts = args.splitn(4, ' ');
    let (Some(action), Some(team)) = (parts.next(), parts.next()) else {
        bail!("usage: !macro <add|change|remove|list|reload> <team> [name] [body]");
    };
    let runtime = hub.team(team).ok_or_else(|| anyhow!("unknown team {team}"))?;
    let name = parts.next().unwrap_or_default();
    let body = parts.next().unwrap_or_default();
    match action {
        "add" => runtime.add_macro(name, body)?,
        "change" => runtime.change_macro(name, body)?,
        "remove" => runtime.remove_macro(name)?,
        "reload" => {
            let loaded = runtime.reload_macros()?;
            println!("{team}: {loaded} macros loaded");
        }
        "list" => println!("{team}: {}", runtime.macro_names().join(", ")),
        other => bail!("unknown macro action '{other}'"),
    }
    Ok(())
}

fn print_help() {
    println!("Controls (team optional unless noted):");
    println!("  !cancel [team]        cancel pending presses");
    println!("  !random [team]        inject one random action");
    println!("  !random-on|off [team] toggle the random input loop");
    println!("  !reset [team]         cancel, clear state, reload macros");
    println!("  !stats [team]         print diagnostics");
    println!("  !macro <add|change|remove|list|reload> <team> [name] [body]");
    println!("  !snapshot <team> [file] / !restore <team> <file>");
    println!("  !quit");
}

fn parse(
    profile: &str,
    profile_file: Option<PathBuf>,
    prefix: String,
    text: &str,
) -> Result<()> {
    let verbs = match profile_file {
        Some(path) => VerbTableDocument::load(path)?.into_table()?,
        None => builtin(profile)?,
    };
    let parser = CommandParser::new(ParserConfig {
        action_prefix: prefix,
        ..ParserConfig::default()
    })?;
    let parsed = match parser.parse(text, &verbs) {
        Ok(parsed) => parsed,
        Err(ParseError::NotACommand) => {
            println!("{}", json!({ "command": false }));
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    let mut requests = Vec::new();
    let mut errors: Vec<String> = parsed.errors.iter().map(ToString::to_string).collect();
    for token in &parsed.tokens {
        let TokenTarget::Verb(spec) = &token.target else {
            continue;
        };
        match validate(token.timing, spec) {
            Ok(request) => requests.push(request),
            Err(err) => errors.push(format!("{}: {err}", token.word)),
        }
    }
    let output = json!({
        "command": true,
        "profile": verbs.profile(),
        "requests": requests,
        "errors": errors,
        "unknown": parsed.unknown,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn serve(bind: &str) -> Result<()> {
    let server = RemoteInputServer::bind(bind, Arc::new(LoggingBackend)).await?;
    println!("remote input server on {}", server.local_addr()?);
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping remote input server");
            Ok(())
        }
    }
}

fn profiles() -> Result<()> {
    for name in BUILTIN_PROFILES {
        let table = builtin(name)?;
        println!("{name} ({} verbs)", table.len());
        for spec in table.verbs() {
            let aliases = table.aliases_of(&spec.name);
            println!(
                "  {:<10} key={:<12} {:>4} ms {:?}{}",
                spec.name,
                spec.canonical_key.as_str(),
                spec.default_duration_ms,
                spec.input_kind,
                if aliases.is_empty() {
                    String::new()
                } else {
                    format!("  aliases: {}", aliases.join(", "))
                }
            );
        }
    }
    Ok(())
}
