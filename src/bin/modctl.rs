//! modctl - operator console for the module host
//!
//! Run with: cargo run --bin modctl -- --store modules.json
//!
//! Indices are 1-based at the prompt, matching what `ls` prints.

use clap::Parser;
use modvisor::controller::StatusSnapshot;
use modvisor::fetch::FetchProgress;
use modvisor::runtime::{BindStatus, RunOutcome, StdoutSink, StopOutcome, SupervisorState};
use modvisor::{Config, Controller, HttpTransport, NetworkLink};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "modctl", version, about = "Register, download and run WASM modules")]
struct Args {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Registry store; overrides the config file
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Save after every registry change
    #[arg(long)]
    autosave: bool,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    log: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Add { name: &'a str, uri: &'a str },
    Remove(usize),
    Download(usize),
    Run(usize),
    Stop,
    List,
    Status,
    Save,
    Clear,
    Help,
    Exit,
}

fn parse_index(arg: Option<&str>) -> Result<usize, String> {
    match arg.map(str::parse::<usize>) {
        Some(Ok(n)) if n >= 1 => Ok(n - 1),
        Some(_) => Err("index must be a number starting at 1".to_string()),
        None => Err("missing module index".to_string()),
    }
}

fn parse_command(line: &str) -> Result<Command<'_>, String> {
    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or_default();
    let command = match verb {
        "add" => match (words.next(), words.next()) {
            (Some(name), Some(uri)) => Command::Add { name, uri },
            _ => return Err("usage: add <name> <uri>".to_string()),
        },
        "rm" => Command::Remove(parse_index(words.next())?),
        "dl" => Command::Download(parse_index(words.next())?),
        "run" => Command::Run(parse_index(words.next())?),
        "stop" => Command::Stop,
        "ls" => Command::List,
        "status" => Command::Status,
        "save" => Command::Save,
        "clear" => Command::Clear,
        "help" => Command::Help,
        "exit" | "quit" => Command::Exit,
        other => return Err(format!("{other}: command not found")),
    };
    Ok(command)
}

fn print_help() {
    println!("modctl - available commands:");
    println!("  add <name> <uri>  - Register a module");
    println!("  rm <n>            - Remove module n");
    println!("  dl <n>            - Download module n");
    println!("  run <n>           - Run module n (stops the current one)");
    println!("  stop              - Stop the running module");
    println!("  ls                - List modules");
    println!("  status            - Show supervisor status");
    println!("  save              - Save the registry");
    println!("  clear             - Stop and remove everything");
    println!("  exit              - Leave");
}

fn describe_outcome(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Stopped => "finished".to_string(),
        RunOutcome::Cancelled => "stopped".to_string(),
        RunOutcome::Faulted(e) => format!("faulted: {e}"),
    }
}

fn print_status(status: &StatusSnapshot) {
    let state = match (status.state, &status.active) {
        (SupervisorState::Running { slot }, Some(name)) => format!("running {} ({name})", slot + 1),
        (SupervisorState::Running { slot }, None) => format!("running {}", slot + 1),
        (SupervisorState::Starting { slot }, _) => format!("starting {}", slot + 1),
        (SupervisorState::Idle, _) => "idle".to_string(),
    };
    println!("modules: {}/{}  state: {state}", status.registered, status.capacity);
    if let Some(outcome) = &status.last_outcome {
        println!("last run: {}", describe_outcome(outcome));
    }
}

fn execute(controller: &mut Controller<HttpTransport>, command: Command<'_>) -> Result<(), String> {
    match command {
        Command::Add { name, uri } => {
            let index = controller.add(name, uri).map_err(|e| e.to_string())?;
            println!("added {} as {}", name, index + 1);
        }
        Command::Remove(index) => {
            controller.remove(index).map_err(|e| e.to_string())?;
            println!("removed {}", index + 1);
        }
        Command::Download(index) => {
            let mut stdout = io::stdout();
            let size = controller
                .download_with_progress(index, &mut |p: FetchProgress| {
                    print!("\rdownloading {}: {:3}%", p.index + 1, p.percent);
                    let _ = stdout.flush();
                })
                .map_err(|e| format!("\n{e}"))?;
            println!("\ndownloaded {size} bytes");
        }
        Command::Run(index) => {
            let report = controller.start(index).map_err(|e| e.to_string())?;
            for entry in &report.link.entries {
                if let BindStatus::SignatureMismatch { imported } = &entry.status {
                    println!("warning: {} imported as {imported}, host provides {}", entry.name, entry.signature);
                }
            }
            for import in &report.link.unresolved {
                println!("warning: unresolved import {import}");
            }
            println!("running {}", index + 1);
        }
        Command::Stop => match controller.stop() {
            StopOutcome::NothingRunning => println!("nothing running"),
            StopOutcome::Finished { slot, outcome } => println!("{} {}", slot + 1, describe_outcome(&outcome)),
            StopOutcome::Detached { slot } => println!("{} did not stop in time; detached", slot + 1),
        },
        Command::List => {
            let modules = controller.list();
            if modules.is_empty() {
                println!("no modules");
            }
            for module in modules {
                let loaded = if module.loaded {
                    format!("{} bytes", module.size)
                } else {
                    "not downloaded".to_string()
                };
                println!("{:>2}. {:<16} {:<16} {}", module.index + 1, module.name, loaded, module.source_uri);
            }
        }
        Command::Status => print_status(&controller.status()),
        Command::Save => {
            let saved = controller.save().map_err(|e| e.to_string())?;
            println!("saved {saved} modules");
        }
        Command::Clear => {
            controller.clear_all();
            println!("cleared");
        }
        Command::Help => print_help(),
        Command::Exit => {}
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    modvisor::init_logging(&args.log);

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("modctl: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };
    if args.store.is_some() {
        config.store_path = args.store.clone();
    }
    config.autosave |= args.autosave;

    let (mut controller, restored) = match Controller::boot(&config, NetworkLink::default(), Arc::new(StdoutSink)) {
        Ok(booted) => booted,
        Err(e) => {
            eprintln!("modctl: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("modctl {}", env!("CARGO_PKG_VERSION"));
    if let Some(report) = restored {
        println!("restored {} modules ({} skipped)", report.restored, report.skipped);
    }
    println!("Type 'help' for available commands.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        let _ = stdout.flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                println!();
                break;
            }
            Ok(_) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match parse_command(line) {
                    Ok(Command::Exit) => break,
                    Ok(command) => {
                        if let Err(e) = execute(&mut controller, command) {
                            eprintln!("error: {e}");
                        }
                    }
                    Err(e) => eprintln!("{e}"),
                }
            }
            Err(e) => {
                eprintln!("Error reading input: {e}");
                break;
            }
        }
    }

    controller.stop();
    ExitCode::SUCCESS
}
