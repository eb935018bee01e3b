use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::remote::RemoteClient;
use menuplan_core::connectivity::ConnectivityMonitor;
use menuplan_core::engine::EngineState;
use menuplan_core::models::order_for_seed;

use super::Planner;
use super::helpers::{print_state, sync_status};

#[derive(Debug, PartialEq, Eq)]
enum ShellCommand {
    Empty,
    Help,
    Show,
    Add { recipe: String, servings: Option<i64> },
    Remove(String),
    Servings { recipe: String, servings: i64 },
    Clear,
    Sync,
    Order(Vec<String>),
    Offline,
    Online,
    Quit,
}

fn parse_line(line: &str) -> Result<ShellCommand> {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return Ok(ShellCommand::Empty);
    };
    let args: Vec<&str> = words.collect();
    let recipe = |usage: &str| -> Result<String> {
        args.first()
            .map(|r| (*r).to_string())
            .with_context(|| format!("Usage: {usage}"))
    };

    let parsed = match cmd {
        "help" | "?" => ShellCommand::Help,
        "show" | "ls" => ShellCommand::Show,
        "add" => ShellCommand::Add {
            recipe: recipe("add <recipe> [servings]")?,
            servings: args
                .get(1)
                .map(|n| n.parse().with_context(|| format!("Invalid servings: '{n}'")))
                .transpose()?,
        },
        "remove" | "rm" => ShellCommand::Remove(recipe("remove <recipe>")?),
        "servings" => {
            let recipe = recipe("servings <recipe> <n>")?;
            let n = args.get(1).context("Usage: servings <recipe> <n>")?;
            ShellCommand::Servings {
                recipe,
                servings: n
                    .parse()
                    .with_context(|| format!("Invalid servings: '{n}'"))?,
            }
        }
        "clear" => ShellCommand::Clear,
        "sync" => ShellCommand::Sync,
        "order" => {
            if args.is_empty() {
                bail!("Usage: order <recipe>...");
            }
            ShellCommand::Order(args.iter().map(|s| (*s).to_string()).collect())
        }
        "offline" => ShellCommand::Offline,
        "online" => ShellCommand::Online,
        "quit" | "exit" | "q" => ShellCommand::Quit,
        other => bail!("Unknown command '{other}'. Type `help` for a list."),
    };
    Ok(parsed)
}

fn print_help() {
    println!("Commands:");
    println!("  show                     show the menu");
    println!("  add <recipe> [servings]  add a recipe");
    println!("  remove <recipe>          remove a recipe");
    println!("  servings <recipe> <n>    change servings");
    println!("  clear                    start a new empty menu");
    println!("  sync                     save to the backend now");
    println!("  order <recipe>...        list recipes in this week's order");
    println!("  offline | online         simulate losing or regaining the connection");
    println!("  quit                     save pending changes and exit");
}

/// Print a short notice whenever saving, connectivity or error state flips.
fn spawn_indicator(mut rx: watch::Receiver<EngineState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = rx.borrow_and_update().clone();
        while rx.changed().await.is_ok() {
            let state = rx.borrow_and_update().clone();
            if state.is_offline != last.is_offline {
                if state.is_offline {
                    eprintln!("[working offline]");
                } else {
                    eprintln!("[back online]");
                }
            }
            if state.is_syncing && !last.is_syncing {
                eprintln!("[saving...]");
            }
            if !state.is_syncing && last.is_syncing {
                eprintln!("[{}]", sync_status(&state));
            }
            last = state;
        }
    })
}

/// Poll the backend's health endpoint and feed the result to `connectivity`.
fn spawn_probe(
    remote: Arc<RemoteClient>,
    connectivity: ConnectivityMonitor,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let online = remote.health().await.is_ok();
            if connectivity.set_online(online) {
                debug!(online, "connectivity changed");
            }
        }
    })
}

pub(crate) async fn cmd_shell(planner: Planner, probe_every: Duration) -> Result<()> {
    let engine = &planner.engine;
    engine.start();
    let indicator = spawn_indicator(engine.subscribe());
    let probe = planner
        .remote
        .clone()
        .map(|remote| spawn_probe(remote, planner.connectivity.clone(), probe_every));

    print_state(&engine.state());
    println!("Type `help` for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("menuplan> ");
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read input")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let command = match parse_line(&line) {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{e:#}");
                continue;
            }
        };
        match command {
            ShellCommand::Empty => {}
            ShellCommand::Help => print_help(),
            ShellCommand::Show => print_state(&engine.state()),
            ShellCommand::Add { recipe, servings } => {
                if !engine.add_recipe(&recipe, servings) {
                    eprintln!("'{recipe}' is already on the menu");
                }
            }
            ShellCommand::Remove(recipe) => {
                if !engine.remove_recipe(&recipe) {
                    eprintln!("'{recipe}' is not on the menu");
                }
            }
            ShellCommand::Servings { recipe, servings } => {
                if engine.weekmenu().is_some_and(|m| m.contains(&recipe)) {
                    engine.update_servings(&recipe, servings);
                } else {
                    eprintln!("'{recipe}' is not on the menu");
                }
            }
            ShellCommand::Clear => engine.clear_menu().await,
            ShellCommand::Sync => {
                engine.sync_now().await;
                println!("{}", sync_status(&engine.state()));
            }
            ShellCommand::Order(mut recipes) => {
                if let Some(menu) = engine.weekmenu() {
                    order_for_seed(menu.seed, &mut recipes);
                    for (i, recipe) in recipes.iter().enumerate() {
                        println!("{:>3}. {recipe}", i + 1);
                    }
                }
            }
            ShellCommand::Offline => {
                planner.connectivity.set_online(false);
            }
            ShellCommand::Online => {
                planner.connectivity.set_online(true);
            }
            ShellCommand::Quit => break,
        }
    }

    if engine.has_pending_write() {
        eprintln!("Saving pending changes...");
    }
    engine.flush().await;
    engine.shutdown();
    indicator.abort();
    if let Some(probe) = probe {
        probe.abort();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_line("   ").unwrap(), ShellCommand::Empty);
        assert_eq!(parse_line("show").unwrap(), ShellCommand::Show);
        assert_eq!(
            parse_line("add pad-thai").unwrap(),
            ShellCommand::Add {
                recipe: "pad-thai".to_string(),
                servings: None
            }
        );
        assert_eq!(
            parse_line("add pad-thai 3").unwrap(),
            ShellCommand::Add {
                recipe: "pad-thai".to_string(),
                servings: Some(3)
            }
        );
        assert_eq!(
            parse_line("servings pad-thai -1").unwrap(),
            ShellCommand::Servings {
                recipe: "pad-thai".to_string(),
                servings: -1
            }
        );
        assert_eq!(
            parse_line("rm pad-thai").unwrap(),
            ShellCommand::Remove("pad-thai".to_string())
        );
        assert_eq!(
            parse_line("order a b c").unwrap(),
            ShellCommand::Order(vec!["a".into(), "b".into(), "c".into()])
        );
        assert_eq!(parse_line("exit").unwrap(), ShellCommand::Quit);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_line("add").is_err());
        assert!(parse_line("add soup lots").is_err());
        assert!(parse_line("servings soup").is_err());
        assert!(parse_line("order").is_err());
        let err = parse_line("dance").unwrap_err();
        assert!(err.to_string().contains("Unknown command"));
    }
}
