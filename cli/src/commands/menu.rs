use anyhow::{Result, bail};
use std::process;

use menuplan_core::engine::WeekMenuEngine;
use menuplan_core::models::order_for_seed;

use super::Planner;
use super::helpers::{json_error, print_state, sync_status};

/// Push any debounced write out, then report the resulting state.
async fn finish(engine: &WeekMenuEngine, json: bool) -> Result<()> {
    engine.flush().await;
    let state = engine.state();
    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        print_state(&state);
    }
    Ok(())
}

fn not_on_menu(recipe: &str, json: bool) -> ! {
    if json {
        println!("{}", json_error(&format!("'{recipe}' is not on the menu")));
    } else {
        eprintln!("'{recipe}' is not on the menu");
    }
    process::exit(2);
}

fn require_menu(engine: &WeekMenuEngine, json: bool) {
    if engine.weekmenu().is_none() {
        let message = "Not signed in. Run `menuplan login --user <id>` first";
        if json {
            println!("{}", json_error(message));
        } else {
            eprintln!("{message}");
        }
        process::exit(2);
    }
}

pub(crate) async fn cmd_show(planner: &Planner, json: bool) -> Result<()> {
    finish(&planner.engine, json).await
}

pub(crate) async fn cmd_add(
    planner: &Planner,
    recipe: &str,
    servings: Option<i64>,
    json: bool,
) -> Result<()> {
    if recipe.trim().is_empty() {
        bail!("Recipe ID must not be empty");
    }
    let engine = &planner.engine;
    require_menu(engine, json);
    if !engine.add_recipe(recipe, servings) && !json {
        eprintln!("'{recipe}' is already on the menu");
    }
    finish(engine, json).await
}

pub(crate) async fn cmd_remove(planner: &Planner, recipe: &str, json: bool) -> Result<()> {
    let engine = &planner.engine;
    require_menu(engine, json);
    if !engine.remove_recipe(recipe) {
        not_on_menu(recipe, json);
    }
    finish(engine, json).await
}

pub(crate) async fn cmd_servings(
    planner: &Planner,
    recipe: &str,
    servings: i64,
    json: bool,
) -> Result<()> {
    let engine = &planner.engine;
    require_menu(engine, json);
    if !engine.weekmenu().is_some_and(|m| m.contains(recipe)) {
        not_on_menu(recipe, json);
    }
    engine.update_servings(recipe, servings);
    finish(engine, json).await
}

pub(crate) async fn cmd_clear(planner: &Planner, json: bool) -> Result<()> {
    let engine = &planner.engine;
    require_menu(engine, json);
    engine.clear_menu().await;
    finish(engine, json).await
}

pub(crate) async fn cmd_sync(planner: &Planner, json: bool) -> Result<()> {
    let engine = &planner.engine;
    require_menu(engine, json);
    if engine.state().is_offline && !json {
        eprintln!("Backend unreachable; nothing was sent.");
    }
    engine.sync_now().await;
    let state = engine.state();
    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        println!("{}", sync_status(&state));
    }
    Ok(())
}

/// Print `recipes` in the order this week's seed gives them.
pub(crate) fn cmd_order(planner: &Planner, mut recipes: Vec<String>, json: bool) -> Result<()> {
    let engine = &planner.engine;
    require_menu(engine, json);
    let Some(menu) = engine.weekmenu() else {
        return Ok(());
    };
    order_for_seed(menu.seed, &mut recipes);

    if json {
        println!(
            "{}",
            serde_json::json!({ "seed": menu.seed, "recipes": recipes })
        );
    } else {
        for (i, recipe) in recipes.iter().enumerate() {
            println!("{:>3}. {recipe}", i + 1);
        }
    }
    Ok(())
}
