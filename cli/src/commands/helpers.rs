use chrono::Local;
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use menuplan_core::engine::EngineState;
use menuplan_core::models::WeekMenu;

pub(crate) fn print_menu_table(menu: &WeekMenu) {
    #[derive(Tabled)]
    struct RecipeRow {
        #[tabled(rename = "#")]
        idx: usize,
        #[tabled(rename = "Recipe")]
        recipe: String,
        #[tabled(rename = "Servings")]
        servings: u32,
    }

    if menu.recipes.is_empty() {
        println!("No recipes on this week's menu yet.");
        return;
    }

    let rows: Vec<RecipeRow> = menu
        .recipes
        .iter()
        .enumerate()
        .map(|(i, r)| RecipeRow {
            idx: i + 1,
            recipe: truncate(&r.recipe_id, 40),
            servings: r.servings,
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..3)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

/// One-line sync indicator, e.g. "saved (#12)" or "offline, changes kept locally".
pub(crate) fn sync_status(state: &EngineState) -> String {
    if state.is_offline {
        return "offline, changes kept locally".to_string();
    }
    if state.is_syncing {
        return "saving...".to_string();
    }
    if let Some(err) = &state.error {
        return format!("not saved: {err}");
    }
    match state.weekmenu.as_ref().and_then(|m| m.id) {
        Some(id) => format!("saved (#{id})"),
        None => "local only".to_string(),
    }
}

pub(crate) fn print_state(state: &EngineState) {
    let Some(menu) = &state.weekmenu else {
        println!("No week menu loaded. Sign in with `menuplan login --user <id>`.");
        return;
    };
    print_menu_table(menu);
    println!(
        "seed {}  version {}  updated {}  [{}]",
        menu.seed,
        menu.version,
        menu.updated_at
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S"),
        sync_status(state)
    );
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
