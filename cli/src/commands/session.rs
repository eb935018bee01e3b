use anyhow::{Result, bail};

use crate::config::{Config, Settings};
use crate::remote::RemoteClient;
use menuplan_core::session::Subscription;

fn print_settings(settings: &Settings, json: bool) -> Result<()> {
    if json {
        // Never echo the key back
        let mut shown = settings.clone();
        shown.api_key = shown.api_key.map(|_| "***".to_string());
        println!("{}", serde_json::to_string_pretty(&shown)?);
        return Ok(());
    }
    match &settings.user_id {
        Some(user) => println!("Signed in as {user}"),
        None => println!("Signed out"),
    }
    if let Some(sub) = &settings.subscription {
        println!(
            "Subscription {} ({} servings by default)",
            sub.id, sub.default_servings
        );
    }
    match &settings.server_url {
        Some(url) => println!("Syncing with {url}"),
        None => println!("No backend configured; menus are stored locally"),
    }
    Ok(())
}

pub(crate) fn cmd_login(
    config: &Config,
    user: String,
    subscription: Option<String>,
    default_servings: u32,
    json: bool,
) -> Result<()> {
    if user.trim().is_empty() {
        bail!("User id must not be empty");
    }
    if default_servings == 0 {
        bail!("Default servings must be at least 1");
    }
    let mut settings = config.load_settings()?;
    settings.user_id = Some(user);
    settings.subscription = subscription.map(|id| Subscription {
        id,
        default_servings,
    });
    config.save_settings(&settings)?;
    print_settings(&settings, json)
}

pub(crate) fn cmd_logout(config: &Config, json: bool) -> Result<()> {
    let mut settings = config.load_settings()?;
    settings.user_id = None;
    settings.subscription = None;
    config.save_settings(&settings)?;
    print_settings(&settings, json)
}

/// Point the CLI at a backend, or back to local-only storage with `--local`.
pub(crate) async fn cmd_remote(
    config: &Config,
    url: Option<String>,
    api_key: Option<String>,
    json: bool,
) -> Result<()> {
    let mut settings = config.load_settings()?;
    if let Some(url) = &url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            bail!("Backend URL must start with http:// or https://");
        }
        if let Err(e) = RemoteClient::new(url, api_key.clone()).health().await {
            eprintln!("Warning: {e:#}; saving anyway");
        }
    }
    settings.server_url = url;
    settings.api_key = api_key;
    config.save_settings(&settings)?;
    print_settings(&settings, json)
}
