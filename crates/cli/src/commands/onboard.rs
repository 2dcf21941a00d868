//! `tasklane onboard`: first-time setup.

use tasklane_config::AppConfig;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    println!("tasklane — first-time setup\n");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        println!("Created config directory: {}", config_dir.display());
    }

    if config_path.exists() {
        println!("Config already exists at: {}", config_path.display());
        println!("Edit it manually or delete it and re-run onboard.");
        return Ok(());
    }

    std::fs::write(&config_path, AppConfig::default_toml())?;
    println!("Created {}", config_path.display());
    println!("\nNext steps:");
    println!("  1. Set OPENROUTER_API_KEY (or api_key in the config)");
    println!("  2. Run: tasklane run \"describe the task\"");
    println!("  3. Optional: enable [bridge] and run `tasklane bridge` to answer from Telegram");
    Ok(())
}
