//! `yieldnet config` command implementation

use anyhow::Result;

use yieldnet_core::config::EngineConfig;

pub fn run() -> Result<()> {
    let config = EngineConfig::from_env()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
