use std::path::PathBuf;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let settings = tempo::ServiceSettings::load(config_path.as_deref())?;
    tempo::run(settings).await
}
