use anyhow::Result;

use crate::config::Config;
use crate::db;

/// Print every drive the database holds records for, with the version it
/// was last indexed to.
pub async fn list_sources(config: &Config) -> Result<()> {
    let (database, _report) = db::open_database(config).await?;
    let mut watermarks = database.watermarks().await?;
    watermarks.sort_by(|a, b| a.origin.cmp(&b.origin));

    println!("{:<48} VERSION", "ORIGIN");
    for watermark in &watermarks {
        println!("{:<48} {}", watermark.origin, watermark.version);
    }
    if watermarks.is_empty() {
        println!("(no drives indexed)");
    }

    database.close().await?;
    Ok(())
}
