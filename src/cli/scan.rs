//! Scan command implementation

use anyhow::Result;

use crate::service::HistoryService;

pub fn run(service: &HistoryService, source: Option<String>) -> Result<()> {
    let results = match source {
        Some(name) => vec![(name.clone(), service.scan_source(&name))],
        None => {
            println!("Scanning all available sources...\n");
            service.scan_all()
        }
    };

    if results.is_empty() {
        println!("No sources available. Check your configuration.");
        return Ok(());
    }

    for (name, result) in results {
        match result {
            Ok(summary) => {
                println!("📥 {name}");
                println!(
                    "   {} units: {} imported ({} messages), {} skipped, {} failed",
                    summary.total_processed(),
                    summary.success,
                    summary.messages_imported,
                    summary.skipped,
                    summary.failed,
                );
                for error in &summary.errors {
                    println!("   ⚠ {}: {}", error.unit, error.error);
                }
            }
            Err(e) => {
                println!("❌ {name}: {e:#}");
            }
        }
        println!();
    }

    Ok(())
}
