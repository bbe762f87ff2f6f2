//! Stats command implementation

use anyhow::Result;

use crate::adapter::DEFAULT_SAMPLE_LIMIT;
use crate::service::HistoryService;
use crate::Config;

pub fn run(service: &HistoryService, config: &Config, estimate: bool) -> Result<()> {
    let stats = service.stats()?;

    println!("Sessions: {}", stats.total_sessions);
    println!("Messages: {}", stats.total_messages);

    if !stats.sessions_by_source.is_empty() {
        println!("\nBy source:");
        for entry in &stats.sessions_by_source {
            println!("  {:<10} {}", entry.source, entry.sessions);
        }
    }

    if !stats.top_tags.is_empty() {
        println!("\nTop tags:");
        for tag in &stats.top_tags {
            println!("  {:<16} {}", tag.name, tag.sessions);
        }
    }

    println!("\nSessions per day (last {} days):", stats.window_days);
    for day in &stats.sessions_per_day {
        println!("  {}  {}", day.date, "▪".repeat(day.sessions.min(40) as usize));
    }

    if estimate {
        // Sampled extrapolation over the editor store, independent of
        // what has been imported
        let adapter =
            crate::adapter::EditorStoreAdapter::new(config.source_root("editor"));
        match adapter.estimate_usage(DEFAULT_SAMPLE_LIMIT) {
            Ok(est) => {
                println!(
                    "\nEditor store estimate (~, sampled {}/{} workspaces):",
                    est.sampled_workspaces, est.total_workspaces
                );
                println!("  sessions ≈ {}", est.estimated_sessions);
                println!("  messages ≈ {}", est.estimated_messages);
            }
            Err(e) => println!("\nEditor store estimate unavailable: {e:#}"),
        }
    }

    Ok(())
}
