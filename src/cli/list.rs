//! List command implementation

use anyhow::Result;

use crate::service::HistoryService;
use crate::store::query::QueryFilter;

pub fn run(service: &HistoryService, filter: &QueryFilter) -> Result<()> {
    let page = service.list_sessions(filter)?;

    if page.items.is_empty() {
        println!("No sessions found. Run 'chatvault scan' first.");
        return Ok(());
    }

    println!(
        "{:<12} {:<28} {:<9} {:>5} {:<20} {}",
        "Updated", "ID", "Source", "Msgs", "Tags", "Title"
    );
    println!("{}", "-".repeat(100));

    for hit in &page.items {
        let session = &hit.session;

        let updated = session
            .updated_at
            .as_ref()
            .map(|ts| {
                if ts.len() >= 16 {
                    format!("{} {}", &ts[5..10], &ts[11..16])
                } else {
                    ts.clone()
                }
            })
            .unwrap_or_else(|| "-".to_string());

        let id = truncate(&session.id, 28);
        let tags = if hit.tags.is_empty() {
            "-".to_string()
        } else {
            truncate(&hit.tags.join(","), 20)
        };

        let title = session
            .title
            .as_deref()
            .map(|t| truncate(t.lines().next().unwrap_or(t), 35))
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<12} {:<28} {:<9} {:>5} {:<20} {}",
            updated, id, session.source, session.message_count, tags, title,
        );
    }

    println!(
        "\nPage {}/{} — {} sessions total{}",
        page.page,
        (page.total as usize).div_ceil(page.page_size.max(1)).max(1),
        page.total,
        if page.has_more { " (more available)" } else { "" },
    );

    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let cut: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}
