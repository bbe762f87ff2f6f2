//! Search command implementation

use anyhow::Result;

use crate::service::HistoryService;
use crate::store::query::QueryFilter;

pub fn run(service: &HistoryService, filter: &QueryFilter) -> Result<()> {
    let page = service.search_messages(filter)?;

    if page.elapsed_ms.is_infinite() {
        println!("Could not parse that search expression; no results.");
        return Ok(());
    }

    if page.items.is_empty() {
        println!("No matches.");
        return Ok(());
    }

    for hit in &page.items {
        let title = hit.session_title.as_deref().unwrap_or("(untitled)");
        println!("── {} [{}]", title, hit.session_id);
        println!(
            "   {:<9} {}",
            hit.role,
            snippet(&hit.content, filter.keyword.as_deref().unwrap_or(""))
        );
    }

    println!(
        "\n{} matching messages ({:.1} ms){}",
        page.total,
        page.elapsed_ms,
        if page.has_more { ", more available" } else { "" },
    );

    Ok(())
}

/// One-line excerpt centered on the first keyword occurrence
fn snippet(content: &str, keyword: &str) -> String {
    const WIDTH: usize = 80;

    let line = content.lines().find(|l| {
        !keyword.is_empty() && l.to_lowercase().contains(&keyword.to_lowercase())
    });
    let line = line.or_else(|| content.lines().next()).unwrap_or("");

    if line.len() <= WIDTH {
        line.to_string()
    } else {
        let start = line
            .to_lowercase()
            .find(&keyword.to_lowercase())
            .unwrap_or(0)
            .saturating_sub(WIDTH / 4);
        let start = line.char_indices().map(|(i, _)| i).filter(|i| *i <= start).last().unwrap_or(0);
        let end = line
            .char_indices()
            .map(|(i, _)| i)
            .find(|i| *i >= start + WIDTH)
            .unwrap_or(line.len());
        format!("...{}...", &line[start..end])
    }
}
