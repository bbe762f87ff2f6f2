//! Show command implementation

use anyhow::Result;

use crate::service::HistoryService;

pub fn run(service: &HistoryService, session_id: &str, json: bool) -> Result<()> {
    let Some(detail) = service.get_session(session_id)? else {
        println!("Session not found: {session_id}");
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&detail)?);
        return Ok(());
    }

    let session = &detail.session;
    println!("Session:  {}", session.id);
    println!("Title:    {}", session.title.as_deref().unwrap_or("-"));
    println!("Source:   {}", session.source);
    if let Some(ref project) = session.project {
        println!("Project:  {project}");
    }
    if !detail.tags.is_empty() {
        println!("Tags:     {}", detail.tags.join(", "));
    }
    println!("Updated:  {}", session.updated_at.as_deref().unwrap_or("-"));
    println!("Messages: {}", session.message_count);
    println!("{}", "-".repeat(60));

    for message in &detail.messages {
        let when = message
            .timestamp
            .as_deref()
            .map(|ts| format!(" ({})", &ts[..16.min(ts.len())]))
            .unwrap_or_default();
        println!("\n[{}]{}", message.role, when);
        println!("{}", message.content);
    }

    Ok(())
}
