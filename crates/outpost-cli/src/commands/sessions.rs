use anyhow::Result;
use comfy_table::{Cell, Table};
use outpost_core::HelperSpawner;
use outpost_core::config::AgentConfig;
use outpost_core::spawner::DetectedSession;
use serde_json::json;

use crate::cli::OutputFormat;
use crate::output::{print_json, print_table};

pub async fn run(config: AgentConfig, format: OutputFormat) -> Result<()> {
    let spawner = HelperSpawner::for_platform(config.socket_path())?;
    let sessions = spawner.list_sessions().await?;

    if format.is_json() {
        return print_json(&json!({ "sessions": sessions }));
    }

    if sessions.is_empty() {
        println!("No login sessions found");
        return Ok(());
    }
    print_table(session_table(&sessions))
}

fn session_table(sessions: &[DetectedSession]) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["Session", "User", "UID", "State", "Type", "Display", "Helper"]);
    for session in sessions {
        table.add_row(vec![
            Cell::new(&session.session),
            Cell::new(&session.username),
            Cell::new(session.uid),
            Cell::new(&session.state),
            Cell::new(&session.session_type),
            Cell::new(if session.display.is_empty() { "-" } else { session.display.as_str() }),
            Cell::new(if session.is_interactive() { "eligible" } else { "-" }),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_marks_interactive_sessions() {
        let sessions = vec![
            DetectedSession {
                session: "2".into(),
                uid: 1000,
                username: "alice".into(),
                state: "active".into(),
                session_type: "x11".into(),
                display: ":0".into(),
                ..Default::default()
            },
            DetectedSession {
                session: "c1".into(),
                username: "gdm".into(),
                state: "online".into(),
                session_type: "services".into(),
                ..Default::default()
            },
        ];
        let rendered = session_table(&sessions).to_string();
        assert!(rendered.contains("alice"));
        assert!(rendered.contains("eligible"));
        assert!(rendered.contains("gdm"));
    }
}
