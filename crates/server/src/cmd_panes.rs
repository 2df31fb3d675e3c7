//! `panedock panes` - print the tmux pane listing as the resolver sees it.

use std::sync::Arc;

use crate::command::SystemRunner;
use crate::config::CoreConfig;
use crate::tmux::{PaneInfo, TmuxClient};

pub async fn run(config: &CoreConfig) -> anyhow::Result<()> {
    let tmux = TmuxClient::new(
        Arc::new(SystemRunner),
        config.tmux_path.clone(),
        config.command_timeout,
        config.pane_settle_delay,
        config.reject_message_delay,
    );
    let panes = tmux.list_all_panes().await?;
    if panes.is_empty() {
        println!("No tmux panes (is a tmux server running?)");
        return Ok(());
    }
    for line in render(&panes) {
        println!("{line}");
    }
    Ok(())
}

fn render(panes: &[PaneInfo]) -> Vec<String> {
    let mut lines = vec![format!("{:<6} {:<20} {:>8}  {}", "PANE", "TARGET", "PID", "CWD")];
    lines.extend(panes.iter().map(|pane| {
        format!(
            "{:<6} {:<20} {:>8}  {}",
            pane.pane_id.as_deref().unwrap_or("-"),
            pane.target.to_string(),
            pane.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            pane.current_path.as_deref().unwrap_or("-"),
        )
    }));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmux::parse_pane_listing;

    #[test]
    fn renders_one_row_per_pane() {
        let panes = parse_pane_listing("%1\tmain:0.0\t4242\t/work/repo\nmain:1.2\n");
        let lines = render(&panes);
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("%1"));
        assert!(lines[1].contains("main:0.0"));
        assert!(lines[1].ends_with("/work/repo"));
        assert!(lines[2].contains("main:1.2"));
    }
}
