use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use fleet_config::FleetConfig;

use super::{Fleet, FleetError, TARGET_ALL};
use crate::child::ChildState;
use crate::child::tests::{mock_config, wait_for_state, write_mock_server};

async fn wait_for_fleet_state(fleet: &Fleet, name: &str, state: ChildState) -> bool {
    let Some(child) = fleet.child(name) else {
        return false;
    };
    wait_for_state(child, state, Duration::from_secs(15)).await
}

fn two_child_fleet(dir: &std::path::Path) -> Result<Fleet> {
    let script = write_mock_server(dir, "mock-mcp.sh")?;
    Ok(Fleet::new(FleetConfig {
        servers: vec![
            mock_config(&script, "alpha", "alpha_tool"),
            mock_config(&script, "beta", "beta_tool"),
        ],
    }))
}

#[tokio::test]
async fn call_tool_routes_to_the_owning_child() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let fleet = two_child_fleet(temp.path())?;

    fleet.start(TARGET_ALL).await?;
    assert!(wait_for_fleet_state(&fleet, "alpha", ChildState::Running).await);
    assert!(wait_for_fleet_state(&fleet, "beta", ChildState::Running).await);

    let result = fleet
        .call_tool("beta_tool", json!({"q": "x"}).as_object().cloned())
        .await?;
    assert_eq!(
        result.content[0].as_text().map(|t| t.text.as_str()),
        Some("pong")
    );

    let missing = fleet.call_tool("nobody", None).await;
    assert!(matches!(missing, Err(FleetError::ToolNotFound(name)) if name == "nobody"));

    fleet.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn status_and_tools_keep_declaration_order() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let fleet = two_child_fleet(temp.path())?;

    fleet.start(TARGET_ALL).await?;
    assert!(wait_for_fleet_state(&fleet, "alpha", ChildState::Running).await);
    assert!(wait_for_fleet_state(&fleet, "beta", ChildState::Running).await);

    let status = fleet.status().await;
    let names: Vec<&String> = status.keys().collect();
    assert_eq!(names, ["alpha", "beta"]);
    let alpha = &status["alpha"];
    assert_eq!(alpha["state"], "running");
    assert_eq!(alpha["healthy"], true);
    assert_eq!(alpha["tool_count"], 1);

    let tools = fleet.tools().await;
    assert_eq!(
        tools["beta"]["tools"][0]["name"],
        json!("beta_tool"),
        "tools map must carry plain tool objects"
    );
    assert!(tools["alpha"].get("error").is_none());

    fleet.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn errored_children_are_skipped_and_reported() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_server(temp.path(), "mock-mcp.sh")?;
    let broken = temp.path().join("broken.sh");
    std::fs::write(&broken, "#!/bin/sh\nexit 1\n")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&broken)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&broken, perms)?;
    }

    let mut broken_config = mock_config(&broken, "broken", "unused");
    broken_config.args = vec![broken.to_string_lossy().into_owned()];
    broken_config
        .env
        .insert("RETRY_COUNT".to_string(), "1".to_string());
    let fleet = Fleet::new(FleetConfig {
        servers: vec![broken_config, mock_config(&script, "ok", "echo_tool")],
    });

    fleet.start(TARGET_ALL).await?;
    assert!(wait_for_fleet_state(&fleet, "broken", ChildState::Errored).await);
    assert!(wait_for_fleet_state(&fleet, "ok", ChildState::Running).await);

    // The errored child short-circuits; the healthy one still routes.
    let tools = fleet.tools().await;
    assert_eq!(tools["broken"]["error"], json!("MCP state is errored"));
    assert_eq!(tools["broken"]["tools"], json!([]));

    let result = fleet.call_tool("echo_tool", None).await?;
    assert!(!result.content.is_empty());

    fleet.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unknown_targets_are_rejected() -> Result<()> {
    let fleet = Fleet::new(FleetConfig::default());
    assert!(matches!(
        fleet.start("ghost").await,
        Err(FleetError::UnknownChild(name)) if name == "ghost"
    ));
    assert!(matches!(
        fleet.stop("ghost").await,
        Err(FleetError::UnknownChild(_))
    ));
    // Fan-out over an empty fleet is a successful no-op.
    fleet.start(TARGET_ALL).await?;
    fleet.stop(TARGET_ALL).await?;
    assert!(fleet.status().await.is_empty());
    assert!(fleet.tools().await.is_empty());
    fleet.shutdown().await;
    Ok(())
}
