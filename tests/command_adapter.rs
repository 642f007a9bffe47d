//! CommandAdapter through the registry, with `sh` standing in for agent CLIs

use atelier::adapter::{CommandAdapter, CommandProfile, SendOptions, SpawnOptions};
use atelier::config::AppConfig;
use atelier::session::{RegistryEvent, SessionRegistry, SessionStatus};
use atelier::stream::{AgentEvent, Dialect};
use atelier::ErrorKind;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A profile that runs `script` with the built arguments as `$@`
fn sh_agent(name: &str, script: &str) -> CommandProfile {
    CommandProfile::new(name, "sh")
        .base_args(["-c", script, name])
        .version_args(["-c", "exit 0"])
        .resume_flag("--resume")
        .model_flag("--model")
        .default_timeout(Duration::from_secs(10))
}

fn registry(config: AppConfig, profiles: Vec<CommandProfile>) -> SessionRegistry {
    let registry = SessionRegistry::new(config.clone()).unwrap();
    for profile in profiles {
        registry.register_adapter(Arc::new(CommandAdapter::new(profile, &config)));
    }
    registry
}

const STREAMING_AGENT: &str = r#"
echo '{"type":"system","subtype":"init","session_id":"conv-42"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Looking at the tree"}]}}'
echo 'warning: banner text'
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"ls"}}]}}'
echo '{"type":"user","message":{"content":[{"type":"tool_result","content":"Cargo.toml"}]}}'
printf '{"type":"result","subtype":"success","result":"args: %s","session_id":"conv-42","usage":{"input_tokens":12,"output_tokens":3}}\n' "$*"
"#;

#[tokio::test]
async fn streams_normalized_events_and_resumes() {
    let dir = TempDir::new().unwrap();
    let config = AppConfig::default().with_default_working_dir(dir.path());
    let registry = registry(config, vec![sh_agent("json-agent", STREAMING_AGENT).dialect(Dialect::JsonLines)]);
    let mut signals = registry.subscribe();

    let id = registry
        .create_session("json-agent", SpawnOptions::default().with_model("small"))
        .await
        .unwrap()
        .session_id;

    let stream = registry
        .send_stream(&id, "list files", SendOptions::default())
        .await
        .unwrap();
    let kinds: Vec<&'static str> = stream.map(|e| e.kind_name()).collect().await;
    assert_eq!(
        kinds,
        vec![
            "progress:text",
            "progress:text",
            "progress:tool-call",
            "progress:tool-result",
            "result"
        ]
    );

    let response = registry.send(&id, "continue", SendOptions::default()).await.unwrap();
    assert_eq!(response.content, "args: --model small --resume conv-42 continue");
    assert_eq!(response.usage.input_tokens, Some(12));
    assert_eq!(response.usage.cost_usd, None);
    assert_eq!(registry.get_status(&id).unwrap().message_count, 2);

    let mut chunks = 0;
    let mut sent = 0;
    while let Ok(signal) = signals.try_recv() {
        match signal {
            RegistryEvent::Chunk { .. } => chunks += 1,
            RegistryEvent::MessageSent { status, .. } => {
                assert_eq!(status, SessionStatus::Stable);
                sent += 1;
            }
            _ => {}
        }
    }
    assert_eq!(chunks, 10);
    assert_eq!(sent, 2);
}

#[tokio::test]
async fn plain_text_agent_with_nonzero_exit_keeps_its_answer() {
    let dir = TempDir::new().unwrap();
    let config = AppConfig::default().with_default_working_dir(dir.path());
    let script = r#"printf '\033[1mAnswer:\033[0m 42\n'; exit 1"#;
    let registry = registry(config, vec![sh_agent("plain", script)]);

    let id = registry
        .create_session("plain", SpawnOptions::default())
        .await
        .unwrap()
        .session_id;
    let response = registry.send(&id, "question", SendOptions::default()).await.unwrap();
    assert_eq!(response.content, "Answer: 42");
    assert_eq!(registry.get_status(&id).unwrap().status, SessionStatus::Stable);
}

#[tokio::test]
async fn failing_agent_reports_stderr_and_keeps_the_session() {
    let dir = TempDir::new().unwrap();
    let config = AppConfig::default().with_default_working_dir(dir.path());
    let registry = registry(config, vec![sh_agent("broken", "echo 'not logged in' >&2; exit 2")]);

    let id = registry
        .create_session("broken", SpawnOptions::default())
        .await
        .unwrap()
        .session_id;
    let err = registry.send(&id, "hi", SendOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProcessExitError);
    assert!(err.to_string().contains("not logged in"));
    assert!(!err.is_timeout());

    let status = registry.get_status(&id).unwrap();
    assert_eq!(status.status, SessionStatus::Error);
    assert!(registry.terminate_session(&id).await);
}

#[tokio::test]
async fn oversized_output_is_truncated_not_killed() {
    let dir = TempDir::new().unwrap();
    let config = AppConfig::default()
        .with_default_working_dir(dir.path())
        .with_max_output_bytes(64);
    let script = "i=0; while [ $i -lt 200 ]; do echo \"line $i\"; i=$((i+1)); done; echo done >&2";
    let registry = registry(config, vec![sh_agent("chatty", script)]);

    let id = registry
        .create_session("chatty", SpawnOptions::default())
        .await
        .unwrap()
        .session_id;
    let response = registry.send(&id, "talk", SendOptions::default()).await.unwrap();
    assert!(response.truncated);
    assert!(response.content.len() <= 64);
    assert!(response.content.starts_with("line 0"));
}

#[tokio::test]
async fn unknown_and_unavailable_adapters_are_rejected_before_spawning() {
    let dir = TempDir::new().unwrap();
    let config = AppConfig::default().with_default_working_dir(dir.path());
    let ghost = CommandProfile::new("ghost", "definitely-not-an-agent-cli");
    let registry = registry(config, vec![ghost]);

    let err = registry
        .create_session("missing", SpawnOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AdapterNotFound);

    let err = registry
        .create_session("ghost", SpawnOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AdapterUnavailable);
    assert!(registry.list_sessions().is_empty());
}

#[tokio::test]
async fn stream_timeout_emits_single_error() {
    let dir = TempDir::new().unwrap();
    let config = AppConfig::default()
        .with_default_working_dir(dir.path())
        .with_kill_grace(Duration::from_millis(200));
    let script = "echo '{\"type\":\"assistant\",\"message\":{\"content\":\"thinking\"}}'; trap '' TERM; sleep 10";
    let registry = registry(config, vec![sh_agent("stuck", script).dialect(Dialect::JsonLines)]);

    let id = registry
        .create_session("stuck", SpawnOptions::default())
        .await
        .unwrap()
        .session_id;
    let events = registry
        .send_stream(&id, "go", SendOptions::with_timeout(Duration::from_millis(300)))
        .await
        .unwrap()
        .collect_events()
        .await;

    assert_eq!(events.len(), 2);
    assert_eq!(events[0], AgentEvent::text("thinking"));
    assert!(matches!(
        events[1],
        AgentEvent::Error {
            error_kind: ErrorKind::ProcessTimeout,
            is_timeout: true,
            ..
        }
    ));
    assert_eq!(registry.get_status(&id).unwrap().status, SessionStatus::Error);
}
