use anyhow::Result;
use atelier::adapter::{AdapterRegistry, SendOptions, SpawnOptions};
use atelier::cli::{Cli, Commands};
use atelier::session::SessionRegistry;
use atelier::stream::{AgentEvent, EventStream};
use clap::Parser;
use futures::StreamExt;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so answers can be piped
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("atelier=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.limits.to_config();
    let registry = SessionRegistry::with_adapters(config.clone(), AdapterRegistry::builtin(&config))?;

    match cli.command {
        Commands::Adapters => {
            for name in registry.adapter_names() {
                let Some(adapter) = registry.adapter(&name) else {
                    continue;
                };
                let state = if adapter.is_available().await {
                    "available"
                } else {
                    "not installed"
                };
                println!(
                    "{:<8} {:<14} init={:?} timeout={}s",
                    name,
                    state,
                    adapter.init_mode(),
                    adapter.default_timeout().as_secs()
                );
            }
        }

        Commands::Send {
            adapter,
            message,
            stream,
            timeout,
            cwd,
            model,
        } => {
            let session = registry
                .create_session(&adapter, SpawnOptions {
                    working_dir: cwd,
                    model,
                    ..Default::default()
                })
                .await?;
            let options = SendOptions {
                timeout: timeout.map(Duration::from_secs),
                ..Default::default()
            };

            let outcome = if stream {
                let events = registry
                    .send_stream(&session.session_id, &message, options)
                    .await?;
                print_stream(events).await
            } else {
                registry
                    .send(&session.session_id, &message, options)
                    .await
                    .map(|response| {
                        println!("{}", response.content);
                        if response.truncated {
                            eprintln!("(output truncated)");
                        }
                    })
                    .map_err(Into::into)
            };

            registry.shutdown().await;
            outcome?;
        }

        Commands::Chat { adapter, cwd, model } => {
            let _sweeper = registry.start_sweeper();
            let session = registry
                .create_session(&adapter, SpawnOptions {
                    working_dir: cwd,
                    model,
                    ..Default::default()
                })
                .await?;
            println!("Session {} with {} in {}", session.session_id, adapter, session.working_dir.display());
            println!("Ctrl+C interrupts a reply, Ctrl+D exits");

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                print!("> ");
                std::io::stdout().flush()?;
                let Some(line) = lines.next_line().await? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let mut events = match registry
                    .send_stream(&session.session_id, line, SendOptions::default())
                    .await
                {
                    Ok(events) => events,
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        continue;
                    }
                };

                loop {
                    tokio::select! {
                        event = events.next() => {
                            let Some(event) = event else { break };
                            if let Err(e) = print_event(&event) {
                                eprintln!("Error: {}", e);
                            }
                        }
                        _ = tokio::signal::ctrl_c() => {
                            let outcome = registry.interrupt(&session.session_id).await?;
                            eprintln!("(interrupted: {})", outcome.interrupted);
                        }
                    }
                }
            }

            let report = registry.shutdown().await;
            for error in report.errors {
                eprintln!("cleanup: {}", error);
            }
        }
    }

    Ok(())
}

async fn print_stream(mut events: EventStream) -> Result<()> {
    let mut outcome = Ok(());
    while let Some(event) = events.next().await {
        if let Err(e) = print_event(&event) {
            outcome = Err(e);
        }
    }
    outcome
}

fn print_event(event: &AgentEvent) -> Result<()> {
    match event {
        AgentEvent::Text { content } => {
            print!("{}", content);
            if !content.ends_with('\n') {
                println!();
            }
        }
        AgentEvent::ToolCall { name, input } => eprintln!("[tool] {} {}", name, input),
        AgentEvent::ToolResult { content } => {
            let preview: String = content.chars().take(200).collect();
            eprintln!("[result] {}", preview);
        }
        AgentEvent::Final(result) => {
            if !result.usage.is_empty() {
                eprintln!("[usage] {}", serde_json::to_string(&result.usage)?);
            }
            if result.truncated {
                eprintln!("(output truncated)");
            }
        }
        AgentEvent::Error {
            error_kind,
            message,
            is_timeout,
        } => {
            anyhow::bail!("{} ({}{})", message, error_kind, if *is_timeout { ", timeout" } else { "" });
        }
    }
    Ok(())
}
