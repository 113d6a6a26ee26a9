// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{parse_line, Cli, Commands, ReplCommand, HELP_TEXT};
use varld_config::{Config, StorageBackend};
use varld_core::{
    wire, AgentParams, MessageEvent, SsePhase, World, WorldManager, APPROVAL_TOOL_NAME,
};
use varld_store::{FileStorage, MemoryStorage, Storage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    // reqwest's rustls backend needs a process-wide crypto provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut config = varld_config::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.data_dir {
        config.storage.data_path = dir.clone();
    }

    if let Some(cmd) = &cli.command {
        return match cmd {
            Commands::ShowConfig => {
                println!("{}", serde_yaml_string(&config));
                Ok(())
            }
            Commands::ListProviders => {
                for d in varld_model::list_drivers() {
                    let key = d
                        .default_api_key_env
                        .map(|e| format!(" (key: {e})"))
                        .unwrap_or_default();
                    println!("{:<12} {}{key}", d.id, d.description);
                }
                Ok(())
            }
            Commands::Worlds => {
                let manager = WorldManager::new(build_storage(&config), config.clone());
                for w in manager.list_worlds().await? {
                    println!("{:<20} {:<24} {}", w.id, w.name, w.description);
                }
                Ok(())
            }
        };
    }

    let manager = Arc::new(WorldManager::new(build_storage(&config), config));
    run_repl(manager, cli.world).await
}

fn build_storage(config: &Config) -> Arc<dyn Storage> {
    match config.storage.backend {
        StorageBackend::File => Arc::new(FileStorage::new(&config.storage.data_path)),
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
    }
}

fn serde_yaml_string<T: serde::Serialize>(value: &T) -> String {
    serde_yaml::to_string(value).unwrap_or_default()
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

// ── Interactive session ──────────────────────────────────────────────────────

/// Approval requests seen on the wire, kept so `/approve` can rebuild the
/// response envelope: toolCallId → (tool name, args, working dir).
type PendingApprovals = Arc<Mutex<HashMap<String, (String, serde_json::Value, Option<String>)>>>;

struct Repl {
    manager: Arc<WorldManager>,
    selected: Option<Arc<World>>,
    printer: Option<tokio::task::JoinHandle<()>>,
    pending: PendingApprovals,
}

async fn run_repl(manager: Arc<WorldManager>, initial_world: Option<String>) -> anyhow::Result<()> {
    let mut repl = Repl {
        manager,
        selected: None,
        printer: None,
        pending: Arc::new(Mutex::new(HashMap::new())),
    };

    println!("varld — type /help for commands");
    if let Some(id) = initial_world {
        match repl.select_world(&id).await {
            Ok(()) => println!("selected world '{id}'"),
            Err(e) => println!("cannot select '{id}': {e}"),
        }
    }

    use tokio::io::AsyncBufReadExt;
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        let command = match parse_line(&line) {
            Ok(c) => c,
            Err(msg) => {
                if !msg.is_empty() {
                    println!("{msg}");
                }
                continue;
            }
        };
        match repl.execute(command).await {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => println!("error: {e}"),
        }
    }

    if let Some(task) = repl.printer.take() {
        task.abort();
    }
    Ok(())
}

impl Repl {
    fn world(&self) -> anyhow::Result<Arc<World>> {
        self.selected
            .clone()
            .context("no world selected; use /world select <id>")
    }

    async fn select_world(&mut self, id: &str) -> anyhow::Result<()> {
        let world = self.manager.get_world(id).await?;
        if let Some(task) = self.printer.take() {
            task.abort();
        }
        self.printer = Some(spawn_printer(&world, Arc::clone(&self.pending)));
        self.selected = Some(world);
        Ok(())
    }

    /// Execute one command.  Returns `true` when the session should end.
    async fn execute(&mut self, command: ReplCommand) -> anyhow::Result<bool> {
        match command {
            ReplCommand::Help => println!("{HELP_TEXT}"),
            ReplCommand::Quit => return Ok(true),

            // ── Worlds ────────────────────────────────────────────────────────
            ReplCommand::WorldList => {
                let worlds = self.manager.list_worlds().await?;
                if worlds.is_empty() {
                    println!("no worlds yet; /world create <name>");
                }
                for w in worlds {
                    let marker = self
                        .selected
                        .as_ref()
                        .map(|s| if s.id() == w.id { "*" } else { " " })
                        .unwrap_or(" ");
                    println!("{marker} {:<20} {:<24} turn limit {}", w.id, w.name, w.turn_limit);
                }
            }
            ReplCommand::WorldShow => {
                let world = self.world()?;
                let cfg = world.config().await;
                println!("{}", serde_yaml_string(&cfg));
            }
            ReplCommand::WorldCreate { name, description } => {
                let world = self.manager.create_world(&name, &description).await?;
                let id = world.id();
                self.select_world(&id).await?;
                println!("created and selected world '{id}'");
            }
            ReplCommand::WorldUpdate {
                description,
                turn_limit,
            } => {
                let world = self.world()?;
                world
                    .update_config(|cfg| {
                        if let Some(d) = description {
                            cfg.description = d;
                        }
                        if let Some(l) = turn_limit {
                            cfg.turn_limit = l;
                        }
                    })
                    .await?;
                println!("world updated");
            }
            ReplCommand::WorldDelete { id } => {
                if self.selected.as_ref().map(|w| w.id()) == Some(id.clone()) {
                    if let Some(task) = self.printer.take() {
                        task.abort();
                    }
                    self.selected = None;
                }
                self.manager.delete_world(&id).await?;
                println!("deleted world '{id}'");
            }
            ReplCommand::WorldSelect { id } => {
                self.select_world(&id).await?;
                println!("selected world '{id}'");
            }
            ReplCommand::WorldExport { file } => {
                let world = self.world()?;
                let chat_id = world
                    .active_chat()
                    .context("no active chat in this world")?;
                let snapshot = world.create_world_chat(&chat_id).await?;
                let path = file.unwrap_or_else(|| format!("{}-{chat_id}.json", world.id()));
                std::fs::write(&path, serde_json::to_string_pretty(&snapshot)?)?;
                println!("exported active chat to {path}");
            }

            // ── Agents ────────────────────────────────────────────────────────
            ReplCommand::AgentList => {
                let world = self.world()?;
                for a in world.list_agents().await {
                    println!(
                        "{:<16} {:<20} {}/{} ({} llm calls)",
                        a.config.id,
                        a.config.name,
                        a.config.provider,
                        a.config.model,
                        a.config.llm_call_count
                    );
                }
            }
            ReplCommand::AgentShow { id } => {
                let world = self.world()?;
                match world.get_agent(&id).await {
                    Some(a) => {
                        println!("{}", serde_yaml_string(&a.config));
                        println!("--- system prompt ---\n{}", a.system_prompt);
                        println!("--- memory: {} entries ---", a.memory.len());
                    }
                    None => println!("no agent '{id}'"),
                }
            }
            ReplCommand::AgentCreate { name, prompt } => {
                let world = self.world()?;
                let agent = world
                    .create_agent(AgentParams {
                        name,
                        system_prompt: prompt,
                        ..AgentParams::default()
                    })
                    .await?;
                println!("created agent '{}'", agent.config.id);
            }
            ReplCommand::AgentUpdate { id, prompt } => {
                let world = self.world()?;
                world
                    .update_agent(
                        &id,
                        AgentParams {
                            system_prompt: Some(prompt),
                            ..AgentParams::default()
                        },
                    )
                    .await?;
                println!("updated agent '{id}'");
            }
            ReplCommand::AgentDelete { id } => {
                let world = self.world()?;
                if world.delete_agent(&id).await? {
                    println!("deleted agent '{id}'");
                } else {
                    println!("no agent '{id}'");
                }
            }
            ReplCommand::AgentClear { id } => {
                let world = self.world()?;
                world.clear_agent_memory(&id).await?;
                println!("cleared memory of '{id}'");
            }

            // ── Chats ─────────────────────────────────────────────────────────
            ReplCommand::ChatList => {
                let world = self.world()?;
                let active = world.active_chat();
                for c in world.list_chats().await? {
                    let marker = if active.as_deref() == Some(c.id.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    println!(
                        "{marker} {:<36} {:<20} {} messages",
                        c.id, c.name, c.message_count
                    );
                }
            }
            ReplCommand::ChatCreate { name } => {
                let world = self.world()?;
                let chat = world.create_chat(&name, "").await?;
                println!("created chat '{}' ({})", chat.name, chat.id);
            }
            ReplCommand::ChatNew => {
                let world = self.world()?;
                let chat = world.new_chat().await?;
                println!("created chat '{}' ({})", chat.name, chat.id);
            }
            ReplCommand::ChatSwitch { id } => {
                let world = self.world()?;
                world.set_chat(&id).await?;
                println!("switched to chat '{id}'");
            }
            ReplCommand::ChatDelete { id } => {
                let world = self.world()?;
                if world.delete_chat(&id).await? {
                    println!("deleted chat '{id}'");
                } else {
                    println!("no chat '{id}'");
                }
            }
            ReplCommand::ChatRename {
                id,
                name,
                description,
            } => {
                let world = self.world()?;
                world
                    .update_chat(&id, Some(&name), description.as_deref())
                    .await?;
                println!("renamed chat '{id}'");
            }
            ReplCommand::ChatExport { id, file } => {
                let world = self.world()?;
                let chat_id = match id {
                    Some(id) => id,
                    None => world.active_chat().context("no active chat")?,
                };
                let snapshot = world.create_world_chat(&chat_id).await?;
                let path = file.unwrap_or_else(|| format!("{chat_id}.json"));
                std::fs::write(&path, serde_json::to_string_pretty(&snapshot)?)?;
                println!("exported chat '{chat_id}' to {path}");
            }

            // ── Approvals ─────────────────────────────────────────────────────
            ReplCommand::Approve {
                tool_call_id,
                choice,
            } => {
                let world = self.world()?;
                let decision = match choice.as_str() {
                    "deny" | "cancel" => "deny",
                    "once" | "approve_once" => "approve_once",
                    "session" | "always" | "approve_session" => "approve_session",
                    other => anyhow::bail!("unknown choice '{other}'; use deny|once|session"),
                };
                let (tool_name, args, working_dir) = self
                    .pending
                    .lock()
                    .unwrap()
                    .remove(&tool_call_id)
                    .with_context(|| format!("no pending approval '{tool_call_id}'"))?;
                let envelope = wire::approval_response_envelope(
                    &tool_call_id,
                    "",
                    decision,
                    None,
                    &tool_name,
                    &args,
                    working_dir.as_deref(),
                );
                world.post_inbound(&envelope).await?;
                println!("answered '{tool_call_id}' with {decision}");
            }

            // ── Plain messages ────────────────────────────────────────────────
            ReplCommand::Message(text) => {
                let world = self.world()?;
                world.post_inbound(&text).await?;
            }
        }
        Ok(false)
    }
}

/// Render the selected world's traffic: chat messages, approval requests,
/// streaming errors, and system notices.
fn spawn_printer(world: &Arc<World>, pending: PendingApprovals) -> tokio::task::JoinHandle<()> {
    let mut messages = world.subscribe_messages();
    let mut sse = world.subscribe_sse();
    let mut system = world.subscribe_system();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = messages.recv() => match msg {
                    Ok(ev) => print_message(&ev, &pending),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                frame = sse.recv() => match frame {
                    Ok(ev) => {
                        if ev.phase == SsePhase::Error {
                            println!(
                                "!! {} stream error: {}",
                                ev.agent_name,
                                ev.error.unwrap_or_default()
                            );
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                notice = system.recv() => match notice {
                    Ok(ev) => println!("[{}] {}", ev.category, ev.content),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

fn print_message(ev: &MessageEvent, pending: &PendingApprovals) {
    if let Some(calls) = &ev.tool_calls {
        if let Some(tc) = calls.iter().find(|t| t.name == APPROVAL_TOOL_NAME) {
            let tool = tc.arguments["originalToolCall"]["name"]
                .as_str()
                .unwrap_or("?")
                .to_string();
            let args = tc.arguments["originalToolCall"]["args"].clone();
            let wd = tc.arguments["workingDirectory"]
                .as_str()
                .map(str::to_string);
            println!(
                "[approval] {} wants to run '{tool}' {args} — reply with /approve {} deny|once|session",
                ev.sender, tc.id
            );
            pending
                .lock()
                .unwrap()
                .insert(tc.id.clone(), (tool, args, wd));
            return;
        }
    }
    // The human's own input is already on the terminal.
    if ev.sender != varld_core::HUMAN_SENDER {
        println!("{}: {}", ev.sender, ev.content);
    }
}
