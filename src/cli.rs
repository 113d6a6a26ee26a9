// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// varld — a multi-agent world runtime.
///
/// Without a subcommand an interactive session starts: slash commands manage
/// worlds, agents, and chats; any other input is published into the selected
/// world as a message from HUMAN.
#[derive(Parser, Debug)]
#[command(name = "varld", version, about)]
pub struct Cli {
    /// Explicit config file (merged over the discovered layers)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Storage root override (equivalent to AGENT_WORLD_DATA_PATH)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// World to select on startup
    #[arg(long, short = 'w')]
    pub world: Option<String>,

    /// Log to stderr (RUST_LOG still applies)
    #[arg(long, short = 'v')]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the effective merged configuration and exit.
    ShowConfig,
    /// List the recognised model providers.
    ListProviders,
    /// List stored worlds and exit.
    Worlds,
}

// ── REPL commands ─────────────────────────────────────────────────────────────

/// One parsed line of interactive input.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    WorldList,
    WorldShow,
    WorldCreate { name: String, description: String },
    WorldUpdate { description: Option<String>, turn_limit: Option<u32> },
    WorldDelete { id: String },
    WorldSelect { id: String },
    WorldExport { file: Option<String> },

    AgentList,
    AgentShow { id: String },
    AgentCreate { name: String, prompt: Option<String> },
    AgentUpdate { id: String, prompt: String },
    AgentDelete { id: String },
    AgentClear { id: String },

    ChatList,
    ChatCreate { name: String },
    ChatNew,
    ChatSwitch { id: String },
    ChatDelete { id: String },
    ChatRename { id: String, name: String, description: Option<String> },
    ChatExport { id: Option<String>, file: Option<String> },

    /// Answer a pending tool approval: `/approve <toolCallId> <deny|once|session>`.
    Approve { tool_call_id: String, choice: String },

    Help,
    Quit,
    /// Un-prefixed input: a message from HUMAN.
    Message(String),
}

/// Parse one line of interactive input.
///
/// Slash commands use whitespace-separated arguments; where a human-readable
/// tail is expected (descriptions, prompts) the rest of the line is taken
/// verbatim.
pub fn parse_line(line: &str) -> Result<ReplCommand, String> {
    let line = line.trim();
    if line.is_empty() {
        return Err(String::new());
    }
    if !line.starts_with('/') {
        return Ok(ReplCommand::Message(line.to_string()));
    }

    let mut parts = line.split_whitespace();
    let head = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    match head {
        "/help" | "/h" | "/?" => Ok(ReplCommand::Help),
        "/quit" | "/exit" | "/q" => Ok(ReplCommand::Quit),

        "/world" | "/w" => match args.first().copied() {
            Some("list") | None => Ok(ReplCommand::WorldList),
            Some("show") => Ok(ReplCommand::WorldShow),
            Some("create") => {
                let name = args
                    .get(1)
                    .ok_or("usage: /world create <name> [description]")?
                    .to_string();
                Ok(ReplCommand::WorldCreate {
                    name,
                    description: tail_after(line, 2).unwrap_or_default(),
                })
            }
            Some("update") => match args.get(1).copied() {
                Some("limit") => {
                    let n: u32 = args
                        .get(2)
                        .and_then(|s| s.parse().ok())
                        .ok_or("usage: /world update limit <number>")?;
                    Ok(ReplCommand::WorldUpdate {
                        description: None,
                        turn_limit: Some(n),
                    })
                }
                Some("desc") => Ok(ReplCommand::WorldUpdate {
                    description: Some(tail_after(line, 2).unwrap_or_default()),
                    turn_limit: None,
                }),
                _ => Err("usage: /world update limit <n> | desc <text>".into()),
            },
            Some("delete") => Ok(ReplCommand::WorldDelete {
                id: args.get(1).ok_or("usage: /world delete <id>")?.to_string(),
            }),
            Some("select") => Ok(ReplCommand::WorldSelect {
                id: args.get(1).ok_or("usage: /world select <id>")?.to_string(),
            }),
            Some("export") => Ok(ReplCommand::WorldExport {
                file: args.get(1).map(|s| s.to_string()),
            }),
            Some(other) => Err(format!("unknown world command '{other}'")),
        },

        "/agent" | "/a" => match args.first().copied() {
            Some("list") | None => Ok(ReplCommand::AgentList),
            Some("show") => Ok(ReplCommand::AgentShow {
                id: args.get(1).ok_or("usage: /agent show <id>")?.to_string(),
            }),
            Some("create") => {
                let name = args
                    .get(1)
                    .ok_or("usage: /agent create <name> [system prompt]")?
                    .to_string();
                Ok(ReplCommand::AgentCreate {
                    name,
                    prompt: tail_after(line, 2),
                })
            }
            Some("update") => {
                let id = args
                    .get(1)
                    .ok_or("usage: /agent update <id> <system prompt>")?
                    .to_string();
                Ok(ReplCommand::AgentUpdate {
                    id,
                    prompt: tail_after(line, 2).ok_or("usage: /agent update <id> <system prompt>")?,
                })
            }
            Some("delete") => Ok(ReplCommand::AgentDelete {
                id: args.get(1).ok_or("usage: /agent delete <id>")?.to_string(),
            }),
            Some("clear") => Ok(ReplCommand::AgentClear {
                id: args.get(1).ok_or("usage: /agent clear <id>")?.to_string(),
            }),
            Some(other) => Err(format!("unknown agent command '{other}'")),
        },

        "/chat" | "/c" => match args.first().copied() {
            Some("list") | None => Ok(ReplCommand::ChatList),
            Some("create") => Ok(ReplCommand::ChatCreate {
                name: tail_after(line, 1).ok_or("usage: /chat create <name>")?,
            }),
            Some("new") => Ok(ReplCommand::ChatNew),
            Some("select") | Some("switch") => Ok(ReplCommand::ChatSwitch {
                id: args.get(1).ok_or("usage: /chat switch <id>")?.to_string(),
            }),
            Some("delete") => Ok(ReplCommand::ChatDelete {
                id: args.get(1).ok_or("usage: /chat delete <id>")?.to_string(),
            }),
            Some("rename") => {
                let id = args
                    .get(1)
                    .ok_or("usage: /chat rename <id> <name> [description]")?
                    .to_string();
                let name = args
                    .get(2)
                    .ok_or("usage: /chat rename <id> <name> [description]")?
                    .to_string();
                Ok(ReplCommand::ChatRename {
                    id,
                    name,
                    description: tail_after(line, 3),
                })
            }
            Some("export") => Ok(ReplCommand::ChatExport {
                id: args.get(1).map(|s| s.to_string()),
                file: args.get(2).map(|s| s.to_string()),
            }),
            Some(other) => Err(format!("unknown chat command '{other}'")),
        },

        "/approve" => {
            let tool_call_id = args
                .first()
                .ok_or("usage: /approve <toolCallId> <deny|once|session>")?
                .to_string();
            let choice = args
                .get(1)
                .ok_or("usage: /approve <toolCallId> <deny|once|session>")?
                .to_string();
            Ok(ReplCommand::Approve {
                tool_call_id,
                choice,
            })
        }

        other => Err(format!("unknown command '{other}'; try /help")),
    }
}

/// The verbatim tail of `line` after `n` whitespace-separated tokens beyond
/// the command word.  `None` when the tail is empty.
fn tail_after(line: &str, n: usize) -> Option<String> {
    let mut rest = line.trim_start();
    // Skip the command word plus n arguments.
    for _ in 0..=n {
        let cut = rest.find(char::is_whitespace)?;
        rest = rest[cut..].trim_start();
    }
    (!rest.is_empty()).then(|| rest.trim_end().to_string())
}

pub const HELP_TEXT: &str = "\
Commands:
  /world list | show | create <name> [desc] | update limit <n> | update desc <text>
  /world select <id> | delete <id> | export [file]
  /agent list | show <id> | create <name> [prompt] | update <id> <prompt>
  /agent delete <id> | clear <id>
  /chat  list | create <name> | new | switch <id> | delete <id>
  /chat  rename <id> <name> [desc] | export [id] [file]
  /approve <toolCallId> <deny|once|session>
  /help, /quit
Anything else is sent to the selected world as a message from HUMAN.";

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(
            parse_line("hello everyone"),
            Ok(ReplCommand::Message("hello everyone".into()))
        );
    }

    #[test]
    fn empty_line_is_rejected_quietly() {
        assert!(parse_line("   ").is_err());
    }

    #[test]
    fn world_create_takes_description_tail() {
        assert_eq!(
            parse_line("/world create atlas a place for testing"),
            Ok(ReplCommand::WorldCreate {
                name: "atlas".into(),
                description: "a place for testing".into(),
            })
        );
    }

    #[test]
    fn world_list_is_the_default_world_command() {
        assert_eq!(parse_line("/world"), Ok(ReplCommand::WorldList));
        assert_eq!(parse_line("/w list"), Ok(ReplCommand::WorldList));
    }

    #[test]
    fn world_update_limit_parses_number() {
        assert_eq!(
            parse_line("/world update limit 9"),
            Ok(ReplCommand::WorldUpdate {
                description: None,
                turn_limit: Some(9)
            })
        );
    }

    #[test]
    fn agent_create_keeps_prompt_verbatim() {
        assert_eq!(
            parse_line("/agent create critic You are a harsh critic."),
            Ok(ReplCommand::AgentCreate {
                name: "critic".into(),
                prompt: Some("You are a harsh critic.".into()),
            })
        );
    }

    #[test]
    fn agent_create_without_prompt_has_none() {
        assert_eq!(
            parse_line("/agent create scout"),
            Ok(ReplCommand::AgentCreate {
                name: "scout".into(),
                prompt: None,
            })
        );
    }

    #[test]
    fn chat_switch_and_select_are_aliases() {
        assert_eq!(
            parse_line("/chat select c1"),
            Ok(ReplCommand::ChatSwitch { id: "c1".into() })
        );
        assert_eq!(
            parse_line("/chat switch c1"),
            Ok(ReplCommand::ChatSwitch { id: "c1".into() })
        );
    }

    #[test]
    fn chat_rename_takes_optional_description() {
        assert_eq!(
            parse_line("/chat rename c1 planning sprint planning notes"),
            Ok(ReplCommand::ChatRename {
                id: "c1".into(),
                name: "planning".into(),
                description: Some("sprint planning notes".into()),
            })
        );
    }

    #[test]
    fn approve_requires_id_and_choice() {
        assert!(parse_line("/approve tc-1").is_err());
        assert_eq!(
            parse_line("/approve tc-1 session"),
            Ok(ReplCommand::Approve {
                tool_call_id: "tc-1".into(),
                choice: "session".into()
            })
        );
    }

    #[test]
    fn unknown_commands_are_reported() {
        assert!(parse_line("/frobnicate").is_err());
        assert!(parse_line("/world frobnicate").is_err());
    }
}
