//! Agentic coding assistant: agent loop, guarded tools, REPL and editor RPC.
//!
//! ## Provider bootstrap
//!
//! The provider comes from `--provider`, else `CODING_AGENT_PROVIDER`, else
//! the config file's `[provider].id`, else `mock`:
//!
//! - `mock` for deterministic local runs and tests
//! - `openai`, `anthropic`, `gemini` read their key from the backend's API key
//!   environment variable (`OPENAI_API_KEY`, `ANTHROPIC_API_KEY`, ...)
//! - `ollama` talks to a local server and needs no key
//!
//! Keys are never written to the config file or the transcript.
//!
//! ## Safety contract
//!
//! Every tool call is validated by `tool_policy` before it runs. Mutating calls
//! (`write_file`, `edit_file`, `bash`) are snapshotted into the session's
//! checkpoint partition and recorded in its audit log before they touch the
//! workspace; if either write fails the tool does not run. `/rewind` restores
//! any checkpoint and snapshots the current state first.
//!
//! ## System instructions
//!
//! Set `CODING_AGENT_SYSTEM_INSTRUCTIONS` (or `[agent].system_instructions`) to
//! replace the built-in base block; the tool-use policy, tool inventory and
//! working directory are always appended.
//!
//! Conversation memory contract: the session transcript is the source of truth
//! and is replayed on every turn through provider-neutral `RunMessage` items.

pub mod agent;
pub mod commands;
pub mod config;
pub mod diff;
pub mod logging;
pub mod prompt;
pub mod providers;
pub mod repl;
pub mod rpc;
pub mod runtime;
pub mod session;
pub mod tools;
