//! Terminal sessions: one agent process per pseudo-terminal

mod command;
mod io;
mod manager;

pub use command::{find_agent_program, resolve_working_dir, CommandSpec};
pub use io::{spawn_pty_reader, spawn_pty_writer};
pub use manager::{ProcessExit, PtySession, SessionIo, SessionManager, SessionState};
