//! Colored status lines for the command line

use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

use ca_core::{BindDecision, NetworkMode};

/// Print a success message (green check)
pub fn print_success(msg: &str) {
    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message (red cross) to stderr
pub fn print_error(msg: &str) {
    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning (yellow) to stderr
pub fn print_warning(msg: &str) {
    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message (cyan)
pub fn print_info(msg: &str) {
    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Text shown to the user once the relay is listening
///
/// The token is only included when the mode requires one.
pub fn format_connection_info(decision: &BindDecision, token: Option<&str>) -> String {
    let mut lines = vec![format!("URL:   {}", decision.ws_url())];
    match (decision.mode, token) {
        (NetworkMode::LocalSubnet, Some(token)) => lines.push(format!("Token: {}", token)),
        (NetworkMode::LocalSubnet, None) => {
            lines.push("Token: run `ca-relay token show`".to_string())
        }
        (NetworkMode::VpnOverlay, _) => {
            lines.push("Auth:  none (overlay network peers are trusted)".to_string())
        }
    }
    lines.join("\n")
}
