use std::fmt::Write as _;
use std::io::{self, IsTerminal};

use core_model::{Message, MessageStatus, Role, ToolCallStatus};
use owo_colors::OwoColorize;
use replay::{ConfirmationStatus, ReplaySequencer};

pub fn color_enabled() -> bool {
    io::stdout().is_terminal()
        && io::stderr().is_terminal()
        && std::env::var_os("NO_COLOR").is_none()
}

pub fn truncate_text(input: &str, max: usize) -> String {
    let mut out = String::new();
    for (i, ch) in input.chars().enumerate() {
        if i >= max {
            out.push_str("...");
            return out;
        }
        out.push(ch);
    }
    out
}

fn role_label(role: Role, use_color: bool) -> String {
    let label = format!("[{role}]");
    match (use_color, role) {
        (false, _) => label,
        (true, Role::User) => label.cyan().bold().to_string(),
        (true, Role::Assistant) => label.green().bold().to_string(),
    }
}

fn dim(text: &str, use_color: bool) -> String {
    if use_color {
        text.dimmed().to_string()
    } else {
        text.to_string()
    }
}

pub fn render_timeline(session_key: &str, messages: &[Message], use_color: bool) -> String {
    let mut out = String::new();
    let header = format!("# {session_key} ({} messages)", messages.len());
    let _ = writeln!(out, "{}", if use_color { header.bold().to_string() } else { header });
    for message in messages {
        let mut meta = vec![message.timestamp.to_rfc3339(), message.id.clone()];
        if let Some(status) = message.status {
            meta.push(
                match status {
                    MessageStatus::Sending => "sending",
                    MessageStatus::Failed => "failed",
                    MessageStatus::Waiting => "waiting",
                }
                .to_string(),
            );
        }
        let _ = writeln!(
            out,
            "{} {}",
            role_label(message.role, use_color),
            dim(&meta.join(" · "), use_color)
        );
        for line in message.content.lines() {
            let _ = writeln!(out, "  {line}");
        }
        for call in &message.tool_calls {
            let name = call.name.as_deref().unwrap_or("tool");
            let status = match call.status {
                ToolCallStatus::Running => "running".to_string(),
                ToolCallStatus::Done => match call.duration_ms {
                    Some(ms) => format!("done, {ms}ms"),
                    None => "done".to_string(),
                },
            };
            let _ = writeln!(out, "  -> {name} ({status})");
        }
        for result in &message.tool_results {
            let key = result
                .tool_call_id
                .as_deref()
                .or(result.tool_name.as_deref())
                .unwrap_or("result");
            let marker = if result.is_error == Some(true) { "!!" } else { "<-" };
            let content = result.content.as_deref().unwrap_or_default().replace('\n', " ");
            let _ = writeln!(out, "  {marker} {key}: {}", truncate_text(&content, 80));
        }
        if let Some(usage) = message.usage {
            let counters = format!(
                "tokens in={} out={} total={}",
                usage.input.unwrap_or(0),
                usage.output.unwrap_or(0),
                usage.total.unwrap_or(0)
            );
            let _ = writeln!(out, "  {}", dim(&counters, use_color));
        }
    }
    out
}

/// What a renderer would show for the sequencer's current cursor.
pub fn render_replay_frame(sequencer: &ReplaySequencer, use_color: bool) -> String {
    let snapshot = sequencer.snapshot();
    let mut out = String::new();
    for (m, message) in snapshot.messages.iter().enumerate() {
        if !sequencer.is_message_visible(m) {
            break;
        }
        let _ = writeln!(out, "{}", role_label(message.role, use_color));
        for (s, section) in message.sections.iter().enumerate() {
            if !sequencer.is_section_visible(m, s) {
                break;
            }
            let text = sequencer.display_text(m, s, &section.text);
            if !text.is_empty() {
                let _ = writeln!(out, "  {}", text.replace('\n', "\n  "));
            }
            for (d, detail) in section.details.iter().enumerate() {
                if sequencer.is_detail_visible(m, s, d) {
                    let _ = writeln!(out, "    · {}", sequencer.detail_display_text(m, s, d, detail));
                }
            }
            for k in 0..section.tool_calls {
                if sequencer.is_tool_call_visible(m, s, k) {
                    let _ = writeln!(out, "    {}", dim(&format!("tool call #{}", k + 1), use_color));
                }
            }
            let confirmation = match sequencer.confirmation_status(m, s) {
                ConfirmationStatus::Hidden => None,
                ConfirmationStatus::Waiting => Some("awaiting confirmation"),
                ConfirmationStatus::Answered => Some("confirmed"),
            };
            if let Some(label) = confirmation {
                let _ = writeln!(out, "    [{label}]");
            }
        }
    }
    out
}
