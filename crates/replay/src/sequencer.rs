use std::sync::Arc;

use core_model::Role;
use tracing::debug;

use crate::words::word_ends;
use crate::{
    ConfirmationStatus, ReplayConfig, ReplayMessage, ReplaySection, ReplaySnapshot, RevealUnit,
    SectionKind,
};

/// Innermost position within the current section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Text { revealed: usize },
    Detail { index: usize, revealed: usize },
    ToolCalls { revealed: usize },
    Confirmation { held: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub message: usize,
    pub section: usize,
    pub phase: Phase,
}

impl Cursor {
    fn at(message: usize, section: usize) -> Self {
        Self {
            message,
            section,
            phase: Phase::Text { revealed: 0 },
        }
    }
}

enum Position {
    Revealed,
    Current(Phase),
    Hidden,
}

/// Reveals a frozen snapshot one step per tick. Without a cursor (never
/// started, or run to completion) everything counts as revealed.
#[derive(Debug)]
pub struct ReplaySequencer {
    config: ReplayConfig,
    snapshot: Arc<ReplaySnapshot>,
    cursor: Option<Cursor>,
    running: bool,
    ticks: u64,
}

impl ReplaySequencer {
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            config,
            snapshot: Arc::new(ReplaySnapshot::default()),
            cursor: None,
            running: false,
            ticks: 0,
        }
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    pub fn snapshot(&self) -> &Arc<ReplaySnapshot> {
        &self.snapshot
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Ticks applied since the last `start`.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Restarts from the beginning of `snapshot`, discarding any previous run.
    pub fn start(&mut self, snapshot: Arc<ReplaySnapshot>) {
        self.ticks = 0;
        self.running = !snapshot.messages.is_empty();
        self.cursor = self.running.then(|| Cursor::at(0, 0));
        debug!(messages = snapshot.messages.len(), "replay started");
        self.snapshot = snapshot;
    }

    /// Freezes the cursor where it is.
    pub fn stop(&mut self) {
        if self.running {
            debug!(ticks = self.ticks, "replay stopped");
        }
        self.running = false;
    }

    /// Advances by exactly one step. Returns whether the replay is still
    /// running afterwards.
    pub fn tick(&mut self) -> bool {
        if !self.running {
            return false;
        }
        let Some(cursor) = self.cursor else {
            self.running = false;
            return false;
        };
        self.ticks += 1;
        self.cursor = match self.step(cursor) {
            Some(phase) => Some(Cursor { phase, ..cursor }),
            None => self.following(cursor),
        };
        if self.cursor.is_none() {
            debug!(ticks = self.ticks, "replay finished");
            self.running = false;
        }
        self.running
    }

    pub fn is_message_visible(&self, message: usize) -> bool {
        self.cursor.is_none_or(|c| message <= c.message)
    }

    pub fn is_section_visible(&self, message: usize, section: usize) -> bool {
        !matches!(self.position(message, section), Position::Hidden)
    }

    /// The revealed part of a section's text.
    pub fn display_text<'a>(&self, message: usize, section: usize, full: &'a str) -> &'a str {
        match self.position(message, section) {
            Position::Revealed => full,
            Position::Hidden => "",
            Position::Current(Phase::Text { revealed }) => self.prefix(full, revealed),
            Position::Current(_) => full,
        }
    }

    pub fn is_detail_visible(&self, message: usize, section: usize, detail: usize) -> bool {
        match self.position(message, section) {
            Position::Revealed => true,
            Position::Hidden | Position::Current(Phase::Text { .. }) => false,
            Position::Current(Phase::Detail { index, .. }) => detail <= index,
            Position::Current(_) => true,
        }
    }

    pub fn detail_display_text<'a>(
        &self,
        message: usize,
        section: usize,
        detail: usize,
        full: &'a str,
    ) -> &'a str {
        match self.position(message, section) {
            Position::Revealed => full,
            Position::Hidden | Position::Current(Phase::Text { .. }) => "",
            Position::Current(Phase::Detail { index, revealed }) => {
                if detail < index {
                    full
                } else if detail == index {
                    self.prefix(full, revealed)
                } else {
                    ""
                }
            }
            Position::Current(_) => full,
        }
    }

    pub fn is_tool_call_visible(&self, message: usize, section: usize, tool_call: usize) -> bool {
        match self.position(message, section) {
            Position::Revealed => true,
            Position::Hidden => false,
            Position::Current(Phase::ToolCalls { revealed }) => tool_call < revealed,
            Position::Current(Phase::Confirmation { .. }) => true,
            Position::Current(_) => false,
        }
    }

    pub fn confirmation_status(&self, message: usize, section: usize) -> ConfirmationStatus {
        let Some(confirmation) = self
            .section_at(message, section)
            .and_then(|s| s.confirmation)
        else {
            return ConfirmationStatus::Hidden;
        };
        let settled = if confirmation.answered {
            ConfirmationStatus::Answered
        } else {
            ConfirmationStatus::Waiting
        };
        match self.position(message, section) {
            Position::Revealed => settled,
            Position::Hidden => ConfirmationStatus::Hidden,
            Position::Current(Phase::Confirmation { held })
                if held >= self.config.confirmation_hold_ticks =>
            {
                settled
            }
            Position::Current(Phase::Confirmation { .. }) => ConfirmationStatus::Waiting,
            Position::Current(_) => ConfirmationStatus::Hidden,
        }
    }

    fn position(&self, message: usize, section: usize) -> Position {
        let Some(c) = self.cursor else {
            return Position::Revealed;
        };
        match (message, section).cmp(&(c.message, c.section)) {
            std::cmp::Ordering::Less => Position::Revealed,
            std::cmp::Ordering::Equal => Position::Current(c.phase),
            std::cmp::Ordering::Greater => Position::Hidden,
        }
    }

    fn message_at(&self, message: usize) -> Option<&ReplayMessage> {
        self.snapshot.messages.get(message)
    }

    fn section_at(&self, message: usize, section: usize) -> Option<&ReplaySection> {
        self.message_at(message)?.sections.get(section)
    }

    /// The phase after one unit of progress, or None when the current phase
    /// has nothing left to reveal.
    fn step(&self, cursor: Cursor) -> Option<Phase> {
        let message = self.message_at(cursor.message)?;
        let section = message.sections.get(cursor.section)?;
        let per_tick = self.config.chars_per_tick.max(1);
        match cursor.phase {
            Phase::Text { revealed } => {
                let total = self.unit_count(&section.text);
                let instant = message.role == Role::User || section.kind == SectionKind::Step;
                (revealed < total).then(|| Phase::Text {
                    revealed: if instant { total } else { (revealed + per_tick).min(total) },
                })
            }
            Phase::Detail { index, revealed } => {
                let total = self.unit_count(section.details.get(index)?);
                (revealed < total).then(|| Phase::Detail {
                    index,
                    revealed: (revealed + per_tick).min(total),
                })
            }
            Phase::ToolCalls { revealed } => {
                (revealed < section.tool_calls).then_some(Phase::ToolCalls {
                    revealed: revealed + 1,
                })
            }
            Phase::Confirmation { held } => (held < self.config.confirmation_hold_ticks)
                .then_some(Phase::Confirmation { held: held + 1 }),
        }
    }

    /// The next non-empty phase, section or message after `cursor`.
    fn following(&self, cursor: Cursor) -> Option<Cursor> {
        if let Some(section) = self.section_at(cursor.message, cursor.section) {
            let next_detail = match cursor.phase {
                Phase::Text { .. } => Some(0),
                Phase::Detail { index, .. } => Some(index + 1),
                _ => None,
            };
            if let Some(index) = next_detail.filter(|i| *i < section.details.len()) {
                return Some(Cursor {
                    phase: Phase::Detail { index, revealed: 0 },
                    ..cursor
                });
            }
            let before_tools = matches!(cursor.phase, Phase::Text { .. } | Phase::Detail { .. });
            if before_tools && section.tool_calls > 0 {
                return Some(Cursor {
                    phase: Phase::ToolCalls { revealed: 0 },
                    ..cursor
                });
            }
            let held = matches!(cursor.phase, Phase::Confirmation { .. });
            if !held && section.confirmation.is_some() && self.config.confirmation_hold_ticks > 0
            {
                return Some(Cursor {
                    phase: Phase::Confirmation { held: 0 },
                    ..cursor
                });
            }
        }
        let sections = self.message_at(cursor.message).map_or(0, |m| m.sections.len());
        if cursor.section + 1 < sections {
            return Some(Cursor::at(cursor.message, cursor.section + 1));
        }
        (cursor.message + 1 < self.snapshot.messages.len())
            .then(|| Cursor::at(cursor.message + 1, 0))
    }

    fn unit_count(&self, text: &str) -> usize {
        match self.config.unit {
            RevealUnit::Chars => text.chars().count(),
            RevealUnit::Words => word_ends(text).len(),
        }
    }

    fn prefix<'a>(&self, text: &'a str, units: usize) -> &'a str {
        if units == 0 {
            return "";
        }
        let end = match self.config.unit {
            RevealUnit::Chars => text.char_indices().nth(units).map(|(i, _)| i),
            RevealUnit::Words => word_ends(text).get(units - 1).copied(),
        };
        end.map_or(text, |end| &text[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Confirmation;

    fn section(kind: SectionKind, text: &str) -> ReplaySection {
        ReplaySection {
            kind,
            text: text.to_string(),
            details: Vec::new(),
            tool_calls: 0,
            confirmation: None,
        }
    }

    fn plain(role: Role, text: &str) -> ReplayMessage {
        ReplayMessage {
            role,
            sections: vec![section(SectionKind::Summary, text)],
        }
    }

    fn three_messages() -> Arc<ReplaySnapshot> {
        Arc::new(ReplaySnapshot {
            messages: vec![
                plain(Role::User, "hi there"),
                plain(Role::Assistant, "hello"),
                plain(Role::Assistant, "bye"),
            ],
        })
    }

    fn sequencer() -> ReplaySequencer {
        ReplaySequencer::new(ReplayConfig::default())
    }

    type Frame = (Option<Cursor>, Vec<bool>, Vec<String>);

    fn frame(seq: &ReplaySequencer) -> Frame {
        let snapshot = Arc::clone(seq.snapshot());
        let visible = (0..snapshot.messages.len())
            .map(|i| seq.is_message_visible(i))
            .collect();
        let texts = snapshot
            .messages
            .iter()
            .enumerate()
            .map(|(i, m)| seq.display_text(i, 0, &m.sections[0].text).to_string())
            .collect();
        (seq.cursor(), visible, texts)
    }

    #[test]
    fn same_tick_count_gives_same_state_after_restart() {
        let snapshot = three_messages();
        let mut seq = sequencer();
        for n in [0, 1, 4, 7, 12] {
            seq.start(Arc::clone(&snapshot));
            for _ in 0..n {
                seq.tick();
            }
            let first = frame(&seq);
            seq.stop();
            seq.start(Arc::clone(&snapshot));
            for _ in 0..n {
                seq.tick();
            }
            assert_eq!(frame(&seq), first, "diverged at tick {n}");
        }
    }

    #[test]
    fn reveals_message_by_message_then_char_by_char() {
        let mut seq = sequencer();
        seq.start(three_messages());
        assert!(seq.is_message_visible(0));
        assert!(!seq.is_message_visible(1));

        // User text appears in one tick.
        seq.tick();
        assert_eq!(seq.display_text(0, 0, "hi there"), "hi there");

        // Moving to the next message costs one tick, then one char per tick.
        seq.tick();
        assert!(seq.is_message_visible(1));
        assert_eq!(seq.display_text(1, 0, "hello"), "");
        seq.tick();
        seq.tick();
        assert_eq!(seq.display_text(1, 0, "hello"), "he");
        assert_eq!(seq.display_text(2, 0, "bye"), "");
        assert!(!seq.is_message_visible(2));
    }

    #[test]
    fn finishing_returns_to_idle_with_everything_visible() {
        let mut seq = sequencer();
        seq.start(three_messages());
        let mut ticks = 0;
        while seq.tick() {
            ticks += 1;
            assert!(ticks < 100);
        }
        assert!(!seq.is_running());
        assert!(seq.cursor().is_none());
        assert!(seq.is_message_visible(2));
        assert_eq!(seq.display_text(2, 0, "bye"), "bye");
        // user(1) + hop + hello(5) + hop + bye(3) + final hop
        assert_eq!(seq.ticks(), 12);
    }

    #[test]
    fn stop_freezes_the_cursor() {
        let mut seq = sequencer();
        seq.start(three_messages());
        for _ in 0..4 {
            seq.tick();
        }
        let frozen = frame(&seq);
        seq.stop();
        assert!(!seq.tick());
        assert_eq!(frame(&seq), frozen);
        assert_eq!(seq.display_text(1, 0, "hello"), "he");
    }

    #[test]
    fn empty_snapshot_stays_idle() {
        let mut seq = sequencer();
        seq.start(Arc::new(ReplaySnapshot::default()));
        assert!(!seq.is_running());
        assert!(!seq.tick());
        assert!(seq.cursor().is_none());
    }

    #[test]
    fn words_unit_reveals_whole_words() {
        let mut seq = ReplaySequencer::new(ReplayConfig {
            unit: RevealUnit::Words,
            chars_per_tick: 1,
            ..ReplayConfig::default()
        });
        seq.start(Arc::new(ReplaySnapshot {
            messages: vec![plain(Role::Assistant, "分析完成! all good")],
        }));
        seq.tick();
        seq.tick();
        assert_eq!(seq.display_text(0, 0, "分析完成! all good"), "分析");
        seq.tick();
        seq.tick();
        seq.tick();
        assert_eq!(seq.display_text(0, 0, "分析完成! all good"), "分析完成! all ");
    }

    #[test]
    fn structured_sections_walk_details_tools_and_confirmation() {
        let step = ReplaySection {
            kind: SectionKind::Step,
            text: "Read files".to_string(),
            details: vec!["ab".to_string(), "c".to_string()],
            tool_calls: 2,
            confirmation: Some(Confirmation { answered: true }),
        };
        let mut seq = ReplaySequencer::new(ReplayConfig {
            confirmation_hold_ticks: 2,
            ..ReplayConfig::default()
        });
        seq.start(Arc::new(ReplaySnapshot {
            messages: vec![ReplayMessage {
                role: Role::Assistant,
                sections: vec![step, section(SectionKind::Summary, "ok")],
            }],
        }));

        assert!(!seq.is_section_visible(0, 1));
        assert_eq!(seq.confirmation_status(0, 0), ConfirmationStatus::Hidden);

        // Step titles appear whole.
        seq.tick();
        assert_eq!(seq.display_text(0, 0, "Read files"), "Read files");
        assert!(!seq.is_detail_visible(0, 0, 0));

        seq.tick();
        assert!(seq.is_detail_visible(0, 0, 0));
        assert_eq!(seq.detail_display_text(0, 0, 0, "ab"), "");
        seq.tick();
        assert_eq!(seq.detail_display_text(0, 0, 0, "ab"), "a");
        seq.tick();
        assert_eq!(seq.detail_display_text(0, 0, 0, "ab"), "ab");
        assert!(!seq.is_detail_visible(0, 0, 1));

        seq.tick();
        assert!(seq.is_detail_visible(0, 0, 1));
        assert_eq!(seq.detail_display_text(0, 0, 0, "ab"), "ab");
        seq.tick();
        assert_eq!(seq.detail_display_text(0, 0, 1, "c"), "c");
        assert!(!seq.is_tool_call_visible(0, 0, 0));

        seq.tick();
        assert!(!seq.is_tool_call_visible(0, 0, 0));
        seq.tick();
        assert!(seq.is_tool_call_visible(0, 0, 0));
        assert!(!seq.is_tool_call_visible(0, 0, 1));
        seq.tick();
        assert!(seq.is_tool_call_visible(0, 0, 1));
        assert_eq!(seq.confirmation_status(0, 0), ConfirmationStatus::Hidden);

        seq.tick();
        assert_eq!(seq.confirmation_status(0, 0), ConfirmationStatus::Waiting);
        seq.tick();
        assert_eq!(seq.confirmation_status(0, 0), ConfirmationStatus::Waiting);
        seq.tick();
        assert_eq!(seq.confirmation_status(0, 0), ConfirmationStatus::Answered);

        seq.tick();
        assert!(seq.is_section_visible(0, 1));
        assert_eq!(seq.confirmation_status(0, 0), ConfirmationStatus::Answered);
        assert_eq!(seq.display_text(0, 1, "ok"), "");
    }

    #[test]
    fn unanswered_confirmation_settles_as_waiting() {
        let mut step = section(SectionKind::Step, "Deploy?");
        step.confirmation = Some(Confirmation { answered: false });
        let mut seq = sequencer();
        assert_eq!(seq.confirmation_status(0, 0), ConfirmationStatus::Hidden);
        seq.start(Arc::new(ReplaySnapshot {
            messages: vec![ReplayMessage {
                role: Role::Assistant,
                sections: vec![step],
            }],
        }));
        while seq.tick() {}
        assert_eq!(seq.confirmation_status(0, 0), ConfirmationStatus::Waiting);
    }

    #[test]
    fn message_without_sections_is_skipped() {
        let mut seq = sequencer();
        seq.start(Arc::new(ReplaySnapshot {
            messages: vec![
                ReplayMessage {
                    role: Role::Assistant,
                    sections: Vec::new(),
                },
                plain(Role::User, "next"),
            ],
        }));
        seq.tick();
        assert_eq!(seq.cursor(), Some(Cursor::at(1, 0)));
    }
}
