//! Context assembly — builds the prompt for one turn.
//!
//! The output is one system entry (instructions, profile fields, file
//! manifest) followed by a trimmed history window and the new user message.
//!
//! # Determinism
//!
//! Assembly is a pure function of its input. The synthetic system message
//! takes its id and timestamp from the user message, so identical inputs
//! produce identical prompts.

use crate::context::token;
use parley_config::{ContextConfig, TrimStrategy};
use parley_core::document::FileEntry;
use parley_core::message::{Message, Role};
use parley_core::profile::ProfileField;
use serde::{Deserialize, Serialize};

/// Marker appended to a profile field that was cut short.
pub const TRUNCATION_SUFFIX: &str = "… [truncated]";

const SECTION_SEPARATOR: &str = "\n\n";
const MANIFEST_HEADER: &str = "[Available files]";

/// How much history is sent with each turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrimPolicy {
    /// Keep the last N messages regardless of their size.
    MessageCount(usize),
    /// Keep the newest messages whose estimated cost fits the budget.
    TokenBudget(usize),
}

impl TrimPolicy {
    pub fn from_config(config: &ContextConfig) -> Self {
        match config.trim {
            TrimStrategy::Messages => TrimPolicy::MessageCount(config.max_messages),
            TrimStrategy::Tokens => TrimPolicy::TokenBudget(config.history_tokens),
        }
    }
}

/// All inputs required by the assembler for a single turn.
pub struct AssemblyInput<'a> {
    /// Base instructions. Never trimmed.
    pub system_prompt: &'a str,
    /// Profile fields, least important first.
    pub profile_fields: &'a [ProfileField],
    /// Uploaded files available to the conversation, any order.
    pub files: &'a [FileEntry],
    /// Persisted thread history, oldest first.
    pub history: &'a [Message],
    /// The message that triggered this turn.
    pub user_message: &'a Message,
}

/// The assembled prompt, ready for a provider request.
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    /// System entry, history window, then the user message.
    pub messages: Vec<Message>,
    pub metadata: AssemblyMetadata,
}

impl AssembledPrompt {
    pub fn system_text(&self) -> &str {
        self.messages.first().map(|m| m.content.as_str()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssemblyMetadata {
    /// Estimated tokens of the whole prompt.
    pub estimated_tokens: usize,
    /// Budget for the system entry.
    pub system_budget: usize,
    /// Estimated tokens of the system entry.
    pub system_tokens: usize,
    /// The system entry still exceeds its budget after all truncation.
    pub over_budget: bool,
    /// Labels of profile fields that were cut short.
    pub truncated_fields: Vec<String>,
    pub files_dropped: usize,
    pub history_dropped: usize,
    pub per_layer: Vec<LayerStats>,
    pub drops: Vec<DropInfo>,
}

/// Statistics for one part of the prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerStats {
    pub name: String,
    pub tokens: usize,
    pub items_included: usize,
    pub items_total: usize,
}

/// What was removed or shortened from one part of the prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropInfo {
    pub layer: String,
    pub items_dropped: usize,
    pub tokens_dropped: usize,
    pub reason: String,
}

/// The context assembler. Stateless — create one and reuse it.
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    system_budget: usize,
    policy: TrimPolicy,
}

impl ContextAssembler {
    pub fn new(system_budget: usize, policy: TrimPolicy) -> Self {
        Self { system_budget, policy }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(config.budget_tokens, TrimPolicy::from_config(config))
    }

    pub fn policy(&self) -> TrimPolicy {
        self.policy
    }

    pub fn assemble(&self, input: &AssemblyInput<'_>) -> AssembledPrompt {
        let mut stats = Vec::new();
        let mut drops = Vec::new();

        // ── Instructions ───────────────────────────────────────────────────
        let instructions = input.system_prompt.trim().to_string();
        stats.push(LayerStats {
            name: "instructions".into(),
            tokens: token::estimate_tokens(&instructions),
            items_included: 1,
            items_total: 1,
        });

        // ── Profile fields ─────────────────────────────────────────────────
        let (profile_sections, truncated) = self.fit_profile(&instructions, input.profile_fields);
        let profile_tokens: usize = profile_sections.iter().map(|s| token::estimate_tokens(s)).sum();
        stats.push(LayerStats {
            name: "profile".into(),
            tokens: profile_tokens,
            items_included: profile_sections.len(),
            items_total: input.profile_fields.len(),
        });
        let truncated_fields: Vec<String> = input
            .profile_fields
            .iter()
            .zip(&truncated)
            .filter(|(_, t)| **t)
            .map(|(f, _)| f.label.clone())
            .collect();
        if !truncated_fields.is_empty() {
            let original: usize = input
                .profile_fields
                .iter()
                .map(|f| token::estimate_tokens(&render_field(&f.label, f.text.trim())))
                .sum();
            drops.push(DropInfo {
                layer: "profile".into(),
                items_dropped: truncated_fields.len(),
                tokens_dropped: original.saturating_sub(profile_tokens),
                reason: "Fields truncated, least important first".into(),
            });
        }

        let mut parts = vec![instructions];
        parts.extend(profile_sections);

        // ── File manifest ──────────────────────────────────────────────────
        let (manifest, files_included, files_dropped) = self.fit_manifest(&parts, input.files);
        stats.push(LayerStats {
            name: "files".into(),
            tokens: manifest.as_deref().map(token::estimate_tokens).unwrap_or(0),
            items_included: files_included,
            items_total: input.files.len(),
        });
        if files_dropped > 0 {
            drops.push(DropInfo {
                layer: "files".into(),
                items_dropped: files_dropped,
                tokens_dropped: 0,
                reason: "Oldest uploads dropped".into(),
            });
        }
        parts.extend(manifest);

        let system_text = parts.join(SECTION_SEPARATOR);
        let system_tokens = token::estimate_tokens(&system_text);

        // ── History ────────────────────────────────────────────────────────
        let (window, history_total, history_dropped_tokens) = self.trim_history(input.history, input.user_message);
        let history_dropped = history_total - window.len();
        stats.push(LayerStats {
            name: "history".into(),
            tokens: token::estimate_messages_tokens(&window),
            items_included: window.len(),
            items_total: history_total,
        });
        if history_dropped > 0 {
            drops.push(DropInfo {
                layer: "history".into(),
                items_dropped: history_dropped,
                tokens_dropped: history_dropped_tokens,
                reason: "Oldest messages dropped (sliding window)".into(),
            });
        }

        // ── Final message list ─────────────────────────────────────────────
        let mut system = Message::system(system_text).at(input.user_message.created_at);
        system.id = format!("{}:system", input.user_message.id);

        let mut messages = Vec::with_capacity(window.len() + 2);
        messages.push(system);
        messages.extend(window);
        messages.push(input.user_message.clone());

        AssembledPrompt {
            metadata: AssemblyMetadata {
                estimated_tokens: token::estimate_messages_tokens(&messages),
                system_budget: self.system_budget,
                system_tokens,
                over_budget: system_tokens > self.system_budget,
                truncated_fields,
                files_dropped,
                history_dropped,
                per_layer: stats,
                drops,
            },
            messages,
        }
    }

    /// Render profile sections, truncating fields in order until the
    /// instructions plus profile fit the system budget.
    fn fit_profile(&self, instructions: &str, fields: &[ProfileField]) -> (Vec<String>, Vec<bool>) {
        let originals: Vec<&str> = fields.iter().map(|f| f.text.trim()).collect();
        let mut texts: Vec<String> = originals.iter().map(|t| t.to_string()).collect();
        let mut truncated = vec![false; fields.len()];

        let total = |texts: &[String]| {
            let mut parts = vec![instructions.to_string()];
            parts.extend(fields.iter().zip(texts).map(|(f, t)| render_field(&f.label, t)));
            token::estimate_tokens(&parts.join(SECTION_SEPARATOR))
        };

        'fields: for i in 0..fields.len() {
            loop {
                let current_total = total(&texts);
                if current_total <= self.system_budget {
                    break 'fields;
                }
                let excess = current_total - self.system_budget;
                let current = token::estimate_tokens(&texts[i]);
                let next = truncate_to_tokens(originals[i], current.saturating_sub(excess.max(1)));
                if token::estimate_tokens(&next) >= current {
                    break;
                }
                texts[i] = next;
                truncated[i] = true;
            }
        }

        let sections = fields
            .iter()
            .zip(&texts)
            .map(|(f, t)| render_field(&f.label, t))
            .collect();
        (sections, truncated)
    }

    /// Render the manifest newest-first, dropping the oldest uploads until it fits.
    fn fit_manifest(&self, parts: &[String], files: &[FileEntry]) -> (Option<String>, usize, usize) {
        if files.is_empty() {
            return (None, 0, 0);
        }

        let mut sorted: Vec<&FileEntry> = files.iter().collect();
        sorted.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at).then_with(|| a.name.cmp(&b.name)));
        let lines: Vec<String> = sorted.iter().map(|f| render_file_line(f)).collect();

        let base = parts.join(SECTION_SEPARATOR);
        let fits = |section: &str| {
            token::estimate_tokens(&format!("{base}{SECTION_SEPARATOR}{section}")) <= self.system_budget
        };

        let n = lines.len();
        let full = render_manifest(&lines, 0);
        if fits(&full) {
            return (Some(full), n, 0);
        }
        for keep in (0..n).rev() {
            let section = render_manifest(&lines[..keep], n - keep);
            if keep == 0 || fits(&section) {
                return (Some(section), keep, n - keep);
            }
        }
        (None, 0, n)
    }

    /// Returns the window, the number of eligible history messages, and the
    /// estimated tokens of the ones left out.
    fn trim_history(&self, history: &[Message], user_message: &Message) -> (Vec<Message>, usize, usize) {
        let eligible: Vec<&Message> = history
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .filter(|m| m.id != user_message.id)
            .collect();
        let total = eligible.len();

        let keep = match self.policy {
            TrimPolicy::MessageCount(n) => n.min(total),
            TrimPolicy::TokenBudget(budget) => {
                let mut used = 0;
                let mut keep = 0;
                for msg in eligible.iter().rev() {
                    let cost = token::estimate_message_tokens(msg);
                    if used + cost > budget {
                        break;
                    }
                    used += cost;
                    keep += 1;
                }
                keep
            }
        };

        let split = total - keep;
        let dropped_tokens = eligible[..split].iter().map(|m| token::estimate_message_tokens(m)).sum();
        let window = eligible[split..].iter().map(|m| (*m).clone()).collect();
        (window, total, dropped_tokens)
    }
}

fn render_field(label: &str, text: &str) -> String {
    format!("[{label}]\n{text}")
}

fn render_file_line(file: &FileEntry) -> String {
    let uploaded = file.uploaded_at.format("%Y-%m-%d %H:%M UTC");
    if file.media_type.is_empty() {
        format!("- {} (uploaded {uploaded})", file.name)
    } else {
        format!("- {} ({}, uploaded {uploaded})", file.name, file.media_type)
    }
}

fn render_manifest(lines: &[String], dropped: usize) -> String {
    let mut out = String::from(MANIFEST_HEADER);
    for line in lines {
        out.push('\n');
        out.push_str(line);
    }
    if dropped > 0 {
        let noun = if dropped == 1 { "file" } else { "files" };
        out.push_str(&format!("\n- … and {dropped} more {noun} not shown"));
    }
    out
}

/// Cut `text` so that it plus the suffix costs at most `max_tokens`.
fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    let allowed = (max_tokens * 4).saturating_sub(TRUNCATION_SUFFIX.len() + 1);
    let end = text
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .take_while(|&end| end <= allowed)
        .last()
        .unwrap_or(0);
    let kept = text[..end].trim_end();
    if kept.is_empty() {
        TRUNCATION_SUFFIX.to_string()
    } else {
        format!("{kept} {TRUNCATION_SUFFIX}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn field(label: &str, text: String) -> ProfileField {
        ProfileField {
            label: label.into(),
            text,
        }
    }

    fn file(name: &str, minutes_ago: i64) -> FileEntry {
        let base = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        FileEntry {
            name: name.into(),
            media_type: "text/plain".into(),
            uploaded_at: base - Duration::minutes(minutes_ago),
        }
    }

    fn history(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("question {i}"))
                } else {
                    Message::assistant(format!("answer {i}"))
                }
            })
            .collect()
    }

    fn input<'a>(
        prompt: &'a str,
        fields: &'a [ProfileField],
        files: &'a [FileEntry],
        history: &'a [Message],
        user: &'a Message,
    ) -> AssemblyInput<'a> {
        AssemblyInput {
            system_prompt: prompt,
            profile_fields: fields,
            files,
            history,
            user_message: user,
        }
    }

    #[test]
    fn layout_is_system_history_user() {
        let asm = ContextAssembler::new(1_000, TrimPolicy::MessageCount(10));
        let hist = history(2);
        let user = Message::user("hello");
        let out = asm.assemble(&input("Be helpful.", &[], &[], &hist, &user));

        assert_eq!(out.messages.len(), 4);
        assert_eq!(out.messages[0].role, Role::System);
        assert_eq!(out.system_text(), "Be helpful.");
        assert_eq!(out.messages[1].content, "question 0");
        assert_eq!(out.messages[3].content, "hello");
        assert!(!out.metadata.over_budget);
    }

    #[test]
    fn message_count_keeps_most_recent() {
        let asm = ContextAssembler::new(1_000, TrimPolicy::MessageCount(3));
        let hist = history(8);
        let user = Message::user("now");
        let out = asm.assemble(&input("p", &[], &[], &hist, &user));

        let window: Vec<&str> = out.messages[1..4].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(window, vec!["answer 5", "question 6", "answer 7"]);
        assert_eq!(out.metadata.history_dropped, 5);
        assert!(out.metadata.drops.iter().any(|d| d.layer == "history" && d.items_dropped == 5));
    }

    #[test]
    fn message_count_ignores_message_size() {
        let asm = ContextAssembler::new(1_000, TrimPolicy::MessageCount(2));
        let hist = vec![Message::user("x".repeat(10_000)), Message::assistant("y".repeat(10_000))];
        let user = Message::user("now");
        let out = asm.assemble(&input("p", &[], &[], &hist, &user));
        assert_eq!(out.metadata.history_dropped, 0);
        assert_eq!(out.messages.len(), 4);
    }

    #[test]
    fn token_budget_keeps_contiguous_newest_window() {
        // Each history message costs 4 overhead + 3 tokens = 7.
        let hist: Vec<Message> = (0..6).map(|i| Message::user(format!("msg-{i}-xxx"))).collect();
        let asm = ContextAssembler::new(1_000, TrimPolicy::TokenBudget(21));
        let user = Message::user("now");
        let out = asm.assemble(&input("p", &[], &[], &hist, &user));

        let window: Vec<&str> = out.messages[1..out.messages.len() - 1]
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(window, vec!["msg-3-xxx", "msg-4-xxx", "msg-5-xxx"]);
        assert_eq!(out.metadata.history_dropped, 3);
    }

    #[test]
    fn oversized_newest_message_empties_token_window() {
        let hist = vec![Message::user("short"), Message::assistant("z".repeat(4_000))];
        let asm = ContextAssembler::new(1_000, TrimPolicy::TokenBudget(50));
        let user = Message::user("now");
        let out = asm.assemble(&input("p", &[], &[], &hist, &user));
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.metadata.history_dropped, 2);
    }

    #[test]
    fn system_and_duplicate_user_messages_are_skipped() {
        let user = Message::user("now");
        let hist = vec![Message::system("old rules"), Message::user("earlier"), user.clone()];
        let asm = ContextAssembler::new(1_000, TrimPolicy::MessageCount(10));
        let out = asm.assemble(&input("p", &[], &[], &hist, &user));
        let contents: Vec<&str> = out.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["p", "earlier", "now"]);
    }

    #[test]
    fn least_important_field_truncated_first() {
        let fields = vec![
            field("Company profile", "c".repeat(400)),
            field("User profile", "u".repeat(40)),
        ];
        let asm = ContextAssembler::new(60, TrimPolicy::MessageCount(0));
        let user = Message::user("hi");
        let out = asm.assemble(&input("Be helpful.", &fields, &[], &[], &user));

        let system = out.system_text();
        assert!(system.contains(&"u".repeat(40)), "user profile must survive intact");
        assert!(system.contains(&format!("c {TRUNCATION_SUFFIX}")));
        assert_eq!(out.metadata.truncated_fields, vec!["Company profile"]);
        assert!(out.metadata.system_tokens <= 60);
        assert!(!out.metadata.over_budget);
    }

    #[test]
    fn second_field_truncated_when_first_is_exhausted() {
        let fields = vec![
            field("Company profile", "c".repeat(400)),
            field("User profile", "u".repeat(40)),
        ];
        let asm = ContextAssembler::new(20, TrimPolicy::MessageCount(0));
        let user = Message::user("hi");
        let out = asm.assemble(&input("Be helpful.", &fields, &[], &[], &user));

        assert_eq!(out.metadata.truncated_fields, vec!["Company profile", "User profile"]);
        assert_eq!(out.system_text().matches(TRUNCATION_SUFFIX).count(), 2);
        assert!(out.metadata.system_tokens <= 20);
    }

    #[test]
    fn fields_within_budget_are_untouched() {
        let fields = vec![field("Company profile", "Acme builds anvils.".into())];
        let asm = ContextAssembler::new(500, TrimPolicy::MessageCount(0));
        let user = Message::user("hi");
        let out = asm.assemble(&input("Be helpful.", &fields, &[], &[], &user));
        assert_eq!(out.system_text(), "Be helpful.\n\n[Company profile]\nAcme builds anvils.");
        assert!(out.metadata.truncated_fields.is_empty());
        assert!(out.metadata.drops.is_empty());
    }

    #[test]
    fn manifest_keeps_most_recent_files_with_placeholder() {
        let files: Vec<FileEntry> = (0..10).map(|i| file(&format!("report-{i:02}.txt"), i * 10)).collect();
        let asm = ContextAssembler::new(60, TrimPolicy::MessageCount(0));
        let user = Message::user("hi");
        let out = asm.assemble(&input("Be helpful.", &[], &files, &[], &user));

        let meta = &out.metadata;
        assert!(meta.files_dropped > 0 && meta.files_dropped < 10);
        assert!(meta.system_tokens <= 60);
        let system = out.system_text();
        let kept = 10 - meta.files_dropped;
        for i in 0..kept {
            assert!(system.contains(&format!("report-{i:02}.txt")), "newest files are kept");
        }
        for i in kept..10 {
            assert!(!system.contains(&format!("report-{i:02}.txt")), "oldest files are dropped");
        }
        assert!(system.contains(&format!("and {} more", meta.files_dropped)));
    }

    #[test]
    fn manifest_fits_entirely_when_budget_allows() {
        let files = vec![file("old.txt", 60), file("new.txt", 1)];
        let asm = ContextAssembler::new(1_000, TrimPolicy::MessageCount(0));
        let user = Message::user("hi");
        let out = asm.assemble(&input("p", &[], &files, &[], &user));
        let system = out.system_text();
        let new_pos = system.find("new.txt").unwrap();
        let old_pos = system.find("old.txt").unwrap();
        assert!(new_pos < old_pos, "manifest lists newest first");
        assert!(!system.contains("more file"));
        assert_eq!(out.metadata.files_dropped, 0);
    }

    #[test]
    fn instructions_over_budget_are_flagged_not_cut() {
        let prompt = "p".repeat(400);
        let asm = ContextAssembler::new(10, TrimPolicy::MessageCount(0));
        let user = Message::user("hi");
        let out = asm.assemble(&input(&prompt, &[], &[], &[], &user));
        assert_eq!(out.system_text(), prompt);
        assert!(out.metadata.over_budget);
    }

    #[test]
    fn assembly_is_deterministic() {
        let fields = vec![field("Company profile", "c".repeat(300))];
        let files: Vec<FileEntry> = (0..5).map(|i| file(&format!("f{i}"), i)).collect();
        let hist = history(6);
        let user = Message::user("same input");
        let asm = ContextAssembler::new(80, TrimPolicy::TokenBudget(30));

        let a = asm.assemble(&input("p", &fields, &files, &hist, &user));
        let b = asm.assemble(&input("p", &fields, &files, &hist, &user));
        assert_eq!(a.messages, b.messages);
        assert_eq!(a.metadata.per_layer, b.metadata.per_layer);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let out = truncate_to_tokens("ééééééééééééééééééééééé", 6);
        assert!(out.ends_with(TRUNCATION_SUFFIX));
        assert!(token::estimate_tokens(&out) <= 6);
    }

    #[test]
    fn policy_from_config() {
        let mut cfg = ContextConfig::default();
        assert_eq!(TrimPolicy::from_config(&cfg), TrimPolicy::TokenBudget(cfg.history_tokens));
        cfg.trim = TrimStrategy::Messages;
        cfg.max_messages = 7;
        assert_eq!(TrimPolicy::from_config(&cfg), TrimPolicy::MessageCount(7));
    }
}
