//! **CommandResolver** — shortcut table first, intent interpreter second.
//!
//! Shortcuts are checked in the order they were added to the table; the first match
//! wins and the interpreter is never called. Everything the interpreter does wrong
//! (timeout, bad JSON, HTTP error) is folded into a fixed apology reply.

use crate::action::{ActionDescriptor, View};
use crate::capture::Utterance;
use crate::context::{CommandContext, Role};
use crate::error::{InterpreterError, VoiceResult};
use crate::interpreter::IntentInterpreter;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Intent reported for the apology reply.
pub const FALLBACK_INTENT: &str = "fallback";

/// Where a resolved command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    Shortcut,
    Interpreter,
}

/// Outcome of one resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedCommand {
    pub source: CommandSource,
    /// Shortcut name or interpreter intent.
    pub intent: String,
    pub reply: String,
    pub action: Option<ActionDescriptor>,
    pub confidence: Option<f32>,
}

impl ResolvedCommand {
    /// True for the interpreter-failure apology.
    pub fn is_fallback(&self) -> bool {
        self.source == CommandSource::Interpreter && self.intent == FALLBACK_INTENT
    }
}

#[derive(Debug, Clone)]
enum ShortcutMatcher {
    /// Lowercased phrase, matched by containment.
    Phrase(String),
    Pattern(Regex),
}

impl ShortcutMatcher {
    fn matches(&self, lowered: &str) -> bool {
        match self {
            ShortcutMatcher::Phrase(p) => lowered.contains(p.as_str()),
            ShortcutMatcher::Pattern(re) => re.is_match(lowered),
        }
    }
}

/// One deterministic command.
#[derive(Debug, Clone)]
pub struct Shortcut {
    pub name: String,
    /// Empty means every role.
    roles: Vec<Role>,
    matcher: ShortcutMatcher,
    pub reply: String,
    pub action: Option<ActionDescriptor>,
}

impl Shortcut {
    pub fn applies_to(&self, role: Role) -> bool {
        self.roles.is_empty() || self.roles.contains(&role)
    }
}

/// Ordered shortcut table. Priority is insertion order and never changes after `build()`.
#[derive(Debug, Clone, Default)]
pub struct ShortcutTable {
    shortcuts: Vec<Shortcut>,
}

impl ShortcutTable {
    pub fn builder() -> ShortcutTableBuilder {
        ShortcutTableBuilder::default()
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.shortcuts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shortcuts.is_empty()
    }

    /// Highest-priority shortcut for `role` matching `text` (case-insensitive).
    pub fn find(&self, role: Role, text: &str) -> Option<&Shortcut> {
        let lowered = normalize(text);
        self.shortcuts
            .iter()
            .filter(|s| s.applies_to(role))
            .find(|s| s.matcher.matches(&lowered))
    }

    /// Built-in catalogue for the portal's four roles.
    pub fn portal_defaults() -> Self {
        use ActionDescriptor::*;
        let nav = ActionDescriptor::navigate;
        let all: &[Role] = &[];

        let built = Self::builder()
            // Patient
            .phrase("patient_labs", &[Role::Patient], "show me labs", "Here are your lab results.", Some(nav(View::Labs)))
            .pattern("patient_labs_any", &[Role::Patient], r"\b(lab|labs|test results?)\b", "Here are your lab results.", Some(nav(View::Labs)))
            .pattern("patient_appointments", &[Role::Patient], r"\b(appointments?|visits?)\b", "Opening your appointments.", Some(nav(View::Appointments)))
            .pattern("patient_medications", &[Role::Patient], r"\b(medications?|prescriptions?|refills?)\b", "Here are your medications.", Some(nav(View::Medications)))
            .pattern("patient_billing", &[Role::Patient, Role::Owner], r"\b(bills?|billing|invoices?|payments?)\b", "Opening billing.", Some(nav(View::Billing)))
            // Provider
            .pattern("provider_dictation", &[Role::Provider], r"\b(start|begin) (dictation|dictating)\b", "Dictation started.", Some(StartDictation))
            .pattern("provider_patients", &[Role::Provider], r"\b(patient list|my patients|show patients)\b", "Here is your patient list.", Some(nav(View::Patients)))
            .pattern("provider_notes", &[Role::Provider], r"\b(clinical notes|my notes|open notes)\b", "Opening your notes.", Some(nav(View::Notes)))
            // Owner / employer
            .pattern("owner_employees", &[Role::Owner], r"\b(employees?|staff|team members?)\b", "Here are your employees.", Some(nav(View::Employees)))
            // Admin
            .pattern("admin_audit", &[Role::Admin], r"\baudit( log| trail)?\b", "Opening the audit log.", Some(nav(View::AuditLog)))
            .pattern("admin_users", &[Role::Admin], r"\b(users|accounts|manage users)\b", "Opening user management.", Some(nav(View::Users)))
            // Everyone
            .pattern("messages", all, r"\b(messages?|inbox)\b", "Opening your messages.", Some(nav(View::Messages)))
            .pattern("dashboard", all, r"\b(go home|dashboard|home page)\b", "Taking you to the dashboard.", Some(nav(View::Dashboard)))
            .pattern("settings", all, r"\b(settings|preferences)\b", "Opening settings.", Some(nav(View::Settings)))
            .pattern("logout", all, r"\b(log ?out|sign ?out)\b", "Signing you out.", Some(Logout))
            .build();

        match built {
            Ok(table) => table,
            Err(e) => {
                // Patterns above are static; reaching this is a programming error.
                warn!("Default shortcut table failed to compile: {}", e);
                Self::empty()
            }
        }
    }
}

/// Builder for [`ShortcutTable`]; collects the first pattern error instead of panicking.
#[derive(Debug, Default)]
pub struct ShortcutTableBuilder {
    shortcuts: Vec<Shortcut>,
    error: Option<regex::Error>,
}

impl ShortcutTableBuilder {
    /// Case-insensitive containment match.
    pub fn phrase(
        mut self,
        name: &str,
        roles: &[Role],
        phrase: &str,
        reply: &str,
        action: Option<ActionDescriptor>,
    ) -> Self {
        self.shortcuts.push(Shortcut {
            name: name.to_string(),
            roles: roles.to_vec(),
            matcher: ShortcutMatcher::Phrase(normalize(phrase)),
            reply: reply.to_string(),
            action,
        });
        self
    }

    /// Case-insensitive regex match.
    pub fn pattern(
        mut self,
        name: &str,
        roles: &[Role],
        pattern: &str,
        reply: &str,
        action: Option<ActionDescriptor>,
    ) -> Self {
        match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(re) => self.shortcuts.push(Shortcut {
                name: name.to_string(),
                roles: roles.to_vec(),
                matcher: ShortcutMatcher::Pattern(re),
                reply: reply.to_string(),
                action,
            }),
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    pub fn build(self) -> VoiceResult<ShortcutTable> {
        if let Some(e) = self.error {
            return Err(e.into());
        }
        Ok(ShortcutTable {
            shortcuts: self.shortcuts,
        })
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Two-stage resolver.
pub struct CommandResolver {
    shortcuts: ShortcutTable,
    interpreter: Arc<dyn IntentInterpreter>,
    timeout: Duration,
    apology: String,
}

impl CommandResolver {
    pub fn new(
        shortcuts: ShortcutTable,
        interpreter: Arc<dyn IntentInterpreter>,
        timeout: Duration,
        apology: impl Into<String>,
    ) -> Self {
        Self {
            shortcuts,
            interpreter,
            timeout,
            apology: apology.into(),
        }
    }

    pub fn shortcuts(&self) -> &ShortcutTable {
        &self.shortcuts
    }

    /// Resolve one utterance. Never fails: interpreter errors become the apology.
    pub async fn resolve(&self, utterance: &Utterance, ctx: &CommandContext) -> ResolvedCommand {
        if let Some(shortcut) = self.shortcuts.find(ctx.role, &utterance.text) {
            info!(shortcut = %shortcut.name, role = %ctx.role, "⚡ Shortcut matched");
            return ResolvedCommand {
                source: CommandSource::Shortcut,
                intent: shortcut.name.clone(),
                reply: shortcut.reply.clone(),
                action: shortcut.action.clone(),
                confidence: None,
            };
        }

        debug!(role = %ctx.role, "No shortcut matched; asking interpreter");
        let result = match tokio::time::timeout(
            self.timeout,
            self.interpreter.interpret(&utterance.text, ctx),
        )
        .await
        {
            Ok(inner) => inner,
            Err(_) => Err(InterpreterError::Timeout(self.timeout)),
        };

        match result {
            Ok(interp) => ResolvedCommand {
                source: CommandSource::Interpreter,
                intent: interp.intent,
                reply: interp.reply,
                action: interp.action,
                confidence: interp.confidence,
            },
            Err(e) => {
                warn!(error = %e, "Interpreter failed; answering with apology");
                self.apology()
            }
        }
    }

    fn apology(&self) -> ResolvedCommand {
        ResolvedCommand {
            source: CommandSource::Interpreter,
            intent: FALLBACK_INTENT.to_string(),
            reply: self.apology.clone(),
            action: None,
            confidence: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::Interpretation;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingInterpreter {
        calls: AtomicUsize,
        delay: Duration,
        answer: Result<Interpretation, InterpreterError>,
    }

    impl CountingInterpreter {
        fn answering(reply: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                answer: Ok(Interpretation {
                    intent: "schedule_query".to_string(),
                    reply: reply.to_string(),
                    action: None,
                    confidence: Some(0.8),
                }),
            }
        }
    }

    #[async_trait::async_trait]
    impl IntentInterpreter for CountingInterpreter {
        async fn interpret(
            &self,
            _text: &str,
            _ctx: &CommandContext,
        ) -> Result<Interpretation, InterpreterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.answer.clone()
        }
    }

    fn resolver(interp: Arc<CountingInterpreter>) -> CommandResolver {
        CommandResolver::new(
            ShortcutTable::portal_defaults(),
            interp,
            Duration::from_secs(8),
            "Sorry.",
        )
    }

    #[tokio::test]
    async fn patient_show_me_labs_is_a_shortcut() {
        let interp = Arc::new(CountingInterpreter::answering("unused"));
        let r = resolver(Arc::clone(&interp));
        let ctx = CommandContext::new(Role::Patient, "p-1");

        let out = r.resolve(&Utterance::final_text("Show me LABS"), &ctx).await;
        assert_eq!(out.source, CommandSource::Shortcut);
        assert_eq!(out.action, Some(ActionDescriptor::navigate(View::Labs)));
        assert_eq!(interp.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn provider_schedule_question_goes_to_interpreter() {
        let interp = Arc::new(CountingInterpreter::answering("You have 4 appointments tomorrow."));
        let r = resolver(Arc::clone(&interp));
        let ctx = CommandContext::new(Role::Provider, "dr-1");

        let out = r
            .resolve(&Utterance::final_text("what's my schedule tomorrow"), &ctx)
            .await;
        assert_eq!(out.source, CommandSource::Interpreter);
        assert_eq!(out.intent, "schedule_query");
        assert_eq!(out.reply, "You have 4 appointments tomorrow.");
        assert_eq!(interp.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn highest_priority_wins_deterministically() {
        let table = ShortcutTable::builder()
            .phrase("first", &[], "labs", "first", None)
            .pattern("second", &[], r"labs|billing", "second", None)
            .phrase("third", &[], "billing", "third", None)
            .build()
            .unwrap();
        for _ in 0..50 {
            let hit = table.find(Role::Patient, "open labs and billing").unwrap();
            assert_eq!(hit.name, "first");
        }
        assert_eq!(table.find(Role::Admin, "billing please").unwrap().name, "second");
    }

    #[test]
    fn shortcuts_are_role_scoped() {
        let table = ShortcutTable::portal_defaults();
        assert_eq!(
            table.find(Role::Admin, "open the audit log").map(|s| s.name.as_str()),
            Some("admin_audit")
        );
        assert!(table.find(Role::Patient, "open the audit log").is_none());
        assert!(table.find(Role::Provider, "what's my schedule tomorrow").is_none());
    }

    #[test]
    fn bad_pattern_fails_build() {
        let err = ShortcutTable::builder()
            .pattern("broken", &[], r"(unclosed", "x", None)
            .build();
        assert!(err.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_interpreter_times_out_into_apology() {
        let interp = Arc::new(CountingInterpreter {
            delay: Duration::from_secs(30),
            ..CountingInterpreter::answering("too late")
        });
        let r = resolver(interp);
        let ctx = CommandContext::new(Role::Provider, "dr-1");
        let out = r.resolve(&Utterance::final_text("summarize my week"), &ctx).await;
        assert!(out.is_fallback());
        assert_eq!(out.reply, "Sorry.");
        assert!(out.action.is_none());
    }

    #[tokio::test]
    async fn interpreter_error_becomes_apology() {
        let interp = Arc::new(CountingInterpreter {
            answer: Err(InterpreterError::Status {
                status: 502,
                body: "bad gateway".into(),
            }),
            ..CountingInterpreter::answering("unused")
        });
        let r = resolver(interp);
        let ctx = CommandContext::new(Role::Owner, "o-1");
        let out = r.resolve(&Utterance::final_text("how many claims are pending"), &ctx).await;
        assert!(out.is_fallback());
    }
}
