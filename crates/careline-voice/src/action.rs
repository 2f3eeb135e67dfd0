//! Portal side effects a voice command can trigger.
//!
//! Resolvers never run actions; they return an [`ActionDescriptor`] and the
//! orchestrator dispatches it exactly once through an [`ActionExecutor`] when the
//! turn is still live.

use crate::context::CommandContext;
use crate::error::ActionExecutionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Portal views reachable by navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum View {
    Dashboard,
    Labs,
    Appointments,
    Messages,
    Medications,
    Billing,
    Patients,
    Schedule,
    Notes,
    Employees,
    Users,
    AuditLog,
    Settings,
}

impl View {
    pub fn as_str(&self) -> &'static str {
        match self {
            View::Dashboard => "dashboard",
            View::Labs => "labs",
            View::Appointments => "appointments",
            View::Messages => "messages",
            View::Medications => "medications",
            View::Billing => "billing",
            View::Patients => "patients",
            View::Schedule => "schedule",
            View::Notes => "notes",
            View::Employees => "employees",
            View::Users => "users",
            View::AuditLog => "audit_log",
            View::Settings => "settings",
        }
    }
}

/// A known portal action plus its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionDescriptor {
    /// Route the portal to a view.
    Navigate { view: View },
    /// Open clinical dictation for the current provider.
    StartDictation,
    /// Send an SMS / portal message through the messaging collaborator.
    SendMessage { to: String, body: String },
    /// Create a record (appointment request, note, refill request, ...).
    CreateRecord {
        record: String,
        #[serde(default)]
        fields: serde_json::Map<String, serde_json::Value>,
    },
    Logout,
    /// Escape hatch for interpreter actions the portal knows and this crate does not.
    Custom {
        name: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl ActionDescriptor {
    pub fn navigate(view: View) -> Self {
        ActionDescriptor::Navigate { view }
    }

    /// Short label for logs. Never includes message bodies or record fields.
    pub fn label(&self) -> String {
        match self {
            ActionDescriptor::Navigate { view } => format!("navigate:{}", view.as_str()),
            ActionDescriptor::StartDictation => "start_dictation".to_string(),
            ActionDescriptor::SendMessage { .. } => "send_message".to_string(),
            ActionDescriptor::CreateRecord { record, .. } => format!("create_record:{}", record),
            ActionDescriptor::Logout => "logout".to_string(),
            ActionDescriptor::Custom { name, .. } => format!("custom:{}", name),
        }
    }
}

impl fmt::Display for ActionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// What the executor reports back after a successful dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    /// Optional sentence to append to the spoken reply.
    pub detail: Option<String>,
    pub duration_ms: u64,
}

/// The `executeAction` capability: navigation, record mutation, notification.
#[async_trait::async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        action: &ActionDescriptor,
        ctx: &CommandContext,
    ) -> Result<ActionOutcome, ActionExecutionError>;
}

/// Executor that only logs. Useful for demos and as a default when the portal
/// wires navigation through the event stream instead.
#[derive(Debug, Default)]
pub struct LoggingActionExecutor;

#[async_trait::async_trait]
impl ActionExecutor for LoggingActionExecutor {
    async fn execute(
        &self,
        action: &ActionDescriptor,
        ctx: &CommandContext,
    ) -> Result<ActionOutcome, ActionExecutionError> {
        info!(action = %action, role = %ctx.role, user_id = %ctx.user_id, "➡️ Dispatching portal action");
        Ok(ActionOutcome {
            detail: None,
            duration_ms: 0,
        })
    }
}

/// Run `action` on its own task so a panic inside the executor surfaces as an
/// [`ActionExecutionError`] just like an `Err` return.
pub async fn dispatch_action(
    executor: Arc<dyn ActionExecutor>,
    action: ActionDescriptor,
    ctx: Arc<CommandContext>,
) -> Result<ActionOutcome, ActionExecutionError> {
    let started = Instant::now();
    let label = action.label();
    let handle = tokio::spawn(async move { executor.execute(&action, &ctx).await });

    match handle.await {
        Ok(Ok(mut outcome)) => {
            if outcome.duration_ms == 0 {
                outcome.duration_ms = started.elapsed().as_millis() as u64;
            }
            Ok(outcome)
        }
        Ok(Err(e)) => {
            warn!(action = %label, error = %e, "Action failed");
            Err(e)
        }
        Err(join_err) => {
            let reason = if join_err.is_panic() {
                panic_message(join_err.into_panic())
            } else {
                "action task cancelled".to_string()
            };
            warn!(action = %label, reason = %reason, "Action panicked");
            Err(ActionExecutionError::Panicked(reason))
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Role;

    struct Exploding;

    #[async_trait::async_trait]
    impl ActionExecutor for Exploding {
        async fn execute(
            &self,
            _action: &ActionDescriptor,
            _ctx: &CommandContext,
        ) -> Result<ActionOutcome, ActionExecutionError> {
            panic!("record store offline");
        }
    }

    struct Refusing;

    #[async_trait::async_trait]
    impl ActionExecutor for Refusing {
        async fn execute(
            &self,
            _action: &ActionDescriptor,
            _ctx: &CommandContext,
        ) -> Result<ActionOutcome, ActionExecutionError> {
            Err(ActionExecutionError::Rejected("no consent on file".into()))
        }
    }

    fn ctx() -> Arc<CommandContext> {
        Arc::new(CommandContext::new(Role::Patient, "p-1"))
    }

    #[tokio::test]
    async fn panic_and_error_are_both_action_errors() {
        let action = ActionDescriptor::navigate(View::Labs);
        let panicked = dispatch_action(Arc::new(Exploding), action.clone(), ctx()).await;
        assert_eq!(
            panicked,
            Err(ActionExecutionError::Panicked("record store offline".into()))
        );

        let refused = dispatch_action(Arc::new(Refusing), action, ctx()).await;
        assert!(matches!(refused, Err(ActionExecutionError::Rejected(_))));
    }

    #[tokio::test]
    async fn logging_executor_succeeds() {
        let out = dispatch_action(Arc::new(LoggingActionExecutor), ActionDescriptor::Logout, ctx()).await;
        tokio_test::assert_ok!(out);
    }

    #[test]
    fn descriptor_json_shape() {
        let a: ActionDescriptor =
            serde_json::from_str(r#"{"kind":"navigate","view":"audit_log"}"#).unwrap();
        assert_eq!(a, ActionDescriptor::navigate(View::AuditLog));
        let msg = ActionDescriptor::SendMessage {
            to: "+15550100".into(),
            body: "PHI".into(),
        };
        assert_eq!(msg.label(), "send_message");
    }
}
