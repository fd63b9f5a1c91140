use chrono::{DateTime, Utc};
use tally_types::events::ActionPayload;
use tally_types::models::{Session, Template};

use crate::error::StoreError;

/// Longest vote value accepted when the template does not list its cards.
pub const MAX_VOTE_LEN: usize = 32;

/// Card catalog seam. The catalog itself lives outside the core; the core
/// only asks whether a template or a vote value is acceptable.
pub trait TemplateValidator: Send + Sync {
    fn validate_template(&self, template: &Template) -> Result<(), String>;
    fn validate_vote(&self, template: &Template, value: &str) -> Result<(), String>;
}

/// Accepts any named template; votes must come from `custom_cards` when the
/// template lists them.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpaqueTemplates;

impl TemplateValidator for OpaqueTemplates {
    fn validate_template(&self, template: &Template) -> Result<(), String> {
        if template.kind.trim().is_empty() {
            return Err("template type must not be empty".into());
        }
        if let Some(cards) = &template.custom_cards {
            if cards.is_empty() {
                return Err("custom template needs at least one card".into());
            }
        }
        Ok(())
    }

    fn validate_vote(&self, template: &Template, value: &str) -> Result<(), String> {
        if value.is_empty() || value.len() > MAX_VOTE_LEN {
            return Err(format!("vote must be 1..={} characters", MAX_VOTE_LEN));
        }
        match &template.custom_cards {
            Some(cards) if !cards.iter().any(|c| c == value) => {
                Err(format!("'{}' is not a card in this template", value))
            }
            _ => Ok(()),
        }
    }
}

/// How an accepted action changed the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Visible state changed.
    Changed,
    /// Only presence moved.
    PresenceOnly,
    /// The acting user left.
    Left,
}

/// Check role and state rules for `payload` and apply it to `session`.
/// On error the session is left untouched.
pub fn apply_action(
    session: &mut Session,
    user_id: &str,
    payload: &ActionPayload,
    templates: &dyn TemplateValidator,
    now: DateTime<Utc>,
) -> Result<Applied, StoreError> {
    let user = session
        .user(user_id)
        .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))?;
    let role = user.role;

    let require_host = |action: &str| {
        if session.is_host(user_id) {
            Ok(())
        } else {
            Err(StoreError::PermissionDenied(format!("only the host may {}", action)))
        }
    };

    let applied = match payload {
        ActionPayload::Vote { value } => {
            if !role.can_vote() {
                return Err(StoreError::PermissionDenied("guests cannot vote".into()));
            }
            if session.revealed {
                return Err(StoreError::PermissionDenied(
                    "votes are locked once revealed".into(),
                ));
            }
            templates
                .validate_vote(&session.template, value)
                .map_err(StoreError::InvalidAction)?;
            session.record_vote(user_id, value.clone());
            Applied::Changed
        }
        ActionPayload::Reveal => {
            require_host("reveal votes")?;
            session.revealed = true;
            Applied::Changed
        }
        ActionPayload::Reset => {
            require_host("reset the round")?;
            session.clear_round();
            Applied::Changed
        }
        ActionPayload::TemplateUpdate { template } => {
            require_host("change the template")?;
            templates
                .validate_template(template)
                .map_err(StoreError::InvalidAction)?;
            session.template = template.clone();
            session.clear_round();
            Applied::Changed
        }
        ActionPayload::Heartbeat => Applied::PresenceOnly,
        ActionPayload::Leave => {
            session.remove_user(user_id);
            session.bump(now);
            return Ok(Applied::Left);
        }
    };

    session.mark_seen(user_id, now);
    session.bump(now);
    Ok(applied)
}
