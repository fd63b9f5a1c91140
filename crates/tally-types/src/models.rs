use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type SessionId = String;
pub type UserId = String;

/// Default card deck used when a session is created without a template.
pub const DEFAULT_TEMPLATE: &str = "fibonacci";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Host,
    Attendance,
    Guest,
}

impl Role {
    /// Hosts and attendance users vote; guests only watch.
    pub fn can_vote(self) -> bool {
        !matches!(self, Role::Guest)
    }
}

/// Card deck selection. Opaque to the core: persisted and broadcast as-is,
/// validity is decided by the template collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_cards: Option<Vec<String>>,
}

impl Default for Template {
    fn default() -> Self {
        Self {
            kind: DEFAULT_TEMPLATE.to_string(),
            custom_cards: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub vote: Option<String>,
    #[serde(default)]
    pub has_voted: bool,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl User {
    pub fn new(id: impl Into<UserId>, name: impl Into<String>, role: Role, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
            vote: None,
            has_voted: false,
            joined_at: now,
            last_seen: now,
        }
    }
}

/// Canonical state of one voting round. Only the session store mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    /// Join order.
    pub users: Vec<User>,
    pub votes: BTreeMap<UserId, String>,
    pub revealed: bool,
    pub host_id: Option<UserId>,
    pub template: Template,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<SessionId>, creator: User, template: Template, now: DateTime<Utc>) -> Self {
        let host_id = (creator.role == Role::Host).then(|| creator.id.clone());
        Self {
            id: id.into(),
            users: vec![creator],
            votes: BTreeMap::new(),
            revealed: false,
            host_id,
            template,
            created_at: now,
            last_updated: now,
        }
    }

    pub fn user(&self, user_id: &str) -> Option<&User> {
        self.users.iter().find(|u| u.id == user_id)
    }

    pub fn user_mut(&mut self, user_id: &str) -> Option<&mut User> {
        self.users.iter_mut().find(|u| u.id == user_id)
    }

    pub fn is_host(&self, user_id: &str) -> bool {
        self.host_id.as_deref() == Some(user_id)
    }

    /// Advance `last_updated`, never moving it backwards.
    pub fn bump(&mut self, now: DateTime<Utc>) {
        if now > self.last_updated {
            self.last_updated = now;
        }
    }

    /// Refresh a user's presence timestamp. Returns false if the user is absent.
    pub fn mark_seen(&mut self, user_id: &str, now: DateTime<Utc>) -> bool {
        match self.user_mut(user_id) {
            Some(user) => {
                if now > user.last_seen {
                    user.last_seen = now;
                }
                true
            }
            None => false,
        }
    }

    /// Append a user. A hostless session hands the host seat to the first
    /// joiner allowed to vote. An id already on the roster is left alone and
    /// the call returns false.
    pub fn add_user(&mut self, mut user: User) -> bool {
        if self.user(&user.id).is_some() {
            return false;
        }
        if self.host_id.is_none() && user.role.can_vote() {
            user.role = Role::Host;
            self.host_id = Some(user.id.clone());
        } else if user.role == Role::Host {
            user.role = Role::Attendance;
        }
        self.users.push(user);
        true
    }

    pub fn record_vote(&mut self, user_id: &str, value: String) {
        if let Some(user) = self.user_mut(user_id) {
            user.vote = Some(value.clone());
            user.has_voted = true;
            self.votes.insert(user_id.to_string(), value);
        }
    }

    /// Drop every vote and hide the table again.
    pub fn clear_round(&mut self) {
        self.votes.clear();
        self.revealed = false;
        for user in &mut self.users {
            user.vote = None;
            user.has_voted = false;
        }
    }

    /// Remove a user and their vote. Reassigns the host seat if they held it.
    pub fn remove_user(&mut self, user_id: &str) -> Option<User> {
        let idx = self.users.iter().position(|u| u.id == user_id)?;
        let user = self.users.remove(idx);
        self.votes.remove(user_id);
        if self.is_host(user_id) {
            self.reassign_host();
        }
        Some(user)
    }

    /// Promote the oldest remaining host/attendance user, or clear the seat.
    pub fn reassign_host(&mut self) {
        self.host_id = None;
        if let Some(next) = self.users.iter_mut().find(|u| u.role.can_vote()) {
            next.role = Role::Host;
            self.host_id = Some(next.id.clone());
        }
    }

    /// Move the host seat to `user_id`, demoting the current host to
    /// attendance. False if `user_id` is absent or may not vote.
    pub fn transfer_host(&mut self, user_id: &str) -> bool {
        if !self.user(user_id).is_some_and(|u| u.role.can_vote()) {
            return false;
        }
        if let Some(previous) = self.host_id.take() {
            if let Some(user) = self.user_mut(&previous) {
                user.role = Role::Attendance;
            }
        }
        if let Some(user) = self.user_mut(user_id) {
            user.role = Role::Host;
        }
        self.host_id = Some(user_id.to_string());
        true
    }

    /// Render what `viewer` may see. Before reveal only the viewer's own vote is visible.
    pub fn view_for(&self, viewer: Option<&str>) -> SessionView {
        let visible = |user_id: &str| self.revealed || viewer == Some(user_id);

        let users = self
            .users
            .iter()
            .map(|u| UserView {
                id: u.id.clone(),
                name: u.name.clone(),
                role: u.role,
                has_voted: u.has_voted,
                vote: if visible(&u.id) { u.vote.clone() } else { None },
                last_seen: u.last_seen,
            })
            .collect();

        let votes = self
            .votes
            .iter()
            .filter(|(user_id, _)| visible(user_id))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        SessionView {
            id: self.id.clone(),
            users,
            votes,
            revealed: self.revealed,
            host_id: self.host_id.clone(),
            template: self.template.clone(),
            last_updated: self.last_updated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: UserId,
    pub name: String,
    pub role: Role,
    pub has_voted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote: Option<String>,
    pub last_seen: DateTime<Utc>,
}

/// Per-viewer snapshot pushed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: SessionId,
    pub users: Vec<UserView>,
    pub votes: BTreeMap<UserId, String>,
    pub revealed: bool,
    pub host_id: Option<UserId>,
    pub template: Template,
    pub last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with(users: &[(&str, Role)]) -> Session {
        let now = Utc::now();
        let mut iter = users.iter();
        let (id, role) = iter.next().unwrap();
        let mut session = Session::new("s1", User::new(*id, *id, *role, now), Template::default(), now);
        for (id, role) in iter {
            session.add_user(User::new(*id, *id, *role, now));
        }
        session
    }

    #[test]
    fn creator_host_takes_the_seat() {
        let session = session_with(&[("h", Role::Host), ("a", Role::Attendance)]);
        assert_eq!(session.host_id.as_deref(), Some("h"));
        assert_eq!(session.user("a").unwrap().role, Role::Attendance);
    }

    #[test]
    fn duplicate_id_is_not_added_twice() {
        let mut session = session_with(&[("h", Role::Host), ("a", Role::Attendance)]);
        let now = session.last_updated;
        assert!(!session.add_user(User::new("a", "Again", Role::Attendance, now)));
        assert_eq!(session.users.len(), 2);
        assert_eq!(session.user("a").unwrap().name, "a");
    }

    #[test]
    fn second_host_is_downgraded() {
        let session = session_with(&[("h", Role::Host), ("h2", Role::Host)]);
        assert_eq!(session.host_id.as_deref(), Some("h"));
        assert_eq!(session.user("h2").unwrap().role, Role::Attendance);
    }

    #[test]
    fn host_departure_promotes_oldest_voter() {
        let mut session = session_with(&[
            ("h", Role::Host),
            ("g", Role::Guest),
            ("a1", Role::Attendance),
            ("a2", Role::Attendance),
        ]);
        session.record_vote("h", "3".into());
        session.remove_user("h");

        assert_eq!(session.host_id.as_deref(), Some("a1"));
        assert_eq!(session.user("a1").unwrap().role, Role::Host);
        assert!(!session.votes.contains_key("h"));
    }

    #[test]
    fn host_departure_with_only_guests_clears_seat() {
        let mut session = session_with(&[("h", Role::Host), ("g", Role::Guest)]);
        session.remove_user("h");
        assert_eq!(session.host_id, None);
        assert_eq!(session.user("g").unwrap().role, Role::Guest);
    }

    #[test]
    fn hidden_votes_are_masked_per_viewer() {
        let mut session = session_with(&[("h", Role::Host), ("a", Role::Attendance), ("g", Role::Guest)]);
        session.record_vote("a", "5".into());
        session.record_vote("h", "8".into());

        let own = session.view_for(Some("a"));
        assert_eq!(own.votes.len(), 1);
        assert_eq!(own.votes.get("a").map(String::as_str), Some("5"));
        let h = own.users.iter().find(|u| u.id == "h").unwrap();
        assert!(h.has_voted);
        assert_eq!(h.vote, None);

        session.revealed = true;
        let guest = session.view_for(Some("g"));
        assert_eq!(guest.votes.get("a").map(String::as_str), Some("5"));
        assert_eq!(guest.votes.get("h").map(String::as_str), Some("8"));
    }

    #[test]
    fn bump_never_goes_backwards() {
        let mut session = session_with(&[("h", Role::Host)]);
        let later = session.last_updated + chrono::Duration::seconds(5);
        session.bump(later);
        session.bump(later - chrono::Duration::seconds(60));
        assert_eq!(session.last_updated, later);
    }

    #[test]
    fn clear_round_resets_flags() {
        let mut session = session_with(&[("h", Role::Host), ("a", Role::Attendance)]);
        session.record_vote("a", "5".into());
        session.revealed = true;
        session.clear_round();
        assert!(session.votes.is_empty());
        assert!(!session.revealed);
        assert!(!session.user("a").unwrap().has_voted);
    }
}
