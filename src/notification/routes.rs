//! Recipients, roles and mute windows

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::{PoisonError, RwLock};

use crate::config::RecipientsConfig;
use crate::event::SecurityEvent;
use crate::utils::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Viewer => "viewer",
        }
    }
}

/// A known chat identity issuing a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRoute {
    pub recipient: String,
    pub role: Role,
    pub mute_until: Option<DateTime<Utc>>,
}

impl NotificationRoute {
    fn is_muted(&self, now: DateTime<Utc>) -> bool {
        self.mute_until.is_some_and(|until| until > now)
    }
}

/// Route table shared by the command router (writer of mute state) and the dispatcher
///
/// Every mute change replaces the whole `Option` under the write lock, so readers
/// see either the old or the new deadline.
pub struct RouteTable {
    routes: RwLock<Vec<NotificationRoute>>,
}

impl RouteTable {
    pub fn new(admins: &[String], viewers: &[String]) -> Self {
        let route = |recipient: &String, role: Role| NotificationRoute {
            recipient: recipient.clone(),
            role,
            mute_until: None,
        };
        let routes = admins
            .iter()
            .map(|r| route(r, Role::Admin))
            .chain(viewers.iter().map(|r| route(r, Role::Viewer)))
            .collect();

        Self {
            routes: RwLock::new(routes),
        }
    }

    pub fn from_config(recipients: &RecipientsConfig) -> Self {
        Self::new(&recipients.admins, &recipients.viewers)
    }

    /// `None` for identities that are neither admin nor viewer
    pub fn caller(&self, id: &str) -> Option<Caller> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes.iter().find(|r| r.recipient == id).map(|r| Caller {
            id: r.recipient.clone(),
            role: r.role,
        })
    }

    /// Admins whose mute window is not active at `now`
    pub fn unmuted_admins(&self, now: DateTime<Utc>) -> Vec<String> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes
            .iter()
            .filter(|r| r.role == Role::Admin && !r.is_muted(now))
            .map(|r| r.recipient.clone())
            .collect()
    }

    /// Recipients that should get `event` at `now`
    ///
    /// Admin-only kinds never reach viewers. Critical events ignore mute windows.
    pub fn recipients_for(&self, event: &SecurityEvent, now: DateTime<Utc>) -> Vec<String> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes
            .iter()
            .filter(|r| r.role == Role::Admin || !event.kind.is_admin_only())
            .filter(|r| event.is_critical() || !r.is_muted(now))
            .map(|r| r.recipient.clone())
            .collect()
    }

    /// Mute `recipient` for `duration` from `now`, returning the new deadline
    pub fn mute(&self, recipient: &str, duration: Duration, now: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        let route = routes
            .iter_mut()
            .find(|r| r.recipient == recipient)
            .ok_or_else(|| AppError::not_found(format!("Unknown recipient: {}", recipient)))?;

        let until = now + duration;
        route.mute_until = Some(until);
        Ok(until)
    }

    /// Clear any mute window; returns whether one was active
    pub fn unmute(&self, recipient: &str, now: DateTime<Utc>) -> Result<bool, AppError> {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        let route = routes
            .iter_mut()
            .find(|r| r.recipient == recipient)
            .ok_or_else(|| AppError::not_found(format!("Unknown recipient: {}", recipient)))?;

        let was_muted = route.is_muted(now);
        route.mute_until = None;
        Ok(was_muted)
    }

    /// Active mute deadline of `recipient`
    pub fn muted_until(&self, recipient: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes
            .iter()
            .find(|r| r.recipient == recipient)
            .filter(|r| r.is_muted(now))
            .and_then(|r| r.mute_until)
    }
}
