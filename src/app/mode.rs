use std::fmt;

use crate::models::{Identity, Namespace, SharedCanvas, SharedRole};

/// Which canvas the app is working on and where it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Device-local canvas for signed-out or anonymous users.
    Local,
    Private { user_id: String },
    Shared { canvas_id: String, role: SharedRole },
}

impl Mode {
    pub fn namespace(&self) -> Namespace {
        match self {
            Mode::Local => Namespace::Local,
            Mode::Private { user_id } => Namespace::User(user_id.clone()),
            Mode::Shared { canvas_id, .. } => Namespace::Canvas(canvas_id.clone()),
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self, Mode::Local)
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Mode::Shared { role, .. } if !role.can_edit())
    }

    pub fn label(&self) -> &'static str {
        match self {
            Mode::Local => "local",
            Mode::Private { .. } => "private",
            Mode::Shared { .. } => "shared",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.namespace())
    }
}

/// Derives the mode from who is signed in and which shared canvas, if any, is
/// open. Anonymous identities always get the local canvas.
pub fn select_mode(identity: Option<&Identity>, shared: Option<&SharedCanvas>) -> Mode {
    let Some(identity) = identity.filter(|identity| !identity.anonymous) else {
        return Mode::Local;
    };
    match shared {
        Some(canvas) => Mode::Shared {
            canvas_id: canvas.canvas_id.clone(),
            role: canvas.role,
        },
        None => Mode::Private {
            user_id: identity.user_id.clone(),
        },
    }
}
