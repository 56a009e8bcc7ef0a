use serde::{Deserialize, Serialize};

/// Authenticated identity handed in by the request layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

impl Caller {
    pub fn student(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::Student,
        }
    }

    pub fn teacher(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::Teacher,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn is_staff(&self) -> bool {
        matches!(self.role, Role::Teacher | Role::Admin)
    }
}
