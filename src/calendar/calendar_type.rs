use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calendar {
    pub id: String,
    pub name: String,
    pub color: Option<String>,
    pub is_primary: bool,
    pub access_role: AccessRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AccessRole {
    Owner,
    Writer,
    Reader,
}

impl Calendar {
    pub fn is_writable(&self) -> bool {
        matches!(self.access_role, AccessRole::Owner | AccessRole::Writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_calendar(role: AccessRole) -> Calendar {
        Calendar {
            id: "cal1".to_string(),
            name: "Team Calendar".to_string(),
            color: Some("#1a73e8".to_string()),
            is_primary: false,
            access_role: role,
        }
    }

    #[test]
    fn owner_calendar_is_writable() {
        assert!(create_calendar(AccessRole::Owner).is_writable());
    }

    #[test]
    fn writer_calendar_is_writable() {
        assert!(create_calendar(AccessRole::Writer).is_writable());
    }

    #[test]
    fn reader_calendar_is_not_writable() {
        assert!(!create_calendar(AccessRole::Reader).is_writable());
    }
}
