use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Dean,
    Teacher,
    Viewer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Dean => "dean",
            Role::Teacher => "teacher",
            Role::Viewer => "viewer",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "dean" => Some(Role::Dean),
            "teacher" => Some(Role::Teacher),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }

    pub fn can_manage_staff(self) -> bool {
        matches!(self, Role::Admin)
    }

    pub fn can_edit_fees(self) -> bool {
        matches!(self, Role::Admin | Role::Dean)
    }

    pub fn can_mark_attendance(self) -> bool {
        matches!(self, Role::Admin | Role::Dean | Role::Teacher)
    }
}

/// The logged-in staff identity, carried on AppState and threaded into
/// handlers explicitly. Cleared on logout or workspace switch.
#[derive(Debug, Clone)]
pub struct StaffSession {
    pub staff_id: String,
    pub name: String,
    pub role: Role,
    pub department_id: Option<String>,
}

/// Salted SHA-256 hex digest of a staff password. The staff id doubles as
/// the per-account salt, so equal passwords never share a digest.
pub fn password_digest(staff_id: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(staff_id.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_salted_by_staff_id() {
        let a = password_digest("staff-a", "secret");
        let b = password_digest("staff-b", "secret");
        assert_ne!(a, b);
        assert_eq!(a, password_digest("staff-a", "secret"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn role_permissions() {
        assert!(Role::Admin.can_manage_staff());
        assert!(!Role::Dean.can_manage_staff());
        assert!(Role::Dean.can_edit_fees());
        assert!(!Role::Teacher.can_edit_fees());
        assert!(Role::Teacher.can_mark_attendance());
        assert!(!Role::Viewer.can_mark_attendance());
    }

    #[test]
    fn role_parse_round_trips() {
        for r in [Role::Admin, Role::Dean, Role::Teacher, Role::Viewer] {
            assert_eq!(Role::parse(r.as_str()), Some(r));
        }
        assert_eq!(Role::parse("principal"), None);
    }
}
