//! The identity of whoever requests an operation
use std::fmt;

/// Identity collaborators supply this; it is trusted as given.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    #[n(0)]
    Donor,
    #[n(1)]
    Ngo,
    #[n(2)]
    Volunteer,
    #[n(3)]
    Admin,
    /// Dispatcher and sweep jobs acting on behalf of the platform.
    #[n(4)]
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Donor => "donor",
            Role::Ngo => "ngo",
            Role::Volunteer => "volunteer",
            Role::Admin => "admin",
            Role::System => "system",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub const SYSTEM_ID: &'static str = "system";

    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
    pub fn donor(id: impl Into<String>) -> Self {
        Self::new(id, Role::Donor)
    }
    pub fn ngo(id: impl Into<String>) -> Self {
        Self::new(id, Role::Ngo)
    }
    pub fn volunteer(id: impl Into<String>) -> Self {
        Self::new(id, Role::Volunteer)
    }
    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(id, Role::Admin)
    }
    pub fn system() -> Self {
        Self::new(Self::SYSTEM_ID, Role::System)
    }
    pub fn is(&self, role: Role) -> bool {
        self.role == role
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.role, self.id)
    }
}
