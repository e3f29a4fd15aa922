//! Permission pairs and the transitions the capture protocol applies to them.
use std::fmt::{Display, Formatter};

/// Strength of an access, ordered `None < Read < Modify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Permission {
    None,
    Read,
    Modify,
}

impl Display for Permission {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Permission::None => "None",
            Permission::Read => "Read",
            Permission::Modify => "Modify",
        };
        f.write_str(text)
    }
}

/// The `(scheduling, immediate)` permission pair carried by every use.
///
/// The scheduling permission is the strongest access the holder may ever
/// request (it governs the ordering of anything it spawns), the immediate
/// permission is what the holder may do to the data right now. The immediate
/// permission never exceeds the scheduling one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Permissions {
    pub scheduling: Permission,
    pub immediate: Permission,
}

impl Permissions {
    pub const MODIFY_MODIFY: Self = Self::pair(Permission::Modify, Permission::Modify);
    pub const MODIFY_READ: Self = Self::pair(Permission::Modify, Permission::Read);
    pub const MODIFY_NONE: Self = Self::pair(Permission::Modify, Permission::None);
    pub const READ_READ: Self = Self::pair(Permission::Read, Permission::Read);
    pub const READ_NONE: Self = Self::pair(Permission::Read, Permission::None);

    const fn pair(scheduling: Permission, immediate: Permission) -> Self {
        Self {
            scheduling,
            immediate,
        }
    }

    /// Builds a pair, returning `None` when the immediate permission would
    /// exceed the scheduling one.
    pub fn new(scheduling: Permission, immediate: Permission) -> Option<Self> {
        (immediate <= scheduling).then_some(Self::pair(scheduling, immediate))
    }

    pub fn can_read(self) -> bool {
        self.immediate >= Permission::Read
    }

    pub fn can_modify(self) -> bool {
        self.immediate == Permission::Modify
    }

    /// Validates that `intent` may be captured from a use holding `self`, and
    /// returns the permissions the continuing use holds afterwards.
    pub fn capture(self, intent: AccessIntent) -> Result<Permissions, Refusal> {
        let requested = intent.permissions().scheduling;

        if self.scheduling == Permission::None {
            return Err(Refusal::NoScheduling);
        }

        if requested > self.scheduling {
            return Err(Refusal::Escalation);
        }

        Ok(self.after(intent))
    }

    /// The continuation of `self` once `intent` has been captured from it.
    ///
    /// A modify capture moves the live version into the child, so nothing is
    /// immediately accessible until it completes. A read capture shares the
    /// version, so the continuation can at most read it.
    pub(crate) fn after(self, intent: AccessIntent) -> Permissions {
        if intent.modifies() {
            Self::pair(self.scheduling, Permission::None)
        } else {
            Self::pair(self.scheduling, self.immediate.min(Permission::Read))
        }
    }
}

impl Display for Permissions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.scheduling, self.immediate)
    }
}

/// Why a capture was refused, before it is attached to a handle key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// The source use holds no scheduling permission at all.
    NoScheduling,
    /// The request is stronger than the source's scheduling permission.
    Escalation,
}

/// The access a new task declares for one handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessIntent {
    /// Read the data once the producing version is available.
    Read,
    /// Modify the data once every prior reader has released it.
    Modify,
    /// Schedule reads in nested tasks without touching the data.
    ScheduleRead,
    /// Schedule modifications in nested tasks without touching the data.
    ScheduleModify,
}

impl AccessIntent {
    /// The permission pair the captured use is created with.
    pub fn permissions(self) -> Permissions {
        match self {
            AccessIntent::Read => Permissions::READ_READ,
            AccessIntent::Modify => Permissions::MODIFY_MODIFY,
            AccessIntent::ScheduleRead => Permissions::READ_NONE,
            AccessIntent::ScheduleModify => Permissions::MODIFY_NONE,
        }
    }

    /// Whether capturing this intent produces a new version.
    pub fn modifies(self) -> bool {
        self.permissions().scheduling == Permission::Modify
    }
}

impl Display for AccessIntent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            AccessIntent::Read => "read",
            AccessIntent::Modify => "modify",
            AccessIntent::ScheduleRead => "schedule-read",
            AccessIntent::ScheduleModify => "schedule-modify",
        };
        f.write_str(text)
    }
}
