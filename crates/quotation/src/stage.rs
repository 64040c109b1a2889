use serde::{Deserialize, Serialize};

/// Quotation request lifecycle, in fixed forward order.
///
/// - `New`: editable, not yet placed on a purchase order.
/// - `InProgress`: placed on a purchase order line, waiting for or holding a
///   supplier price.
/// - `Done`: sale value computed and written back; read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    New,
    InProgress,
    Done,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::New, Stage::InProgress, Stage::Done];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::New => "new",
            Stage::InProgress => "in_progress",
            Stage::Done => "done",
        }
    }

    /// The only stage this one may advance to, if any.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::New => Some(Stage::InProgress),
            Stage::InProgress => Some(Stage::Done),
            Stage::Done => None,
        }
    }

    pub fn can_advance_to(self, target: Stage) -> bool {
        self.next() == Some(target)
    }

    /// Open requests still count against the one-request-per-sales-line rule.
    pub fn is_open(self) -> bool {
        !matches!(self, Stage::Done)
    }
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    Urgent,
}
