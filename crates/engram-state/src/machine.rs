use serde::{Deserialize, Serialize};

/// Per-record processing state. Records advance strictly along
/// [`MemoryState::can_transition`]; everything else is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryState {
    Pending,
    Processed,
    ConsciousProcessing,
    ConsciousProcessed,
    ConsolidationProcessing,
    Consolidated,
    CleanupPending,
    CleanupProcessing,
    Cleaned,
    Failed,
}

impl MemoryState {
    /// The legal-transition table. `Cleaned` is terminal; `Failed` can only
    /// move on to cleanup.
    pub fn can_transition(self, to: MemoryState) -> bool {
        use MemoryState::*;
        matches!(
            (self, to),
            (Pending, Processed)
                | (Pending, Failed)
                | (Processed, ConsciousProcessing)
                | (Processed, ConsolidationProcessing)
                | (Processed, Failed)
                | (ConsciousProcessing, ConsciousProcessed)
                | (ConsciousProcessing, Failed)
                | (ConsciousProcessed, ConsolidationProcessing)
                | (ConsciousProcessed, CleanupPending)
                | (ConsciousProcessed, Failed)
                | (ConsolidationProcessing, Consolidated)
                | (ConsolidationProcessing, Failed)
                | (Consolidated, CleanupPending)
                | (Failed, CleanupPending)
                | (CleanupPending, CleanupProcessing)
                | (CleanupProcessing, Cleaned)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == MemoryState::Cleaned
    }
}

impl std::fmt::Display for MemoryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::ConsciousProcessing => "conscious_processing",
            Self::ConsciousProcessed => "conscious_processed",
            Self::ConsolidationProcessing => "consolidation_processing",
            Self::Consolidated => "consolidated",
            Self::CleanupPending => "cleanup_pending",
            Self::CleanupProcessing => "cleanup_processing",
            Self::Cleaned => "cleaned",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MemoryState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processed" => Ok(Self::Processed),
            "conscious_processing" => Ok(Self::ConsciousProcessing),
            "conscious_processed" => Ok(Self::ConsciousProcessed),
            "consolidation_processing" => Ok(Self::ConsolidationProcessing),
            "consolidated" => Ok(Self::Consolidated),
            "cleanup_pending" => Ok(Self::CleanupPending),
            "cleanup_processing" => Ok(Self::CleanupProcessing),
            "cleaned" => Ok(Self::Cleaned),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown memory state: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryState::*;
    use super::*;
    use std::str::FromStr;

    const ALL: [MemoryState; 10] = [
        Pending,
        Processed,
        ConsciousProcessing,
        ConsciousProcessed,
        ConsolidationProcessing,
        Consolidated,
        CleanupPending,
        CleanupProcessing,
        Cleaned,
        Failed,
    ];

    #[test]
    fn happy_paths_are_legal() {
        assert!(Pending.can_transition(Processed));
        assert!(Processed.can_transition(ConsciousProcessing));
        assert!(ConsciousProcessing.can_transition(ConsciousProcessed));
        assert!(ConsciousProcessed.can_transition(ConsolidationProcessing));
        assert!(ConsolidationProcessing.can_transition(Consolidated));
        assert!(Consolidated.can_transition(CleanupPending));
        assert!(CleanupPending.can_transition(CleanupProcessing));
        assert!(CleanupProcessing.can_transition(Cleaned));
    }

    #[test]
    fn cleaned_is_terminal() {
        for to in ALL {
            assert!(!Cleaned.can_transition(to), "cleaned -> {to} must be illegal");
        }
    }

    #[test]
    fn failed_can_only_enter_cleanup() {
        for to in ALL {
            let expected = to == CleanupPending;
            assert_eq!(Failed.can_transition(to), expected, "failed -> {to}");
        }
    }

    #[test]
    fn no_skipping_from_pending() {
        assert!(!Pending.can_transition(Cleaned));
        assert!(!Pending.can_transition(ConsciousProcessing));
        assert!(!Pending.can_transition(Consolidated));
    }

    #[test]
    fn no_self_transitions() {
        for state in ALL {
            assert!(!state.can_transition(state), "{state} -> {state} must be illegal");
        }
    }

    #[test]
    fn display_round_trips() {
        for state in ALL {
            let parsed = MemoryState::from_str(&state.to_string()).unwrap();
            assert_eq!(parsed, state);
        }
    }
}
