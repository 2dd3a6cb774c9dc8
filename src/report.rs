//! Diagnostic reports for deadlocks and behavior faults.
//!
//! Both carry the declarations active when the problem happened, so a wrong
//! bound check in one behavior can be traced without instrumenting the kernel.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::{bthread::BehaviorError, declaration::Declaration, kernel::BlockedCandidate};

#[derive(Debug, Clone, PartialEq)]
pub struct ThreadDeclaration {
    pub thread: String,
    pub declaration: Declaration,
}

impl fmt::Display for ThreadDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.thread, self.declaration)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeadlockReport {
    pub round: u64,
    pub at: DateTime<Utc>,
    pub declarations: Vec<ThreadDeclaration>,
    pub blocked: Vec<BlockedCandidate>,
}

impl DeadlockReport {
    /// True when something was requested but every candidate was vetoed.
    pub fn has_blocked_requests(&self) -> bool {
        !self.blocked.is_empty()
    }

    pub fn declaration_of(&self, thread: &str) -> Option<&Declaration> {
        self.declarations
            .iter()
            .find(|d| d.thread == thread)
            .map(|d| &d.declaration)
    }
}

impl fmt::Display for DeadlockReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "no event selectable in round {}", self.round)?;
        for candidate in &self.blocked {
            writeln!(
                f,
                "  {} requested by {} blocked by [{}]",
                candidate.event,
                candidate.requested_by,
                candidate.blocked_by.join(", ")
            )?;
        }
        for declaration in &self.declarations {
            writeln!(f, "  {}", declaration)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaultReport {
    pub thread: String,
    pub round: u64,
    pub at: DateTime<Utc>,
    pub error: BehaviorError,
    /// The declaration the faulting thread was last resumed from, if any,
    /// followed by those of the other suspended threads.
    pub declarations: Vec<ThreadDeclaration>,
}

impl fmt::Display for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "b-thread {} faulted in round {}: {}",
            self.thread, self.round, self.error
        )?;
        for declaration in &self.declarations {
            writeln!(f, "  {}", declaration)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    #[test]
    fn test_deadlock_display_names_blockers() {
        let report = DeadlockReport {
            round: 4,
            at: Utc::now(),
            declarations: vec![ThreadDeclaration {
                thread: "ViscosityLimiter".to_string(),
                declaration: Declaration::new().block("ADD_DRY"),
            }],
            blocked: vec![BlockedCandidate {
                event: Event::new("ADD_DRY"),
                requested_by: "Mixer".to_string(),
                blocked_by: vec!["ViscosityLimiter".to_string()],
            }],
        };
        let text = report.to_string();
        assert!(text.contains("round 4"));
        assert!(text.contains("ADD_DRY requested by Mixer blocked by [ViscosityLimiter]"));
        assert!(text.contains("ViscosityLimiter: request=[] waitFor=none block=ADD_DRY"));
        assert!(report.has_blocked_requests());
        assert!(report.declaration_of("ViscosityLimiter").is_some());
    }
}
