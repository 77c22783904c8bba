//! Per-AC admission state and the downgrade table.
//!
//! The network side grants or revokes the use of each access category; an
//! AC that is disabled, or that requires admission which has not been
//! granted, must never carry traffic directly. Enqueued frames for such an
//! AC are downgraded to the best allowed AC at or below it.

use crate::priority::{AccessCategory, AC_TO_TID, MAX_TIDS};
use tracing::debug;

/// Externally learned status of one access category.
#[derive(Debug, Clone, Copy)]
pub struct AcStatus {
    pub enabled: bool,
    pub admission_required: bool,
    pub admission_granted: bool,
}

impl Default for AcStatus {
    fn default() -> Self {
        Self {
            enabled: true,
            admission_required: false,
            admission_granted: false,
        }
    }
}

impl AcStatus {
    /// An AC is usable iff it is enabled and does not require admission
    /// that has not been granted.
    fn usable(&self) -> bool {
        self.enabled && !(self.admission_required && !self.admission_granted)
    }
}

/// Admission state for all four ACs plus the derived downgrade table.
#[derive(Debug, Clone)]
pub struct AccessCategoryAdmission {
    status: [AcStatus; 4],
    downgraded: [AccessCategory; 4],
}

impl Default for AccessCategoryAdmission {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessCategoryAdmission {
    pub fn new() -> Self {
        let mut adm = Self {
            status: [AcStatus::default(); 4],
            downgraded: AccessCategory::ALL,
        };
        adm.recompute();
        adm
    }

    pub fn status(&self, ac: AccessCategory) -> AcStatus {
        self.status[ac.index()]
    }

    /// Record a new status for one AC and rebuild the downgrade table.
    pub fn update(&mut self, ac: AccessCategory, status: AcStatus) {
        self.status[ac.index()] = status;
        self.recompute();
        debug!(
            ac = ac.as_str(),
            enabled = status.enabled,
            admission_required = status.admission_required,
            admission_granted = status.admission_granted,
            downgrade = self.downgrade(ac).as_str(),
            "AC status updated"
        );
    }

    /// Rebuild the downgrade table from the current per-AC status.
    fn recompute(&mut self) {
        for ac in AccessCategory::ALL {
            self.downgraded[ac.index()] = self.eval_downgrade(ac);
        }
    }

    /// The AC traffic for `ac` must actually be sent on: `ac` itself when
    /// usable, otherwise the highest-priority usable AC below it, falling
    /// back to Background when nothing qualifies.
    fn eval_downgrade(&self, ac: AccessCategory) -> AccessCategory {
        if self.status[ac.index()].usable() {
            return ac;
        }
        let mut chosen = AccessCategory::Background;
        for candidate in AccessCategory::ALL {
            if candidate >= ac {
                break;
            }
            if self.status[candidate.index()].usable() {
                chosen = candidate;
            }
        }
        chosen
    }

    /// Downgrade-table lookup for the enqueue path.
    pub fn downgrade(&self, ac: AccessCategory) -> AccessCategory {
        self.downgraded[ac.index()]
    }

    /// Downgrade a TID: map to its AC, downgrade the AC, then pick the
    /// sibling of the target AC matching the original TID's parity so that
    /// relative order inside the pair survives the downgrade. TIDs 1 and 2
    /// (the Background pair, which sits out of numeric order) swap parity.
    pub fn downgrade_tid(&self, tid: usize) -> usize {
        let down = self.downgrade(crate::priority::ac_of_tid(tid));
        let pair = AC_TO_TID[down.index()];
        match tid {
            1 | 2 => pair[(tid + 1) % 2],
            t if t >= MAX_TIDS => pair[0],
            t => pair[t % 2],
        }
    }
}
