//! TID ↔ access-category mapping.
//!
//! Eight traffic identifiers (TIDs) map pairwise onto the four WMM access
//! categories. The mapping from *priority slot* (the order the scheduler
//! scans in) to TID is mutable: when the network advertises new channel
//! parameters the four ACs are re-ranked by their average channel-access
//! backoff and the slot table is rebuilt.

/// Number of traffic identifiers.
pub const MAX_TIDS: usize = 8;

/// Highest priority slot index.
pub const TOP_SLOT: usize = MAX_TIDS - 1;

/// The four WMM access categories, ordered by rising priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessCategory {
    Background = 0,
    BestEffort = 1,
    Video = 2,
    Voice = 3,
}

impl AccessCategory {
    pub const ALL: [AccessCategory; 4] = [
        AccessCategory::Background,
        AccessCategory::BestEffort,
        AccessCategory::Video,
        AccessCategory::Voice,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccessCategory::Background => "BK",
            AccessCategory::BestEffort => "BE",
            AccessCategory::Video => "VI",
            AccessCategory::Voice => "VO",
        }
    }
}

/// The two TIDs (even/odd siblings) belonging to each AC.
pub const AC_TO_TID: [[usize; 2]; 4] = [[1, 2], [0, 3], [4, 5], [6, 7]];

/// Fixed TID → AC assignment (TIDs 1 and 2 are Background, 0 and 3
/// BestEffort, and so on).
const TID_TO_AC: [AccessCategory; MAX_TIDS] = [
    AccessCategory::BestEffort,
    AccessCategory::Background,
    AccessCategory::Background,
    AccessCategory::BestEffort,
    AccessCategory::Video,
    AccessCategory::Video,
    AccessCategory::Voice,
    AccessCategory::Voice,
];

/// The AC a TID belongs to; out-of-range TIDs classify as best effort.
pub fn ac_of_tid(tid: usize) -> AccessCategory {
    if tid < MAX_TIDS {
        TID_TO_AC[tid]
    } else {
        AccessCategory::BestEffort
    }
}

/// Per-AC channel-access parameters from an advertised parameter set.
///
/// Only the fields that feed the average-backoff ranking are carried.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcChannelParams {
    /// Arbitration inter-frame space number.
    pub aifsn: u8,
    /// Exponent of the minimum contention window (CWmin = 2^ecw_min - 1).
    pub ecw_min: u8,
}

impl AcChannelParams {
    /// Average backoff: half the minimum contention window plus the AIFS.
    fn avg_backoff(&self) -> u16 {
        let cw_min = (1u16 << self.ecw_min.min(15)) - 1;
        (cw_min >> 1) + self.aifsn as u16
    }
}

/// Rank the four ACs by average backoff, lowest (= highest priority) first.
/// Ties go to the AC with the higher default priority.
pub fn rank_by_backoff(params: &[AcChannelParams; 4]) -> [AccessCategory; 4] {
    let mut order = AccessCategory::ALL;
    let mut backoff = [0u16; 4];
    for ac in AccessCategory::ALL {
        backoff[ac.index()] = params[ac.index()].avg_backoff();
    }
    let mut keys: [u16; 4] = [
        backoff[order[0].index()],
        backoff[order[1].index()],
        backoff[order[2].index()],
        backoff[order[3].index()],
    ];
    // Bubble sort, stable on the tie rule: equal backoffs keep the
    // higher-priority AC in front.
    for i in 0..4 {
        for j in 1..4 - i {
            let swap = keys[j - 1] > keys[j]
                || (keys[j - 1] == keys[j] && order[j - 1] < order[j]);
            if swap {
                keys.swap(j - 1, j);
                order.swap(j - 1, j);
            }
        }
    }
    order
}

/// Mutable priority-slot ↔ TID table.
///
/// `slot_to_tid[s]` is the TID scanned at priority slot `s` (slot 7 first).
/// The inverse table answers "at which slot does TID t currently sit".
#[derive(Debug, Clone)]
pub struct PriorityMap {
    slot_to_tid: [usize; MAX_TIDS],
    tid_to_slot: [usize; MAX_TIDS],
}

impl Default for PriorityMap {
    fn default() -> Self {
        let mut map = Self {
            slot_to_tid: [0; MAX_TIDS],
            tid_to_slot: [0; MAX_TIDS],
        };
        map.reconfigure(Self::DEFAULT_ORDER);
        map
    }
}

impl PriorityMap {
    /// Default AC ranking: VO > VI > BE > BK.
    pub const DEFAULT_ORDER: [AccessCategory; 4] = [
        AccessCategory::Voice,
        AccessCategory::Video,
        AccessCategory::BestEffort,
        AccessCategory::Background,
    ];

    /// Map a producer-supplied priority value to a TID. Values 0–7 map
    /// straight through; anything else classifies as best effort (TID 0).
    pub fn classify(&self, priority: u32) -> usize {
        if (priority as usize) < MAX_TIDS {
            priority as usize
        } else {
            AC_TO_TID[AccessCategory::BestEffort.index()][0]
        }
    }

    /// The AC a TID belongs to.
    pub fn ac_of(&self, tid: usize) -> AccessCategory {
        ac_of_tid(tid)
    }

    /// The even/odd TID pair belonging to an AC.
    pub fn tids_of(&self, ac: AccessCategory) -> [usize; 2] {
        AC_TO_TID[ac.index()]
    }

    /// TID currently sitting at priority slot `slot`.
    pub fn tid_at_slot(&self, slot: usize) -> usize {
        self.slot_to_tid[slot]
    }

    /// Priority slot TID `tid` currently sits at.
    pub fn slot_of(&self, tid: usize) -> usize {
        self.tid_to_slot[tid]
    }

    /// Rebuild the slot table from a new AC ranking (`ranking[0]` is the
    /// highest-priority AC). The odd sibling of each AC lands on the higher
    /// of its two slots.
    pub fn reconfigure(&mut self, ranking: [AccessCategory; 4]) {
        for (i, ac) in ranking.iter().enumerate() {
            let pair = AC_TO_TID[ac.index()];
            self.slot_to_tid[TOP_SLOT - i * 2] = pair[1];
            self.slot_to_tid[TOP_SLOT - 1 - i * 2] = pair[0];
        }
        for (slot, &tid) in self.slot_to_tid.iter().enumerate() {
            self.tid_to_slot[tid] = slot;
        }
    }

    /// Restore the default VO > VI > BE > BK ranking.
    pub fn reset(&mut self) {
        self.reconfigure(Self::DEFAULT_ORDER);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_slot_table_matches_wmm_defaults() {
        let map = PriorityMap::default();
        assert_eq!(map.slot_to_tid, [1, 2, 0, 3, 4, 5, 6, 7]);
        assert_eq!(map.tid_to_slot, [2, 0, 1, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn classify_passes_valid_and_defaults_out_of_range() {
        let map = PriorityMap::default();
        for p in 0..8 {
            assert_eq!(map.classify(p), p as usize);
        }
        assert_eq!(map.classify(8), 0);
        assert_eq!(map.classify(255), 0);
    }

    #[test]
    fn ac_of_pairs_tids() {
        let map = PriorityMap::default();
        assert_eq!(map.ac_of(1), AccessCategory::Background);
        assert_eq!(map.ac_of(2), AccessCategory::Background);
        assert_eq!(map.ac_of(0), AccessCategory::BestEffort);
        assert_eq!(map.ac_of(3), AccessCategory::BestEffort);
        assert_eq!(map.ac_of(6), AccessCategory::Voice);
        assert_eq!(map.tids_of(AccessCategory::Video), [4, 5]);
    }

    #[test]
    fn rank_by_backoff_orders_ascending() {
        // Typical EDCA defaults: VO smallest window, BK largest.
        let mut params = [AcChannelParams::default(); 4];
        params[AccessCategory::Background.index()] = AcChannelParams { aifsn: 7, ecw_min: 4 };
        params[AccessCategory::BestEffort.index()] = AcChannelParams { aifsn: 3, ecw_min: 4 };
        params[AccessCategory::Video.index()] = AcChannelParams { aifsn: 2, ecw_min: 3 };
        params[AccessCategory::Voice.index()] = AcChannelParams { aifsn: 2, ecw_min: 2 };

        let order = rank_by_backoff(&params);
        assert_eq!(
            order,
            [
                AccessCategory::Voice,
                AccessCategory::Video,
                AccessCategory::BestEffort,
                AccessCategory::Background,
            ]
        );
    }

    #[test]
    fn rank_ties_prefer_higher_default_priority() {
        // All four ACs identical: ranking must fall back to VO > VI > BE > BK.
        let params = [AcChannelParams { aifsn: 2, ecw_min: 3 }; 4];
        assert_eq!(rank_by_backoff(&params), PriorityMap::DEFAULT_ORDER);
    }

    #[test]
    fn reconfigure_moves_pairs_together() {
        let mut map = PriorityMap::default();
        // Invert the ranking entirely: BK becomes highest priority.
        map.reconfigure([
            AccessCategory::Background,
            AccessCategory::BestEffort,
            AccessCategory::Video,
            AccessCategory::Voice,
        ]);
        assert_eq!(map.tid_at_slot(7), 2); // BK odd sibling on top
        assert_eq!(map.tid_at_slot(6), 1);
        assert_eq!(map.tid_at_slot(1), 7); // VO at the bottom
        assert_eq!(map.tid_at_slot(0), 6);
        // Inverse stays consistent.
        for slot in 0..MAX_TIDS {
            assert_eq!(map.slot_of(map.tid_at_slot(slot)), slot);
        }
        map.reset();
        assert_eq!(map.slot_to_tid, [1, 2, 0, 3, 4, 5, 6, 7]);
    }
}
