//! Domain rules for simulated game sessions.
//!
//! A session's state is a board: one byte per cell, `0` for a free cell and
//! the owner's seat otherwise. A proposal carries the whole board the client
//! wants to reach.

use bytes::Bytes;
use concord_core::{Proposal, SessionRules, StateRecord};

/// Claims on disjoint cells commute; a claim on a cell someone else already
/// owns does not.
///
/// When a proposal loses a race, its claims are replayed on top of the newer
/// board. The replay is rejected if any claimed cell changed owner in the
/// meantime, or if nothing would be left to claim.
#[derive(Debug, Clone, Copy, Default)]
pub struct CellClaimRules;

impl CellClaimRules {
    /// Empty board with `cells` cells.
    pub fn board(cells: usize) -> Bytes {
        Bytes::from(vec![0u8; cells])
    }

    /// `board` with `cell` owned by `seat`. Grows the board if needed.
    pub fn claim(board: &[u8], cell: usize, seat: u8) -> Bytes {
        let mut next = board.to_vec();
        if next.len() <= cell {
            next.resize(cell + 1, 0);
        }
        next[cell] = seat;
        Bytes::from(next)
    }

    /// Owner of `cell`, if claimed.
    pub fn owner(board: &[u8], cell: usize) -> Option<u8> {
        board.get(cell).copied().filter(|seat| *seat != 0)
    }
}

impl SessionRules for CellClaimRules {
    fn rederive(&self, current: &StateRecord, proposal: &Proposal) -> Option<Bytes> {
        let head = &current.payload;
        let wanted = &proposal.payload;
        let len = head.len().max(wanted.len());

        let mut merged = Vec::with_capacity(len);
        let mut gained = false;
        for cell in 0..len {
            let held = head.get(cell).copied().unwrap_or(0);
            let claim = wanted.get(cell).copied().unwrap_or(0);
            match (held, claim) {
                (0, 0) => merged.push(0),
                (0, seat) => {
                    gained = true;
                    merged.push(seat);
                },
                (owner, 0) => merged.push(owner),
                (owner, seat) if owner == seat => merged.push(owner),
                (_, _) => return None,
            }
        }

        gained.then(|| Bytes::from(merged))
    }
}
