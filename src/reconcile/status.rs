//! Status code precedence
//!
//! The most restrictive answer any node gives wins:
//! 403 > 401 > 5xx > other non-2xx > 2xx.

use crate::replication::NodeResponse;

pub fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Precedence of a status code; higher wins
pub fn status_rank(status: u16) -> u8 {
    match status {
        403 => 5,
        401 => 4,
        500..=599 => 3,
        s if is_success(s) => 1,
        _ => 2,
    }
}

/// Index of the response whose status the merged result takes.
///
/// Ties go to the earliest response. `None` only for an empty slice.
pub fn select_status(responses: &[NodeResponse]) -> Option<usize> {
    let mut winner: Option<(usize, u8)> = None;
    for (index, response) in responses.iter().enumerate() {
        let rank = status_rank(response.status);
        match winner {
            Some((_, best)) if best >= rank => {}
            _ => winner = Some((index, rank)),
        }
    }
    winner.map(|(index, _)| index)
}
