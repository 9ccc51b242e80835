//! Deterministic payouts
//!
//! Payouts are recomputed from the authoritative state only. A client
//! assertion is compared against the result afterwards and never feeds it.

use crate::config::{apply_bps, PayoutTable};
use crate::games::types::{ClaimedResult, GameResult, GameState, Winner};
use crate::games::{blackjack, coin_flip, rps};

/// Winner of a terminal state, `None` while play continues
pub fn winner(state: &GameState) -> Option<Winner> {
    match state {
        GameState::CoinFlip(s) => coin_flip::winner(s),
        GameState::RockPaperScissors(s) => rps::winner(s),
        GameState::Blackjack(s) => blackjack::winner(s),
    }
}

fn multiplier_bps(state: &GameState, winner: Winner, payouts: &PayoutTable) -> u32 {
    match (winner, state) {
        (Winner::House, _) => 0,
        (Winner::Draw, _) => payouts.push_bps,
        (Winner::Player, GameState::CoinFlip(_)) => payouts.coin_flip_win_bps,
        (Winner::Player, GameState::RockPaperScissors(_)) => payouts.rps_win_bps,
        (Winner::Player, GameState::Blackjack(s)) if s.natural => payouts.blackjack_natural_bps,
        (Winner::Player, GameState::Blackjack(_)) => payouts.blackjack_win_bps,
    }
}

/// Result for a terminal state
pub fn compute_result(state: &GameState, bet_amount: u64, payouts: &PayoutTable) -> Option<GameResult> {
    let winner = winner(state)?;
    let player_payout = apply_bps(bet_amount, multiplier_bps(state, winner, payouts));
    Some(GameResult {
        winner,
        player_payout,
        house_payout: bet_amount.saturating_sub(player_payout),
    })
}

/// Result when a session ends without a settled game: the stake comes back
/// unless a round was already played, in which case the house keeps it.
pub fn forfeit_result(bet_amount: u64, rounds_played: u32) -> GameResult {
    if rounds_played == 0 {
        GameResult {
            winner: Winner::Draw,
            player_payout: bet_amount,
            house_payout: 0,
        }
    } else {
        GameResult {
            winner: Winner::House,
            player_payout: 0,
            house_payout: bet_amount,
        }
    }
}

/// Whether a client claim disagrees with the server's result
pub fn claim_mismatch(claim: &ClaimedResult, actual: Option<&GameResult>) -> bool {
    match actual {
        None => true,
        Some(result) => {
            claim.winner != result.winner
                || claim
                    .player_payout
                    .map(|p| p != result.player_payout)
                    .unwrap_or(false)
        }
    }
}
