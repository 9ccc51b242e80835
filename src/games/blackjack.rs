//! Single-deck blackjack
//!
//! Cards are drawn without replacement from whatever the deck has left.
//! The dealer's hole card is only drawn once the player's turn is over, so
//! no envelope ever carries it early. Dealer stands on every 17.

use crate::errors::{HouseError, HouseResult};
use crate::games::randomness::RandomDraw;
use crate::games::types::{BlackjackPhase, BlackjackState, Card, GameAction, Winner};

const DEALER_STANDS_ON: u8 = 17;

/// Best total for a hand and whether an ace is counted as 11
pub fn hand_value(cards: &[Card]) -> (u8, bool) {
    let hard: u8 = cards.iter().map(|c| c.value()).sum();
    let has_ace = cards.iter().any(|c| c.rank == 1);
    if has_ace && hard + 10 <= 21 {
        (hard + 10, true)
    } else {
        (hard, false)
    }
}

pub fn is_natural(cards: &[Card]) -> bool {
    cards.len() == 2 && hand_value(cards).0 == 21
}

fn draw_card(state: &BlackjackState, draw: &mut RandomDraw) -> HouseResult<Card> {
    let dealt: Vec<u8> = state
        .player_hand
        .iter()
        .chain(state.dealer_hand.iter())
        .map(|c| c.index())
        .collect();
    let remaining: Vec<u8> = (0..52u8).filter(|i| !dealt.contains(i)).collect();
    if remaining.is_empty() {
        return Err(HouseError::Infrastructure("deck exhausted".to_string()));
    }
    let pick = draw.uniform(remaining.len() as u64)? as usize;
    Ok(Card::from_index(remaining[pick]))
}

fn play_dealer(state: &mut BlackjackState, draw: &mut RandomDraw) -> HouseResult<()> {
    while state.dealer_hand.len() < 2 || hand_value(&state.dealer_hand).0 < DEALER_STANDS_ON {
        let card = draw_card(state, draw)?;
        state.dealer_hand.push(card);
    }
    state.phase = BlackjackPhase::Settled;
    Ok(())
}

pub fn apply(state: &mut BlackjackState, action: GameAction, draw: &mut RandomDraw) -> HouseResult<()> {
    match (state.phase, action) {
        (BlackjackPhase::AwaitingDeal, GameAction::Deal) => {
            for _ in 0..2 {
                let card = draw_card(state, draw)?;
                state.player_hand.push(card);
            }
            let up = draw_card(state, draw)?;
            state.dealer_hand.push(up);
            state.phase = BlackjackPhase::PlayerTurn;

            if is_natural(&state.player_hand) {
                state.natural = true;
                let hole = draw_card(state, draw)?;
                state.dealer_hand.push(hole);
                state.phase = BlackjackPhase::Settled;
            }
            Ok(())
        }
        (BlackjackPhase::PlayerTurn, GameAction::Hit) => {
            let card = draw_card(state, draw)?;
            state.player_hand.push(card);
            let (total, _) = hand_value(&state.player_hand);
            if total > 21 {
                state.phase = BlackjackPhase::Settled;
            } else if total == 21 {
                play_dealer(state, draw)?;
            }
            Ok(())
        }
        (BlackjackPhase::PlayerTurn, GameAction::Stand) => play_dealer(state, draw),
        (phase, action) => Err(HouseError::Validation(format!(
            "action {} is not legal for blackjack in phase {:?}",
            action, phase
        ))),
    }
}

pub fn winner(state: &BlackjackState) -> Option<Winner> {
    if state.phase != BlackjackPhase::Settled {
        return None;
    }

    let (player, _) = hand_value(&state.player_hand);
    let (dealer, _) = hand_value(&state.dealer_hand);
    let dealer_natural = is_natural(&state.dealer_hand);

    Some(if player > 21 {
        Winner::House
    } else if state.natural {
        if dealer_natural {
            Winner::Draw
        } else {
            Winner::Player
        }
    } else if dealer_natural {
        Winner::House
    } else if dealer > 21 || player > dealer {
        Winner::Player
    } else if player < dealer {
        Winner::House
    } else {
        Winner::Draw
    })
}
