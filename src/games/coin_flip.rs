use crate::errors::{HouseError, HouseResult};
use crate::games::randomness::RandomDraw;
use crate::games::types::{CoinChoice, CoinFlipPhase, CoinFlipState, GameAction, Winner};

/// Apply a move to a coin flip. One draw decides the face.
pub fn apply(state: &mut CoinFlipState, action: GameAction, draw: &mut RandomDraw) -> HouseResult<()> {
    match (state.phase, action) {
        (CoinFlipPhase::AwaitingChoice, GameAction::Flip { choice }) => {
            let landed = if draw.uniform(2)? == 0 {
                CoinChoice::Heads
            } else {
                CoinChoice::Tails
            };
            state.player_choice = Some(choice);
            state.landed = Some(landed);
            state.phase = CoinFlipPhase::Settled;
            Ok(())
        }
        (phase, action) => Err(HouseError::Validation(format!(
            "action {} is not legal for coin flip in phase {:?}",
            action, phase
        ))),
    }
}

pub fn winner(state: &CoinFlipState) -> Option<Winner> {
    match (state.phase, state.player_choice, state.landed) {
        (CoinFlipPhase::Settled, Some(choice), Some(landed)) if choice == landed => Some(Winner::Player),
        (CoinFlipPhase::Settled, Some(_), Some(_)) => Some(Winner::House),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::randomness::{RandomnessOrigin, RandomnessRecord};
    use crate::games::types::{GameState, GameType};

    fn draw(values: Vec<u64>) -> RandomDraw {
        RandomDraw::new(RandomnessRecord {
            request_id: "t".to_string(),
            origin: RandomnessOrigin::Oracle,
            proof: String::new(),
            values,
            extended: 0,
        })
    }

    fn fresh() -> CoinFlipState {
        match GameState::initial(GameType::CoinFlip) {
            GameState::CoinFlip(s) => s,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_even_value_lands_heads() {
        let mut state = fresh();
        apply(&mut state, GameAction::Flip { choice: CoinChoice::Heads }, &mut draw(vec![4])).unwrap();
        assert_eq!(state.landed, Some(CoinChoice::Heads));
        assert_eq!(winner(&state), Some(Winner::Player));
    }

    #[test]
    fn test_odd_value_lands_tails() {
        let mut state = fresh();
        apply(&mut state, GameAction::Flip { choice: CoinChoice::Heads }, &mut draw(vec![7])).unwrap();
        assert_eq!(winner(&state), Some(Winner::House));
    }

    #[test]
    fn test_second_flip_rejected() {
        let mut state = fresh();
        apply(&mut state, GameAction::Flip { choice: CoinChoice::Tails }, &mut draw(vec![1])).unwrap();
        let before = state.clone();
        let err = apply(&mut state, GameAction::Flip { choice: CoinChoice::Heads }, &mut draw(vec![0]));
        assert!(matches!(err, Err(HouseError::Validation(_))));
        assert_eq!(state, before);
    }

    #[test]
    fn test_wrong_game_action_rejected() {
        let mut state = fresh();
        assert!(apply(&mut state, GameAction::Hit, &mut draw(vec![0])).is_err());
        assert_eq!(winner(&state), None);
    }
}
