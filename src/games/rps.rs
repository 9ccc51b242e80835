use crate::errors::{HouseError, HouseResult};
use crate::games::randomness::RandomDraw;
use crate::games::types::{GameAction, RpsMove, RpsPhase, RpsState, Winner};

/// Apply a throw. The house move is drawn uniformly; a tie settles as a draw.
pub fn apply(state: &mut RpsState, action: GameAction, draw: &mut RandomDraw) -> HouseResult<()> {
    match (state.phase, action) {
        (RpsPhase::AwaitingThrow, GameAction::Throw { choice }) => {
            let house = RpsMove::ALL[draw.uniform(3)? as usize];
            state.player_move = Some(choice);
            state.house_move = Some(house);
            state.phase = RpsPhase::Settled;
            Ok(())
        }
        (phase, action) => Err(HouseError::Validation(format!(
            "action {} is not legal for rock-paper-scissors in phase {:?}",
            action, phase
        ))),
    }
}

pub fn winner(state: &RpsState) -> Option<Winner> {
    if state.phase != RpsPhase::Settled {
        return None;
    }
    let (player, house) = (state.player_move?, state.house_move?);
    Some(if player.beats(house) {
        Winner::Player
    } else if house.beats(player) {
        Winner::House
    } else {
        Winner::Draw
    })
}
