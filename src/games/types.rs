use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported game types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum GameType {
    CoinFlip,
    RockPaperScissors,
    Blackjack,
}

impl fmt::Display for GameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameType::CoinFlip => write!(f, "coinflip"),
            GameType::RockPaperScissors => write!(f, "rockpaperscissors"),
            GameType::Blackjack => write!(f, "blackjack"),
        }
    }
}

/// Coin flip choice
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CoinChoice {
    Heads,
    Tails,
}

impl fmt::Display for CoinChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoinChoice::Heads => write!(f, "heads"),
            CoinChoice::Tails => write!(f, "tails"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RpsMove {
    Rock,
    Paper,
    Scissors,
}

impl RpsMove {
    pub const ALL: [RpsMove; 3] = [RpsMove::Rock, RpsMove::Paper, RpsMove::Scissors];

    pub fn beats(self, other: RpsMove) -> bool {
        matches!(
            (self, other),
            (RpsMove::Rock, RpsMove::Scissors)
                | (RpsMove::Paper, RpsMove::Rock)
                | (RpsMove::Scissors, RpsMove::Paper)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Suit {
    Clubs,
    Diamonds,
    Hearts,
    Spades,
}

/// A playing card; rank 1 is the ace, 11..=13 are face cards
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Card {
    pub rank: u8,
    pub suit: Suit,
}

impl Card {
    /// Card at `index` of a fresh 52-card deck
    pub fn from_index(index: u8) -> Self {
        let suit = match index / 13 {
            0 => Suit::Clubs,
            1 => Suit::Diamonds,
            2 => Suit::Hearts,
            _ => Suit::Spades,
        };
        Self {
            rank: index % 13 + 1,
            suit,
        }
    }

    pub fn index(&self) -> u8 {
        let suit = match self.suit {
            Suit::Clubs => 0,
            Suit::Diamonds => 1,
            Suit::Hearts => 2,
            Suit::Spades => 3,
        };
        suit * 13 + self.rank - 1
    }

    /// Hard value, aces counted as 1
    pub fn value(&self) -> u8 {
        self.rank.min(10)
    }
}

/// Who won a finished game
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Player,
    House,
    Draw,
}

impl fmt::Display for Winner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Winner::Player => write!(f, "player"),
            Winner::House => write!(f, "house"),
            Winner::Draw => write!(f, "draw"),
        }
    }
}

/// Settled result of a session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameResult {
    pub winner: Winner,
    /// Total returned to the player, stake included
    pub player_payout: u64,
    /// Portion of the stake kept by the house
    pub house_payout: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CoinFlipPhase {
    AwaitingChoice,
    Settled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoinFlipState {
    pub phase: CoinFlipPhase,
    pub player_choice: Option<CoinChoice>,
    pub landed: Option<CoinChoice>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RpsPhase {
    AwaitingThrow,
    Settled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpsState {
    pub phase: RpsPhase,
    pub player_move: Option<RpsMove>,
    pub house_move: Option<RpsMove>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlackjackPhase {
    AwaitingDeal,
    PlayerTurn,
    Settled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlackjackState {
    pub phase: BlackjackPhase,
    pub player_hand: Vec<Card>,
    /// Up card only until the player stands; the hole card is drawn then
    pub dealer_hand: Vec<Card>,
    pub natural: bool,
}

/// Authoritative per-game state, one variant per game type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "game", rename_all = "snake_case")]
pub enum GameState {
    CoinFlip(CoinFlipState),
    RockPaperScissors(RpsState),
    Blackjack(BlackjackState),
}

impl GameState {
    /// State a session starts in once it holds liquidity
    pub fn initial(game_type: GameType) -> Self {
        match game_type {
            GameType::CoinFlip => GameState::CoinFlip(CoinFlipState {
                phase: CoinFlipPhase::AwaitingChoice,
                player_choice: None,
                landed: None,
            }),
            GameType::RockPaperScissors => GameState::RockPaperScissors(RpsState {
                phase: RpsPhase::AwaitingThrow,
                player_move: None,
                house_move: None,
            }),
            GameType::Blackjack => GameState::Blackjack(BlackjackState {
                phase: BlackjackPhase::AwaitingDeal,
                player_hand: Vec::new(),
                dealer_hand: Vec::new(),
                natural: false,
            }),
        }
    }

    pub fn game_type(&self) -> GameType {
        match self {
            GameState::CoinFlip(_) => GameType::CoinFlip,
            GameState::RockPaperScissors(_) => GameType::RockPaperScissors,
            GameState::Blackjack(_) => GameType::Blackjack,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            GameState::CoinFlip(s) => s.phase == CoinFlipPhase::Settled,
            GameState::RockPaperScissors(s) => s.phase == RpsPhase::Settled,
            GameState::Blackjack(s) => s.phase == BlackjackPhase::Settled,
        }
    }

    pub fn phase_name(&self) -> &'static str {
        match self {
            GameState::CoinFlip(s) => match s.phase {
                CoinFlipPhase::AwaitingChoice => "awaiting_choice",
                CoinFlipPhase::Settled => "settled",
            },
            GameState::RockPaperScissors(s) => match s.phase {
                RpsPhase::AwaitingThrow => "awaiting_throw",
                RpsPhase::Settled => "settled",
            },
            GameState::Blackjack(s) => match s.phase {
                BlackjackPhase::AwaitingDeal => "awaiting_deal",
                BlackjackPhase::PlayerTurn => "player_turn",
                BlackjackPhase::Settled => "settled",
            },
        }
    }
}

/// A move submitted by the client
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GameAction {
    Flip { choice: CoinChoice },
    Throw { choice: RpsMove },
    Deal,
    Hit,
    Stand,
}

impl fmt::Display for GameAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameAction::Flip { choice } => write!(f, "flip:{}", choice),
            GameAction::Throw { choice } => write!(f, "throw:{:?}", choice),
            GameAction::Deal => write!(f, "deal"),
            GameAction::Hit => write!(f, "hit"),
            GameAction::Stand => write!(f, "stand"),
        }
    }
}

/// Result a client asserts alongside a move; never trusted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimedResult {
    pub winner: Winner,
    #[serde(default)]
    pub player_payout: Option<u64>,
}
