//! Shipped views over the board and card mirrors.

use std::collections::HashSet;
use std::sync::Arc;

use tidepool_client::{Board, Card, CardStatus, Identity, TableMirror};

use crate::view::DerivedView;

/// Card counts for one board, partitioned by workflow status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoardActivity {
    /// Board the counts describe.
    pub board_id: u64,
    /// Cards not yet started.
    pub todo: usize,
    /// Cards in progress.
    pub in_progress: usize,
    /// Finished cards.
    pub done: usize,
}

impl BoardActivity {
    /// Total cards on the board.
    pub fn total(&self) -> usize {
        self.todo + self.in_progress + self.done
    }

    /// Whether the board has any cards at all.
    pub fn has_activity(&self) -> bool {
        self.total() > 0
    }
}

/// Live status counts for `board_id`, derived from the card mirror.
pub fn board_activity(
    cards: &Arc<TableMirror<Card>>,
    board_id: u64,
) -> Arc<DerivedView<BoardActivity>> {
    let mirror = Arc::clone(cards);
    let view = DerivedView::new(move || {
        let mut activity = BoardActivity {
            board_id,
            ..Default::default()
        };
        // One snapshot per recompute; counts never mix two mirror states.
        for card in mirror.snapshot() {
            if card.board_id != board_id {
                continue;
            }
            match card.status {
                CardStatus::Todo => activity.todo += 1,
                CardStatus::InProgress => activity.in_progress += 1,
                CardStatus::Done => activity.done += 1,
            }
        }
        activity
    });
    view.track(cards);
    view
}

/// Cards the subject can see: every card whose board the subject owns or
/// collaborates on. A two-mirror join, invalidated by changes to either
/// side.
///
/// Output is ordered by (board, position, card id) so consumers get a
/// stable rendering order.
pub fn visible_cards(
    boards: &Arc<TableMirror<Board>>,
    cards: &Arc<TableMirror<Card>>,
    subject: Identity,
) -> Arc<DerivedView<Vec<Card>>> {
    let board_mirror = Arc::clone(boards);
    let card_mirror = Arc::clone(cards);
    let view = DerivedView::new(move || {
        let visible: HashSet<u64> = board_mirror
            .snapshot()
            .into_iter()
            .filter(|board| board.visible_to(&subject))
            .map(|board| board.board_id)
            .collect();

        let mut cards: Vec<Card> = card_mirror
            .snapshot()
            .into_iter()
            .filter(|card| visible.contains(&card.board_id))
            .collect();
        cards.sort_by_key(|card| (card.board_id, card.position, card.card_id));
        cards
    });
    view.track(boards);
    view.track(cards);
    view
}

// === Unit Tests ===
