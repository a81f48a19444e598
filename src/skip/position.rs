//! Node positions inside one subtree blob

/// Where a node sits inside a subtree: `height` levels below the subtree
/// root, `index`-th node from the left on that level.
///
/// Positions are derived while walking a blob and never stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Position {
    pub height: u8,
    pub index: usize,
}

impl Position {
    pub const ROOT: Position = Position {
        height: 0,
        index: 0,
    };

    pub fn new(height: u8, index: usize) -> Self {
        Position { height, index }
    }

    /// Position of the frontier node that starts at leaf slot `slot` of a
    /// subtree `subtree_height` levels deep
    pub fn at_slot(height: u8, slot: usize, subtree_height: u8) -> Self {
        Position::new(height, slot >> (subtree_height - height))
    }

    /// `None` at the subtree root
    pub fn parent(&self) -> Option<Self> {
        if self.height == 0 {
            return None;
        }
        Some(Position::new(self.height - 1, self.index / 2))
    }

    pub fn is_left(&self) -> bool {
        self.index % 2 == 0
    }

    /// Whether `other` is the right-hand sibling of this position
    pub fn is_left_sibling_of(&self, other: &Position) -> bool {
        self.height == other.height
            && self.height > 0
            && self.is_left()
            && other.index == self.index + 1
    }

    /// Number of leaf slots below this position
    pub fn span(&self, subtree_height: u8) -> usize {
        1 << (subtree_height - self.height)
    }

    /// Whether leaf slot `slot` lies below this position
    pub fn contains(&self, slot: usize, subtree_height: u8) -> bool {
        slot >> (subtree_height - self.height) == self.index
    }
}
