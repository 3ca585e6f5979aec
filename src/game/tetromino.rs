use rand::Rng;
use serde::{Deserialize, Serialize};

/// Cell offsets `(dx, dy)` of one orientation, relative to the piece origin.
pub type Shape = [(i32, i32); 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TetrominoKind {
    I,
    O,
    T,
    S,
    Z,
    J,
    L,
}

impl TetrominoKind {
    pub const ALL: [TetrominoKind; 7] = [
        TetrominoKind::I,
        TetrominoKind::O,
        TetrominoKind::T,
        TetrominoKind::S,
        TetrominoKind::Z,
        TetrominoKind::J,
        TetrominoKind::L,
    ];

    /// The four orientations, in clockwise rotation order. Every orientation
    /// is anchored so its topmost cells sit at `dy == 0`.
    pub fn orientations(self) -> &'static [Shape; 4] {
        match self {
            TetrominoKind::I => &I_SHAPES,
            TetrominoKind::O => &O_SHAPES,
            TetrominoKind::T => &T_SHAPES,
            TetrominoKind::S => &S_SHAPES,
            TetrominoKind::Z => &Z_SHAPES,
            TetrominoKind::J => &J_SHAPES,
            TetrominoKind::L => &L_SHAPES,
        }
    }

    /// Value written into board cells when a piece of this kind locks.
    pub fn cell_value(self) -> u8 {
        match self {
            TetrominoKind::I => 1,
            TetrominoKind::O => 2,
            TetrominoKind::T => 3,
            TetrominoKind::S => 4,
            TetrominoKind::Z => 5,
            TetrominoKind::J => 6,
            TetrominoKind::L => 7,
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            TetrominoKind::I => "#00f0f0",
            TetrominoKind::O => "#f0f000",
            TetrominoKind::T => "#a000f0",
            TetrominoKind::S => "#00f000",
            TetrominoKind::Z => "#f00000",
            TetrominoKind::J => "#0000f0",
            TetrominoKind::L => "#f0a000",
        }
    }
}

const I_SHAPES: [Shape; 4] = [
    [(0, 0), (1, 0), (2, 0), (3, 0)],
    [(1, 0), (1, 1), (1, 2), (1, 3)],
    [(0, 0), (1, 0), (2, 0), (3, 0)],
    [(2, 0), (2, 1), (2, 2), (2, 3)],
];

const O_SHAPES: [Shape; 4] = [
    [(0, 0), (1, 0), (0, 1), (1, 1)],
    [(0, 0), (1, 0), (0, 1), (1, 1)],
    [(0, 0), (1, 0), (0, 1), (1, 1)],
    [(0, 0), (1, 0), (0, 1), (1, 1)],
];

const T_SHAPES: [Shape; 4] = [
    [(1, 0), (0, 1), (1, 1), (2, 1)],
    [(0, 0), (0, 1), (1, 1), (0, 2)],
    [(0, 0), (1, 0), (2, 0), (1, 1)],
    [(1, 0), (0, 1), (1, 1), (1, 2)],
];

const S_SHAPES: [Shape; 4] = [
    [(1, 0), (2, 0), (0, 1), (1, 1)],
    [(0, 0), (0, 1), (1, 1), (1, 2)],
    [(1, 0), (2, 0), (0, 1), (1, 1)],
    [(0, 0), (0, 1), (1, 1), (1, 2)],
];

const Z_SHAPES: [Shape; 4] = [
    [(0, 0), (1, 0), (1, 1), (2, 1)],
    [(1, 0), (0, 1), (1, 1), (0, 2)],
    [(0, 0), (1, 0), (1, 1), (2, 1)],
    [(1, 0), (0, 1), (1, 1), (0, 2)],
];

const J_SHAPES: [Shape; 4] = [
    [(0, 0), (0, 1), (1, 1), (2, 1)],
    [(0, 0), (1, 0), (0, 1), (0, 2)],
    [(0, 0), (1, 0), (2, 0), (2, 1)],
    [(1, 0), (1, 1), (0, 2), (1, 2)],
];

const L_SHAPES: [Shape; 4] = [
    [(2, 0), (0, 1), (1, 1), (2, 1)],
    [(0, 0), (0, 1), (0, 2), (1, 2)],
    [(0, 0), (1, 0), (2, 0), (0, 1)],
    [(0, 0), (1, 0), (1, 1), (1, 2)],
];

/// A falling piece: its kind, current orientation and the cells of that
/// orientation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tetromino {
    #[serde(rename = "type")]
    pub kind: TetrominoKind,
    pub rotation_index: u8,
    pub shape: Shape,
    pub color: String,
}

impl Tetromino {
    pub fn new(kind: TetrominoKind) -> Self {
        Self::with_rotation(kind, 0)
    }

    pub fn with_rotation(kind: TetrominoKind, rotation_index: u8) -> Self {
        let rotation_index = rotation_index % 4;
        Self {
            kind,
            rotation_index,
            shape: kind.orientations()[rotation_index as usize],
            color: kind.color().to_string(),
        }
    }

    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let kind = TetrominoKind::ALL[rng.gen_range(0..TetrominoKind::ALL.len())];
        Self::new(kind)
    }

    /// The next orientation in rotation order.
    pub fn rotated(&self) -> Self {
        Self::with_rotation(self.kind, self.rotation_index + 1)
    }

    /// Absolute board cells covered when the origin sits at `(x, y)`.
    pub fn cells_at(&self, x: i32, y: i32) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.shape.iter().map(move |&(dx, dy)| (x + dx, y + dy))
    }

    pub fn width(&self) -> i32 {
        self.shape.iter().map(|&(dx, _)| dx).max().unwrap_or(0) + 1
    }

    pub fn height(&self) -> i32 {
        self.shape.iter().map(|&(_, dy)| dy).max().unwrap_or(0) + 1
    }
}
