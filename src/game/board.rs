use serde::{Deserialize, Serialize};

/// A board cell is either empty or owned by exactly one locked piece.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireCell", into = "WireCell")]
pub enum Cell {
    Empty,
    Occupied { value: u8, owner_id: String },
}

impl Cell {
    pub fn is_empty(&self) -> bool {
        matches!(self, Cell::Empty)
    }

    pub fn owner(&self) -> Option<&str> {
        match self {
            Cell::Empty => None,
            Cell::Occupied { owner_id, .. } => Some(owner_id),
        }
    }
}

/// Wire form: `0` for an empty cell, `{value, ownerId}` otherwise.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireCell {
    Empty(u8),
    #[serde(rename_all = "camelCase")]
    Occupied {
        value: u8,
        owner_id: String,
    },
}

impl From<WireCell> for Cell {
    fn from(wire: WireCell) -> Self {
        match wire {
            WireCell::Empty(_) => Cell::Empty,
            WireCell::Occupied { value, owner_id } => Cell::Occupied { value, owner_id },
        }
    }
}

impl From<Cell> for WireCell {
    fn from(cell: Cell) -> Self {
        match cell {
            Cell::Empty => WireCell::Empty(0),
            Cell::Occupied { value, owner_id } => WireCell::Occupied { value, owner_id },
        }
    }
}

/// The shared playfield. Row 0 is the top row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    rows: usize,
    cols: usize,
    grid: Vec<Vec<Cell>>,
}

impl Board {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            grid: vec![vec![Cell::Empty; cols]; rows],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as usize) < self.cols && (y as usize) < self.rows
    }

    pub fn get(&self, x: i32, y: i32) -> Option<&Cell> {
        if !self.in_bounds(x, y) {
            return None;
        }
        Some(&self.grid[y as usize][x as usize])
    }

    /// True when `(x, y)` is inside the board and holds a locked cell.
    pub fn is_occupied(&self, x: i32, y: i32) -> bool {
        self.get(x, y).is_some_and(|c| !c.is_empty())
    }

    /// Writes a cell. Out-of-bounds writes are ignored.
    pub fn set(&mut self, x: i32, y: i32, cell: Cell) {
        if self.in_bounds(x, y) {
            self.grid[y as usize][x as usize] = cell;
        }
    }

    pub fn row(&self, y: usize) -> Option<&[Cell]> {
        self.grid.get(y).map(Vec::as_slice)
    }

    pub fn is_row_full(&self, y: usize) -> bool {
        self.grid
            .get(y)
            .is_some_and(|row| row.iter().all(|c| !c.is_empty()))
    }

    /// Indices of every completely occupied row, top to bottom.
    pub fn full_rows(&self) -> Vec<usize> {
        (0..self.rows).filter(|&y| self.is_row_full(y)).collect()
    }

    /// Removes the given rows and inserts as many empty rows at the top, so
    /// the board keeps its height.
    pub fn remove_rows(&mut self, rows: &[usize]) {
        let mut removed = 0;
        let mut kept = Vec::with_capacity(self.rows);
        for (y, row) in self.grid.drain(..).enumerate() {
            if rows.contains(&y) {
                removed += 1;
            } else {
                kept.push(row);
            }
        }
        let mut grid = vec![vec![Cell::Empty; self.cols]; removed];
        grid.extend(kept);
        self.grid = grid;
    }

    /// Empties every cell owned by `owner_id`. Returns how many were cleared.
    pub fn scrub_owner(&mut self, owner_id: &str) -> usize {
        let mut cleared = 0;
        for cell in self.grid.iter_mut().flatten() {
            if cell.owner() == Some(owner_id) {
                *cell = Cell::Empty;
                cleared += 1;
            }
        }
        cleared
    }

    /// Moves ownership of every cell from `from` to `to`.
    pub fn transfer_owner(&mut self, from: &str, to: &str) {
        for cell in self.grid.iter_mut().flatten() {
            if let Cell::Occupied { owner_id, .. } = cell {
                if owner_id == from {
                    *owner_id = to.to_string();
                }
            }
        }
    }

    pub fn occupied_count(&self) -> usize {
        self.grid.iter().flatten().filter(|c| !c.is_empty()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occupied(owner: &str) -> Cell {
        Cell::Occupied {
            value: 1,
            owner_id: owner.to_string(),
        }
    }

    fn fill_row(board: &mut Board, y: i32, owner: &str) {
        for x in 0..board.cols() as i32 {
            board.set(x, y, occupied(owner));
        }
    }

    #[test]
    fn test_new_board_is_empty() {
        let board = Board::new(20, 10);
        assert_eq!(board.rows(), 20);
        assert_eq!(board.cols(), 10);
        assert_eq!(board.occupied_count(), 0);
        assert!(board.full_rows().is_empty());
    }

    #[test]
    fn test_bounds_checks() {
        let board = Board::new(20, 10);
        assert!(board.in_bounds(0, 0));
        assert!(board.in_bounds(9, 19));
        assert!(!board.in_bounds(10, 0));
        assert!(!board.in_bounds(0, 20));
        assert!(!board.in_bounds(-1, 3));
        assert!(board.get(-1, 0).is_none());
        assert!(!board.is_occupied(-1, 0));
    }

    #[test]
    fn test_remove_rows_keeps_height_and_shifts_cells_down() {
        let mut board = Board::new(6, 4);
        board.set(1, 2, occupied("a"));
        fill_row(&mut board, 5, "b");
        assert_eq!(board.full_rows(), vec![5]);

        board.remove_rows(&[5]);

        assert_eq!(board.rows(), 6);
        assert!(board.full_rows().is_empty());
        assert!(board.row(0).unwrap().iter().all(Cell::is_empty));
        assert!(board.is_occupied(1, 3));
        assert!(!board.is_occupied(1, 2));
    }

    #[test]
    fn test_remove_multiple_rows() {
        let mut board = Board::new(6, 4);
        fill_row(&mut board, 3, "a");
        fill_row(&mut board, 5, "a");
        board.set(0, 4, occupied("b"));

        board.remove_rows(&[3, 5]);

        assert_eq!(board.occupied_count(), 1);
        assert!(board.is_occupied(0, 5));
    }

    #[test]
    fn test_scrub_owner_only_touches_that_owner() {
        let mut board = Board::new(4, 4);
        board.set(0, 3, occupied("a"));
        board.set(1, 3, occupied("b"));
        board.set(2, 3, occupied("a"));

        assert_eq!(board.scrub_owner("a"), 2);
        assert_eq!(board.occupied_count(), 1);
        assert_eq!(board.get(1, 3).and_then(Cell::owner), Some("b"));
    }

    #[test]
    fn test_transfer_owner_renames_cells() {
        let mut board = Board::new(4, 4);
        board.set(0, 3, occupied("old"));
        board.transfer_owner("old", "new");
        assert_eq!(board.get(0, 3).and_then(Cell::owner), Some("new"));
    }

    #[test]
    fn test_cell_wire_format() {
        assert_eq!(serde_json::to_string(&Cell::Empty).unwrap(), "0");
        let json = serde_json::to_string(&occupied("p1")).unwrap();
        assert_eq!(json, r#"{"value":1,"ownerId":"p1"}"#);
        let back: Cell = serde_json::from_str(&json).unwrap();
        assert_eq!(back, occupied("p1"));
        let empty: Cell = serde_json::from_str("0").unwrap();
        assert!(empty.is_empty());
    }
}
