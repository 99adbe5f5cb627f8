//! D8 neighbourhood encoding

/// D8 flow directions.
///
/// A direction code names the neighbour a cell drains to. Codes follow the
/// 3x3 window read row by row, with the centre reserved:
///
/// ```text
///   1  2  3
///   4  5  6
///   7  8  9
/// ```
/// `0` = no outflow (no-data). A negative code is the same direction on a
/// cell with two or more inbound neighbours (a confluence).
pub mod d8 {
    /// No outflow
    pub const NO_FLOW: i8 = 0;

    /// Reserved centre code, never stored
    pub const CENTER: i8 = 5;

    /// Neighbour scan order: NW, N, NE, W, E, SW, S, SE
    pub const SCAN: [i8; 8] = [1, 2, 3, 4, 6, 7, 8, 9];

    /// Code for a unit offset, or `None` for the centre and non-neighbours
    pub fn encode(dx: isize, dy: isize) -> Option<i8> {
        if !(-1..=1).contains(&dx) || !(-1..=1).contains(&dy) || (dx == 0 && dy == 0) {
            return None;
        }
        Some(((dy + 1) * 3 + (dx + 1) + 1) as i8)
    }

    /// Offset (dx, dy) of a code; the confluence sign is ignored
    #[inline]
    pub fn offset(code: i8) -> Option<(isize, isize)> {
        let code = code.unsigned_abs() as isize;
        if code == 0 || code == CENTER as isize || code > 9 {
            return None;
        }
        let k = code - 1;
        Some((k % 3 - 1, k / 3 - 1))
    }

    /// Horizontal distance factor: 1 for axis neighbours, sqrt(2) for diagonals
    #[inline]
    pub fn distance(code: i8) -> f64 {
        match offset(code) {
            Some((dx, dy)) if dx != 0 && dy != 0 => std::f64::consts::SQRT_2,
            Some(_) => 1.0,
            None => 0.0,
        }
    }

    /// Code pointing back from the neighbour to the centre
    #[inline]
    pub fn opposite(code: i8) -> i8 {
        match code.unsigned_abs() {
            0 => 0,
            c => 10 - c as i8,
        }
    }

    #[inline]
    pub fn is_confluence(code: i8) -> bool {
        code < 0
    }

    /// Neighbour positions of (x, y) in scan order, with the scan code
    pub fn neighbors(x: isize, y: isize) -> impl Iterator<Item = (i8, isize, isize)> {
        SCAN.into_iter().filter_map(move |code| {
            offset(code).map(|(dx, dy)| (code, x + dx, y + dy))
        })
    }
}
