/// Round up `n` to the nearest `to`
pub fn round_up(n: usize, to: usize) -> usize {
    to * ((n + to - 1) / to)
}

/// Test if `n` is a non-zero multiple of `of`
pub fn is_multiple_of(n: usize, of: usize) -> bool {
    of != 0 && n != 0 && n % of == 0
}
