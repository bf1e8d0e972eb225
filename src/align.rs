/// Calculates the machine word alignment for the given size.
///
/// # Examples
///
/// ```rust
/// use tagalloc::align;
///
/// match std::mem::size_of::<usize>() {
///     8 => assert_eq!(align!(13), 16), // 64 bit machine.
///     4 => assert_eq!(align!(11), 12), // 32 bit machine.
///     _ => {},
/// };
/// ```
#[macro_export]
macro_rules! align {
  ($value:expr) => {
    $crate::align_to!($value, ::core::mem::size_of::<usize>())
  };
}

/// Rounds `value` up to the next multiple of `to`, which must be a power of two.
///
/// ```rust
/// use tagalloc::align_to;
///
/// assert_eq!(align_to!(4097, 4096), 8192);
/// assert_eq!(align_to!(4096, 4096), 4096);
/// ```
#[macro_export]
macro_rules! align_to {
  ($value:expr, $to:expr) => {
    ($value + $to - 1) & !($to - 1)
  };
}

/// Rounds `value` down to a multiple of `to`, which must be a power of two.
#[macro_export]
macro_rules! align_down {
  ($value:expr, $to:expr) => {
    $value & !($to - 1)
  };
}
