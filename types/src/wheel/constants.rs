/// Smallest cycle a guaranteed-prize policy can use.
pub const MIN_CYCLE_LENGTH: u32 = 2;

/// Hard ceiling on cycle length when the pool size is unknown at write time.
pub const MAX_CYCLE_LENGTH: u32 = 100;

/// Default number of history entries returned by a query.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Largest page of history a single query may return.
pub const MAX_HISTORY_LIMIT: usize = 500;

/// Minimum number of whole turns the wheel makes before settling.
pub const MIN_FULL_TURNS: u32 = 5;

/// Number of distinct turn counts drawn on top of [MIN_FULL_TURNS].
pub const FULL_TURN_CHOICES: u32 = 3;

/// Shortest spin animation, in seconds.
pub const MIN_SPIN_SECONDS: f64 = 4.25;

/// Upper (exclusive) bound of the spin animation, in seconds.
pub const MAX_SPIN_SECONDS: f64 = 5.15;

/// Angle of the pointer (12 o'clock) in screen coordinates, in degrees.
pub const POINTER_ANGLE: f64 = -90.0;
