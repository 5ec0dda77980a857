//! Maps a chosen slice to a wheel rotation and back.
//!
//! Slices are laid out clockwise from the top of the wheel in pool order:
//! slice `i` spans `[-90 + i*arc, -90 + (i+1)*arc)` degrees in screen
//! coordinates. The pointer is fixed at the top, so landing on slice `i`
//! means rotating by `-(i + 0.5) * arc` (plus whole turns), which brings
//! the slice center to -90 degrees.

use rand::Rng;
use thiserror::Error;
use wheelspin_types::{
    RotationPlan, FULL_TURN_CHOICES, MAX_SPIN_SECONDS, MIN_FULL_TURNS, MIN_SPIN_SECONDS,
    POINTER_ANGLE,
};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AnimationError {
    #[error("wheel has no slices")]
    NoSlices,
    #[error("slice {index} out of range for {count} slices")]
    SliceOutOfRange { index: usize, count: usize },
}

/// Angular width of one slice, in degrees.
pub fn slice_arc(slice_count: usize) -> f64 {
    360.0 / slice_count as f64
}

/// Screen-space span `[start, end)` of slice `index` before any rotation.
pub fn slice_span(index: usize, slice_count: usize) -> (f64, f64) {
    let arc = slice_arc(slice_count);
    (
        POINTER_ANGLE + index as f64 * arc,
        POINTER_ANGLE + (index + 1) as f64 * arc,
    )
}

/// Rotation (less than one turn) that centers slice `index` under the pointer.
pub fn landing_offset(index: usize, slice_count: usize) -> f64 {
    -(index as f64 + 0.5) * slice_arc(slice_count)
}

/// Plan the rotation that lands the pointer on `chosen_index`.
///
/// The wheel makes 5, 6 or 7 full turns over 4.25 to 5.15 seconds. The start
/// angle is the caller's current rotation reduced to `[0, 360)`.
pub fn plan_rotation<R: Rng + ?Sized>(
    rng: &mut R,
    chosen_index: usize,
    slice_count: usize,
    current_rotation: f64,
) -> Result<RotationPlan, AnimationError> {
    if slice_count == 0 {
        return Err(AnimationError::NoSlices);
    }
    if chosen_index >= slice_count {
        return Err(AnimationError::SliceOutOfRange {
            index: chosen_index,
            count: slice_count,
        });
    }

    let full_turns = MIN_FULL_TURNS + rng.gen_range(0..FULL_TURN_CHOICES);
    let duration_seconds = rng.gen_range(MIN_SPIN_SECONDS..MAX_SPIN_SECONDS);
    let start_angle = if current_rotation.is_finite() {
        current_rotation.rem_euclid(360.0)
    } else {
        0.0
    };
    let end_angle = landing_offset(chosen_index, slice_count) + f64::from(full_turns) * 360.0;

    Ok(RotationPlan {
        start_angle,
        end_angle,
        full_turns,
        duration_seconds,
    })
}

/// Slice under the pointer after rotating the wheel by `rotation` degrees.
pub fn index_from_angle(rotation: f64, slice_count: usize) -> Result<usize, AnimationError> {
    if slice_count == 0 {
        return Err(AnimationError::NoSlices);
    }
    let slot = (-rotation / slice_arc(slice_count) - 0.5).round() as i64;
    Ok(slot.rem_euclid(slice_count as i64) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn test_round_trip_for_every_slice() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        for slice_count in 1..=50 {
            for index in 0..slice_count {
                let plan = plan_rotation(&mut rng, index, slice_count, 0.0).unwrap();
                assert_eq!(
                    index_from_angle(plan.end_angle, slice_count).unwrap(),
                    index,
                    "slice {index} of {slice_count}"
                );
            }
        }
    }

    #[test]
    fn test_slice_center_lands_under_pointer() {
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        for slice_count in [1usize, 2, 3, 7, 12, 37] {
            for index in 0..slice_count {
                let plan = plan_rotation(&mut rng, index, slice_count, 123.0).unwrap();
                let (start, end) = slice_span(index, slice_count);
                let center = (start + end) / 2.0 + plan.end_angle;
                let delta = (center - POINTER_ANGLE).rem_euclid(360.0);
                assert!(delta < 1e-6 || 360.0 - delta < 1e-6, "delta {delta}");
            }
        }
    }

    #[test]
    fn test_turns_and_duration_ranges() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let mut seen = [false; 3];
        for _ in 0..1000 {
            let plan = plan_rotation(&mut rng, 2, 8, 0.0).unwrap();
            assert!((5..=7).contains(&plan.full_turns));
            seen[(plan.full_turns - 5) as usize] = true;
            assert!(plan.duration_seconds >= 4.25 && plan.duration_seconds < 5.15);
            assert!(plan.end_angle > plan.start_angle);
        }
        assert_eq!(seen, [true; 3]);
    }

    #[test]
    fn test_start_angle_is_normalized() {
        let mut rng = ChaCha20Rng::seed_from_u64(6);
        let plan = plan_rotation(&mut rng, 0, 4, -30.0).unwrap();
        assert!((plan.start_angle - 330.0).abs() < 1e-9);
        let plan = plan_rotation(&mut rng, 0, 4, 725.0).unwrap();
        assert!((plan.start_angle - 5.0).abs() < 1e-9);
        let plan = plan_rotation(&mut rng, 0, 4, f64::NAN).unwrap();
        assert_eq!(plan.start_angle, 0.0);
    }

    #[test]
    fn test_index_from_angle_inside_slice() {
        // Anywhere strictly inside a slice reads back as that slice.
        let slice_count = 6;
        let arc = slice_arc(slice_count);
        for index in 0..slice_count {
            let center = landing_offset(index, slice_count);
            for nudge in [-0.49, -0.25, 0.0, 0.25, 0.49] {
                let rotation = center + nudge * arc + 720.0;
                assert_eq!(index_from_angle(rotation, slice_count).unwrap(), index);
            }
        }
    }

    #[test]
    fn test_invalid_slices() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        assert_eq!(
            plan_rotation(&mut rng, 0, 0, 0.0),
            Err(AnimationError::NoSlices)
        );
        assert_eq!(
            plan_rotation(&mut rng, 4, 4, 0.0),
            Err(AnimationError::SliceOutOfRange { index: 4, count: 4 })
        );
        assert_eq!(index_from_angle(10.0, 0), Err(AnimationError::NoSlices));
    }
}
