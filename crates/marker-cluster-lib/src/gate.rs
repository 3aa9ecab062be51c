//! Region-change gate
//!
//! Host maps report many small region changes while a pan or zoom settles. Reclustering on
//! each of them is wasted work, so a new viewport only triggers a recomputation when it
//! differs noticeably from the one the current clusters were computed for.

use crate::Viewport;

/// A latitude span change above `1/15` of the previous span counts as a zoom
const ZOOM_CHANGE_DIVISOR: f64 = 15.0;

/// A center move of at least `1/10` of the previous span counts as a pan
const PAN_CHANGE_DIVISOR: f64 = 10.0;

/// Whether `new` moved far enough from `last` to justify reclustering
///
/// All thresholds are relative to `last`'s spans. A `last` viewport with a non-positive or
/// non-finite latitude span cannot express a threshold, so it always reclusters.
pub fn should_recluster(new: &Viewport, last: &Viewport) -> bool {
    if !(last.latitude_delta.is_finite() && last.latitude_delta > 0.0) {
        return true;
    }

    let zoomed = (new.latitude_delta - last.latitude_delta).abs()
        > last.latitude_delta / ZOOM_CHANGE_DIVISOR;
    let panned_east_west =
        (new.longitude - last.longitude).abs() >= last.longitude_delta / PAN_CHANGE_DIVISOR;
    let panned_north_south =
        (new.latitude - last.latitude).abs() >= last.latitude_delta / PAN_CHANGE_DIVISOR;

    zoomed || panned_east_west || panned_north_south
}
