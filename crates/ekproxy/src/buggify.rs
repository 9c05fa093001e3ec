//! Probabilistic fault-injection guards, compiled in only with the
//! `buggify` cargo feature. Used by the refreshers to randomly classify
//! cache entries as refresh-eligible under simulation workloads. Always
//! inert in production builds.

/// Returns `true` with probability `p` when the `buggify` feature is
/// enabled; always `false` otherwise.
#[cfg(feature = "buggify")]
pub fn buggify_with_prob(p: f64) -> bool {
    rand::random::<f64>() < p
}

#[cfg(not(feature = "buggify"))]
pub fn buggify_with_prob(_p: f64) -> bool {
    false
}
