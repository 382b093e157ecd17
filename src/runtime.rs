//! Runtime: process-wide default seed for deterministic behavior.
//! Same input, same seed, same parameters -> same output.
//!
//! This thread-local RNG backs [`crate::init`]'s initializers and is the
//! default source [`crate::layer::LayerBase::new`] draws from when a layer
//! isn't given an explicit `rng` via [`crate::options::LayerOptions`]. Each
//! layer then owns its own `StdRng` going forward, seeded once here, so a
//! layer's dropout masks and weight init draw from an independent stream
//! rather than contending over one global RNG during training.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;

thread_local! {
    static RNG: RefCell<Option<StdRng>> = RefCell::new(None);
}

/// Set the global random seed for this thread. Call before constructing any
/// layer to get reproducible per-layer RNG streams.
pub fn set_seed(seed: u64) {
    RNG.with(|rng| {
        *rng.borrow_mut() = Some(StdRng::seed_from_u64(seed));
    });
}

/// Run closure with the thread-local RNG (initialized from seed 0 if not set).
pub fn with_rng<F, T>(f: F) -> T
where
    F: FnOnce(&mut StdRng) -> T,
{
    RNG.with(|rng| {
        let mut opt = rng.borrow_mut();
        if opt.is_none() {
            *opt = Some(StdRng::seed_from_u64(0));
        }
        f(opt.as_mut().unwrap())
    })
}

/// Derive a fresh, independently seeded `StdRng` from the thread-local
/// stream. Used by `LayerBase::new` when the caller doesn't inject an `rng`.
pub fn child_rng() -> StdRng {
    with_rng(|rng| StdRng::seed_from_u64(rand::Rng::gen(rng)))
}
