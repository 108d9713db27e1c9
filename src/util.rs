use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
use serde::Serialize;

/// Sentinel label that is excluded from every loss and metric.
pub const IGNORE_INDEX: i64 = -100;

/// Number of multiple-choice options per example.
pub const N_OPTIONS: usize = 7;

/// Number of fine-grained emotion classes.
pub const N_FINE_EMOTIONS: usize = 21;

/// Number of sentiment classes.
pub const N_SENTIMENTS: usize = 4;

/// Construct a deterministic RNG for one stream of a seeded run.
///
/// Different `(seed, stream)` pairs give unrelated generators, equal
/// pairs give identical generators on every replica.
pub fn seeded_rng(seed: u64, stream: u64) -> XorShiftRng {
    // SplitMix64 finalizer, so that neighbouring streams do not share state.
    let mut z = seed
        .wrapping_add(stream.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    XorShiftRng::seed_from_u64(z ^ (z >> 31))
}

/// Exponential moving average of a scalar, e.g. the training loss.
#[derive(Clone, Debug)]
pub struct RunningMeter {
    name: &'static str,
    smooth: f32,
    val: Option<f32>,
}

impl RunningMeter {
    pub fn new(name: &'static str) -> Self {
        RunningMeter {
            name,
            smooth: 0.99,
            val: None,
        }
    }

    pub fn update(&mut self, value: f32) {
        self.val = Some(match self.val {
            Some(val) => val * self.smooth + value * (1. - self.smooth),
            None => value,
        });
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current value, zero before the first update.
    pub fn val(&self) -> f32 {
        self.val.unwrap_or(0.)
    }
}

#[derive(Serialize)]
pub(crate) struct VersionInfo {
    idiomcloze_version: &'static str,
    git_desc: Option<&'static str>,
}

impl VersionInfo {
    pub(crate) fn new() -> Self {
        VersionInfo {
            idiomcloze_version: env!("CARGO_PKG_VERSION"),
            git_desc: option_env!("MAYBE_IDIOMCLOZE_GIT_DESC"),
        }
    }
}

#[cfg(test)]
pub use self::test::*;
