//! Environment contract between the launcher and the fault-injection
//! library.
//!
//! The launcher encodes the fuzzing parameters into the four variables
//! below; the injected library decodes them once at startup. Both sides go
//! through this module so the two encodings cannot drift apart.

use crate::options::LaunchOptions;

/// Where the library must write its debug stream: a file descriptor number
/// on unix, a raw handle value on windows.
pub const ENV_DEBUG_FD: &str = "GARBLE_DEBUGFD";
/// Seed of the pseudo-random corruption stream, a decimal `u32`.
pub const ENV_SEED: &str = "GARBLE_SEED";
/// Lowest corruption ratio, a decimal `f64`.
pub const ENV_MIN_RATIO: &str = "GARBLE_MINRATIO";
/// Highest corruption ratio, a decimal `f64`.
pub const ENV_MAX_RATIO: &str = "GARBLE_MAXRATIO";

/// Encode one launch's parameters. `debug_endpoint` is the debug channel's
/// write end as the target will see it, not as the launcher holds it.
pub(crate) fn fuzzing_vars(
    options: &LaunchOptions,
    debug_endpoint: u64,
) -> [(&'static str, String); 4] {
    [
        (ENV_DEBUG_FD, debug_endpoint.to_string()),
        (ENV_SEED, options.seed.to_string()),
        (ENV_MIN_RATIO, options.min_ratio.to_string()),
        (ENV_MAX_RATIO, options.max_ratio.to_string()),
    ]
}

/// Decode [`ENV_SEED`] the way the library side does.
pub fn parse_seed(value: &str) -> Option<u32> {
    value.parse().ok()
}

/// Decode [`ENV_MIN_RATIO`] or [`ENV_MAX_RATIO`].
pub fn parse_ratio(value: &str) -> Option<f64> {
    value.parse().ok()
}

/// Decode [`ENV_DEBUG_FD`].
pub fn parse_debug_endpoint(value: &str) -> Option<u64> {
    value.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars_for(seed: u32, min_ratio: f64, max_ratio: f64) -> [(&'static str, String); 4] {
        let options = LaunchOptions {
            seed,
            min_ratio,
            max_ratio,
            ..LaunchOptions::default()
        };
        fuzzing_vars(&options, 17)
    }

    #[test]
    fn seed_survives_the_round_trip() {
        for seed in [0, 1, 0xdead_beef, u32::MAX] {
            let [_, (_, encoded), _, _] = vars_for(seed, 0.0, 0.0);
            assert_eq!(parse_seed(&encoded), Some(seed));
        }
    }

    #[test]
    fn ratios_survive_the_round_trip() {
        for ratio in [0.0, 0.004, 0.1, 0.25, 0.333_333_333_333_333_3, 1.0] {
            let [_, _, (_, min), (_, max)] = vars_for(0, ratio, ratio);
            assert_eq!(parse_ratio(&min), Some(ratio));
            assert_eq!(parse_ratio(&max), Some(ratio));
        }
    }

    #[test]
    fn debug_endpoint_is_a_plain_decimal() {
        let [(name, value), _, _, _] = fuzzing_vars(&LaunchOptions::default(), 17);
        assert_eq!(name, ENV_DEBUG_FD);
        assert_eq!(value, "17");
        assert_eq!(parse_debug_endpoint(&value), Some(17));
    }

    #[test]
    fn contract_names_are_stable() {
        let names: Vec<&str> = vars_for(0, 0.0, 0.0).iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            ["GARBLE_DEBUGFD", "GARBLE_SEED", "GARBLE_MINRATIO", "GARBLE_MAXRATIO"],
        );
    }
}
