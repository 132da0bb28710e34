// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use option_parser::{OptionParser, Toggle};

pub const DEFAULT_RND_SOURCE: &str = "/dev/random";

/// What to do when a read from the validated entropy source reports no
/// data. The source is probed at attach time and is expected to stay ready
/// for the lifetime of the device, so this is a contract violation either
/// way; the policy only decides how loudly the device reacts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadFailurePolicy {
    /// Release the offending chain with a zero-length completion and keep
    /// servicing the queue.
    #[default]
    ZeroLength,
    /// Release the offending chain with a zero-length completion, then mark
    /// the source invalid so every later batch completes without data.
    Disable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RndConfig {
    /// Hand virtqueue servicing to the in-kernel backend once the guest
    /// driver is ready.
    pub kernel: bool,
    pub on_read_failure: ReadFailurePolicy,
}

impl Default for RndConfig {
    fn default() -> Self {
        RndConfig {
            kernel: false,
            on_read_failure: ReadFailurePolicy::default(),
        }
    }
}

impl RndConfig {
    /// Parse a device option string such as `"kernel=on"`.
    ///
    /// Unrecognized or malformed tokens are logged and skipped; they never
    /// prevent the device from attaching. A value the `kernel` toggle does
    /// not understand counts as malformed and leaves the toggle off.
    pub fn parse(opts: &str) -> Self {
        let mut parser = OptionParser::new();
        parser.add("kernel");

        for token in parser.parse(opts) {
            warn!("virtio-rnd: ignoring option '{}'", token);
        }

        let kernel = match parser.convert::<Toggle>("kernel") {
            Ok(toggle) => toggle.unwrap_or(Toggle(false)).0,
            Err(e) => {
                warn!("virtio-rnd: ignoring option 'kernel': {}", e);
                false
            }
        };

        RndConfig {
            kernel,
            on_read_failure: ReadFailurePolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_toggle() {
        assert!(RndConfig::parse("kernel=on").kernel);
        assert!(RndConfig::parse("kernel=true").kernel);
        assert!(!RndConfig::parse("kernel=off").kernel);
        assert!(!RndConfig::parse("kernel=false").kernel);
    }

    #[test]
    fn test_parse_lenient() {
        // Unknown tokens are skipped without affecting known ones.
        assert!(RndConfig::parse("foo,kernel=on").kernel);
        assert!(RndConfig::parse("kernel=on,bar=1").kernel);

        // Malformed or absent toggles leave the offload disabled.
        assert!(!RndConfig::parse("").kernel);
        assert!(!RndConfig::parse("kernel").kernel);
        assert!(!RndConfig::parse("kernel=bogus").kernel);
        assert!(!RndConfig::parse("garbage").kernel);
    }

    #[test]
    fn test_defaults() {
        let config = RndConfig::default();
        assert!(!config.kernel);
        assert_eq!(config.on_read_failure, ReadFailurePolicy::ZeroLength);
    }
}
