use crate::config::RandomPreference;
use crate::error::HostError;

/// Largest buffer a single fill may request.
pub const MAX_FILL: usize = 65_536;

/// Where secure random bytes come from, decided once at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandomSource {
    Os,
    Unavailable,
}

impl RandomSource {
    pub fn detect(preference: RandomPreference) -> Self {
        match preference {
            RandomPreference::Disabled => RandomSource::Unavailable,
            RandomPreference::Auto => {
                let mut byte = [0u8; 1];
                match getrandom::getrandom(&mut byte) {
                    Ok(()) => RandomSource::Os,
                    Err(err) => {
                        tracing::warn!(error = %err, "no operating system random source");
                        RandomSource::Unavailable
                    }
                }
            }
        }
    }

    /// Reject requests larger than [`MAX_FILL`] before any buffer exists.
    pub fn check_quota(len: usize) -> Result<(), HostError> {
        if len > MAX_FILL {
            return Err(HostError::new(
                "QuotaExceededError",
                format!("requested {len} random bytes, limit is {MAX_FILL}"),
            ));
        }
        Ok(())
    }

    pub fn fill(&self, buf: &mut [u8]) -> Result<(), HostError> {
        Self::check_quota(buf.len())?;
        match self {
            RandomSource::Os => getrandom::getrandom(buf)
                .map_err(|err| HostError::new("OperationError", err.to_string())),
            RandomSource::Unavailable => Err(HostError::new(
                "NotSupportedError",
                "secure random number generation is not supported",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_source_fills_buffers() {
        let source = RandomSource::detect(RandomPreference::Auto);
        assert_eq!(source, RandomSource::Os);
        let mut buf = [0u8; 64];
        source.fill(&mut buf).expect("fill");
        assert!(buf.iter().any(|b| *b != 0));
    }

    #[test]
    fn disabled_source_and_oversized_requests_fail() {
        let mut buf = [0u8; 4];
        let err = RandomSource::detect(RandomPreference::Disabled)
            .fill(&mut buf)
            .expect_err("disabled");
        assert_eq!(err.name, "NotSupportedError");

        let mut big = vec![0u8; MAX_FILL + 1];
        let err = RandomSource::Os.fill(&mut big).expect_err("too large");
        assert_eq!(err.name, "QuotaExceededError");
    }
}
