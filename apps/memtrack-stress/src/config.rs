//! Stress run configuration.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// Configuration of one stress run (from CLI or defaults).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StressConfig {
    /// Number of tracked buffers.
    pub buffers: usize,
    /// Size of each buffer in bytes.
    pub buffer_size: u64,
    /// Threads recording GPU writes.
    pub writers: usize,
    /// Threads flushing ranges back.
    pub flushers: usize,
    /// Operations per writer or flusher thread.
    pub operations: usize,
    /// Writes recorded between two closed batches.
    pub batch_length: usize,
    /// Every this many batches a buffer is replaced and its ranges inherited.
    pub migrate_every: usize,
    /// Seed of the per-thread address generators.
    pub seed: u64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            buffers: 8,
            buffer_size: 0x10_0000,
            writers: 4,
            flushers: 2,
            operations: 20_000,
            batch_length: 64,
            migrate_every: 16,
            seed: 42,
        }
    }
}

impl StressConfig {
    /// Parse overrides from command line arguments.
    pub fn from_args<I>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = Self::default();
        let mut args = args.into_iter().skip(1);

        while let Some(arg) = args.next() {
            let mut value = || {
                args.next()
                    .with_context(|| format!("missing value for {arg}"))
            };
            match arg.as_str() {
                "--buffers" => config.buffers = parse(&value()?, "--buffers")?,
                "--buffer-size" => config.buffer_size = parse(&value()?, "--buffer-size")?,
                "--writers" => config.writers = parse(&value()?, "--writers")?,
                "--flushers" => config.flushers = parse(&value()?, "--flushers")?,
                "--operations" => config.operations = parse(&value()?, "--operations")?,
                "--batch-length" => config.batch_length = parse(&value()?, "--batch-length")?,
                "--migrate-every" => config.migrate_every = parse(&value()?, "--migrate-every")?,
                "--seed" => config.seed = parse(&value()?, "--seed")?,
                other => bail!("unknown argument {other}"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.buffers == 0 || self.buffer_size == 0 {
            bail!("need at least one non-empty buffer");
        }
        if self.batch_length == 0 || self.migrate_every == 0 {
            bail!("batch length and migration interval must be non-zero");
        }
        Ok(())
    }

    #[must_use]
    pub const fn with_buffers(mut self, buffers: usize) -> Self {
        self.buffers = buffers;
        self
    }

    #[must_use]
    pub const fn with_threads(mut self, writers: usize, flushers: usize) -> Self {
        self.writers = writers;
        self.flushers = flushers;
        self
    }

    #[must_use]
    pub const fn with_operations(mut self, operations: usize) -> Self {
        self.operations = operations;
        self
    }
}

fn parse<T>(value: &str, flag: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("invalid value {value:?} for {flag}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("memtrack-stress")
            .chain(list.iter().copied())
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let config = StressConfig::from_args(args(&["--writers", "2", "--seed", "7"])).unwrap();
        assert_eq!(config.writers, 2);
        assert_eq!(config.seed, 7);
        assert_eq!(config.flushers, StressConfig::default().flushers);
    }

    #[test]
    fn bad_arguments_are_rejected() {
        assert!(StressConfig::from_args(args(&["--writers"])).is_err());
        assert!(StressConfig::from_args(args(&["--writers", "many"])).is_err());
        assert!(StressConfig::from_args(args(&["--buffers", "0"])).is_err());
        assert!(StressConfig::from_args(args(&["--frobnicate"])).is_err());
    }
}
