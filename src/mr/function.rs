//! The capability interface user code is invoked through, plus the stock
//! word-count application both binaries ship with.

use std::sync::mpsc;

use crate::mr::task::Pair;

/// Bound on in-flight pairs or values between user code and the engine; a
/// producer that gets this far ahead blocks until the consumer catches up.
pub(crate) const CHANNEL_DEPTH: usize = 64;

/// Emission handle passed to `Map` and `Reduce`. Dropping it signals
/// end-of-emission.
pub struct PairSender {
    tx: mpsc::SyncSender<Pair>,
}

impl PairSender {
    pub(crate) fn new(tx: mpsc::SyncSender<Pair>) -> Self {
        Self { tx }
    }

    /// Emit one pair. Blocks when the engine is behind.
    pub fn send(&self, key: impl Into<String>, value: impl Into<String>) -> anyhow::Result<()> {
        self.tx
            .send(Pair {
                key: key.into(),
                value: value.into(),
            })
            .map_err(|_| anyhow::anyhow!("emission channel closed"))
    }
}

/// Lazy stream of one key group's values, delivered in ascending order
/// without the group ever being materialized.
pub struct ValueStream {
    rx: mpsc::Receiver<String>,
}

impl ValueStream {
    pub(crate) fn new(rx: mpsc::Receiver<String>) -> Self {
        Self { rx }
    }
}

impl Iterator for ValueStream {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.rx.recv().ok()
    }
}

/// The two user-supplied functions of a job.
///
/// Both must be deterministic and must not touch the engine's files. `map`
/// sees one input pair per call; `reduce` sees one key with all of its
/// values. Values arrive in ascending order, but user code should not depend
/// on more than that.
pub trait UserFns: Send + Sync {
    fn map(&self, key: &str, value: &str, emit: PairSender) -> anyhow::Result<()>;
    fn reduce(&self, key: &str, values: ValueStream, emit: PairSender) -> anyhow::Result<()>;
}

/// Word count application.
pub mod wc {
    use anyhow::Context;
    use regex::Regex;

    use super::{PairSender, UserFns, ValueStream};

    pub struct WordCount {
        token: Regex,
    }

    impl WordCount {
        pub fn new() -> Self {
            Self {
                token: Regex::new(r"[\p{L}\p{N}]+").unwrap(),
            }
        }
    }

    impl Default for WordCount {
        fn default() -> Self {
            Self::new()
        }
    }

    impl UserFns for WordCount {
        /// Emits `(word, "1")` for every whitespace-separated field of the
        /// document, lowercased and stripped to its letter and digit runs.
        fn map(&self, _key: &str, value: &str, emit: PairSender) -> anyhow::Result<()> {
            for field in value.split_whitespace() {
                let lowered = field.to_lowercase();
                let word: String = self
                    .token
                    .find_iter(&lowered)
                    .map(|m| m.as_str())
                    .collect();
                if !word.is_empty() {
                    emit.send(word, "1")?;
                }
            }
            Ok(())
        }

        fn reduce(&self, key: &str, values: ValueStream, emit: PairSender) -> anyhow::Result<()> {
            let mut total: i64 = 0;
            for value in values {
                total += value
                    .parse::<i64>()
                    .with_context(|| format!("count {value:?} for key {key:?} is not a number"))?;
            }
            emit.send(key, total.to_string())
        }
    }
}
