use crate::stat::CallerFrame;

/// Captures the application frames that issued a query, nearest caller first.
pub trait CallerSampler: Send + Sync {
    /// Returns at most `max_depth` frames. A depth of zero must not walk the stack.
    fn sample(&self, max_depth: usize) -> Vec<CallerFrame>;
}

/// Sampler for platforms without unwinding support, or when caller capture is unwanted.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSampler;

impl CallerSampler for NoopSampler {
    fn sample(&self, _max_depth: usize) -> Vec<CallerFrame> {
        Vec::new()
    }
}

/// Symbol prefixes that never belong to the application issuing a query.
const INTERNAL_PREFIXES: [&str; 14] = [
    concat!(env!("CARGO_CRATE_NAME"), "::"),
    "backtrace::",
    "tokio_postgres::",
    "deadpool_postgres::",
    "deadpool::",
    "postgres::",
    "tokio::",
    "futures_util::",
    "futures::",
    "std::",
    "core::",
    "alloc::",
    "__rust",
    "_start",
];

/// Walks the live call stack with the `backtrace` crate.
#[derive(Clone, Debug)]
pub struct BacktraceSampler {
    skip: Vec<String>,
}

impl Default for BacktraceSampler {
    fn default() -> Self {
        Self { skip: INTERNAL_PREFIXES.iter().map(|p| p.to_string()).collect() }
    }
}

impl BacktraceSampler {
    /// Also skips frames whose symbol starts with `prefix`, e.g. the module path of a database access layer.
    pub fn with_skip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.skip.push(prefix.into());
        self
    }

    fn is_internal(&self, symbol: &str) -> bool {
        let symbol = symbol.trim_start_matches('<');
        self.skip.iter().any(|prefix| symbol.starts_with(prefix.as_str()))
    }
}

impl CallerSampler for BacktraceSampler {
    fn sample(&self, max_depth: usize) -> Vec<CallerFrame> {
        if max_depth < 1 {
            return Vec::new();
        }
        let mut frames = Vec::with_capacity(max_depth);
        backtrace::trace(|frame| {
            // inlined functions resolve to several symbols for one frame
            backtrace::resolve_frame(frame, |symbol| {
                if frames.len() >= max_depth {
                    return;
                }
                let Some(name) = symbol.name() else {
                    return;
                };
                let function = format!("{name:#}");
                if self.is_internal(&function) {
                    return;
                }
                frames.push(CallerFrame {
                    file: symbol.filename().map(|f| f.display().to_string()).unwrap_or_default(),
                    line: symbol.lineno().unwrap_or_default(),
                    function,
                });
            });
            frames.len() < max_depth
        });
        frames
    }
}
